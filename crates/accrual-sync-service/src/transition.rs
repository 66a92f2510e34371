//! 订单状态迁移
//!
//! 在单个事务内完成：锁定订单、写入状态和积分、按条件入账、删除或重新调度任务。
//! 任意一步失败整体回滚，任务保留等待下次同步。
//!
//! ## 幂等性
//!
//! 同一任务可能被重复投递。每次迁移都先 `FOR UPDATE` 重新读取订单，
//! 已是终态的订单不会被改写也不会重复入账，只清理残留任务。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use loyalty_shared::observability::metrics;
use loyalty_shared::retry::RetryPolicy;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::money::round_money;
use crate::models::{Job, Order, OrderStatus};
use crate::repository::{TransactionalStore, UnitOfWork};

/// 一次迁移的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// 订单进入终态，任务已删除；`credited` 为本次入账积分
    Finalized {
        status: OrderStatus,
        credited: Option<Decimal>,
    },
    /// 订单仍在处理中，任务保留并重新调度
    Pending { status: OrderStatus, attempts: i32 },
    /// 本次未得到确定结果，任务保留并重新调度
    Deferred { attempts: i32 },
    /// 外部状态无法识别：任务行不变，只推迟订单的下次可同步时间
    Held { attempts: i32 },
    /// 订单已是终态，清理了残留任务
    AlreadyFinal,
    /// 订单不存在，清理了孤立任务
    OrphanRemoved,
}

impl TransitionResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Finalized { .. } => "finalized",
            Self::Pending { .. } => "pending",
            Self::Deferred { .. } => "deferred",
            Self::Held { .. } => "held",
            Self::AlreadyFinal => "already_final",
            Self::OrphanRemoved => "orphan_removed",
        }
    }
}

/// 状态迁移引擎
pub struct TransitionEngine<S: ?Sized> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S> TransitionEngine<S>
where
    S: TransactionalStore + ?Sized,
{
    pub fn new(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// 应用外部服务给出的订单状态
    #[instrument(skip(self, job), fields(job_id = job.id, order_id = job.order_id))]
    pub async fn apply(
        &self,
        job: &Job,
        remote: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<TransitionResult> {
        let mut uow = self.store.begin().await?;

        let order = match self.lock_live_order(uow.as_mut(), job).await? {
            Ok(order) => order,
            Err(result) => {
                uow.commit().await?;
                metrics::record_transition(result.label());
                return Ok(result);
            }
        };

        let next = order.status.advance_to(remote);

        let result = if next.is_terminal() {
            let accrual = match next {
                OrderStatus::Processed => accrual.map(round_money),
                _ => None,
            };
            uow.update_order_state(order.id, next, accrual).await?;

            let credited = match accrual {
                Some(amount) if amount > Decimal::ZERO => {
                    uow.credit_balance(order.user_id, amount).await?;
                    Some(amount)
                }
                _ => None,
            };

            uow.delete_job(job.id).await?;
            uow.commit().await?;

            if let Some(amount) = credited {
                metrics::record_accrual_credit(amount.to_f64().unwrap_or_default());
            }
            info!(
                order_number = %order.order_number,
                user_id = %order.user_id,
                status = %next,
                accrual = ?accrual,
                "订单积分同步完成"
            );

            TransitionResult::Finalized {
                status: next,
                credited,
            }
        } else {
            if next != order.status {
                uow.update_order_state(order.id, next, None).await?;
            }
            let attempts = self.reschedule(uow.as_mut(), &order, job).await?;
            uow.commit().await?;

            debug!(status = %next, attempts, "订单仍在处理中");
            TransitionResult::Pending {
                status: next,
                attempts,
            }
        };

        metrics::record_transition(result.label());
        Ok(result)
    }

    /// 本次未得到确定结果，保留任务并按退避策略重新调度
    #[instrument(skip(self, job), fields(job_id = job.id, order_id = job.order_id))]
    pub async fn defer(&self, job: &Job, reason: &str) -> Result<TransitionResult> {
        let mut uow = self.store.begin().await?;

        let order = match self.lock_live_order(uow.as_mut(), job).await? {
            Ok(order) => order,
            Err(result) => {
                uow.commit().await?;
                metrics::record_transition(result.label());
                return Ok(result);
            }
        };

        let attempts = self.reschedule(uow.as_mut(), &order, job).await?;
        uow.commit().await?;

        debug!(reason, attempts, "订单同步推迟");
        let result = TransitionResult::Deferred { attempts };
        metrics::record_transition(result.label());
        Ok(result)
    }

    /// 外部状态无法识别时推迟订单
    ///
    /// 任务行保持原样，但订单记录一次尝试并设置下次可同步时间，
    /// 避免这类任务一直排在队首挤占每轮拉取。
    #[instrument(skip(self, job), fields(job_id = job.id, order_id = job.order_id))]
    pub async fn hold(&self, job: &Job, remote_status: &str) -> Result<TransitionResult> {
        let mut uow = self.store.begin().await?;

        let order = match self.lock_live_order(uow.as_mut(), job).await? {
            Ok(order) => order,
            Err(result) => {
                uow.commit().await?;
                metrics::record_transition(result.label());
                return Ok(result);
            }
        };

        uow.record_attempt(order.id, self.next_attempt_at(order.attempts))
            .await?;
        uow.commit().await?;

        let result = TransitionResult::Held {
            attempts: order.attempts + 1,
        };
        debug!(remote_status, attempts = order.attempts + 1, "未知状态，订单推迟");
        metrics::record_transition(result.label());
        Ok(result)
    }

    /// 锁定订单；订单缺失或已是终态时删除任务并返回对应结果
    async fn lock_live_order(
        &self,
        uow: &mut dyn UnitOfWork,
        job: &Job,
    ) -> Result<std::result::Result<Order, TransitionResult>> {
        match uow.lock_order(job.order_id).await? {
            None => {
                uow.delete_job(job.id).await?;
                warn!("订单不存在，删除孤立任务");
                Ok(Err(TransitionResult::OrphanRemoved))
            }
            Some(order) if order.status.is_terminal() => {
                uow.delete_job(job.id).await?;
                debug!(status = %order.status, "订单已是终态，删除残留任务");
                Ok(Err(TransitionResult::AlreadyFinal))
            }
            Some(order) => Ok(Ok(order)),
        }
    }

    /// 记录一次尝试并标记任务，返回累计尝试次数
    async fn reschedule(&self, uow: &mut dyn UnitOfWork, order: &Order, job: &Job) -> Result<i32> {
        uow.record_attempt(order.id, self.next_attempt_at(order.attempts))
            .await?;
        uow.touch_job(job.id).await?;
        Ok(order.attempts + 1)
    }

    /// 按已失败次数计算下次可同步时间，超出时间范围时取最大值
    fn next_attempt_at(&self, attempts: i32) -> DateTime<Utc> {
        let delay = self
            .policy
            .delay_for_attempt(u32::try_from(attempts).unwrap_or(0));
        let now = Utc::now();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewOrder, UserId};
    use crate::repository::{JobRepositoryTrait, MemoryStore};
    use std::time::Duration;

    fn immediate_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: u32::MAX,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    async fn setup(number: &str) -> (Arc<MemoryStore>, TransitionEngine<MemoryStore>, Job) {
        let store = Arc::new(MemoryStore::new());
        store.seed_user(UserId(1), Decimal::ZERO).await;

        let mut uow = store.begin().await.unwrap();
        let order = uow
            .insert_order(&NewOrder {
                order_number: number.to_string(),
                user_id: UserId(1),
            })
            .await
            .unwrap()
            .unwrap();
        uow.insert_job(order.id).await.unwrap();
        uow.commit().await.unwrap();

        let job = store.fetch_due(1).await.unwrap().remove(0);
        let engine = TransitionEngine::new(store.clone(), immediate_policy());
        (store, engine, job)
    }

    #[tokio::test]
    async fn test_processed_credits_and_removes_job() {
        let (store, engine, job) = setup("4561261212345467").await;

        let result = engine
            .apply(&job, OrderStatus::Processed, Some(Decimal::new(500, 0)))
            .await
            .unwrap();

        assert_eq!(
            result,
            TransitionResult::Finalized {
                status: OrderStatus::Processed,
                credited: Some(Decimal::new(50000, 2)),
            }
        );
        let order = store.order(job.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual.unwrap().to_string(), "500.00");
        assert!(store.job_for_order(job.order_id).await.is_none());
        assert_eq!(
            store.get_balance(UserId(1)).await.unwrap().current,
            Decimal::new(500, 0)
        );
    }

    #[tokio::test]
    async fn test_redelivered_job_is_not_credited_twice() {
        let (store, engine, job) = setup("79927398713").await;

        engine
            .apply(&job, OrderStatus::Processed, Some(Decimal::new(100, 0)))
            .await
            .unwrap();
        let second = engine
            .apply(&job, OrderStatus::Processed, Some(Decimal::new(100, 0)))
            .await
            .unwrap();

        assert_eq!(second, TransitionResult::AlreadyFinal);
        assert_eq!(
            store.get_balance(UserId(1)).await.unwrap().current,
            Decimal::new(100, 0)
        );
    }

    #[tokio::test]
    async fn test_invalid_is_terminal_without_credit() {
        let (store, engine, job) = setup("79927398713").await;

        let result = engine
            .apply(&job, OrderStatus::Invalid, Some(Decimal::new(100, 0)))
            .await
            .unwrap();

        assert_eq!(
            result,
            TransitionResult::Finalized {
                status: OrderStatus::Invalid,
                credited: None,
            }
        );
        let order = store.order(job.order_id).await.unwrap();
        assert_eq!(order.accrual, None);
        assert_eq!(store.get_balance(UserId(1)).await.unwrap().current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_zero_accrual_finalizes_without_credit() {
        let (store, engine, job) = setup("79927398713").await;

        let result = engine
            .apply(&job, OrderStatus::Processed, Some(Decimal::ZERO))
            .await
            .unwrap();

        assert!(matches!(
            result,
            TransitionResult::Finalized { credited: None, .. }
        ));
        assert!(store.job_for_order(job.order_id).await.is_none());
        assert_eq!(store.get_balance(UserId(1)).await.unwrap().current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_processing_does_not_regress() {
        let (store, engine, job) = setup("79927398713").await;

        engine.apply(&job, OrderStatus::Processing, None).await.unwrap();
        let result = engine.apply(&job, OrderStatus::New, None).await.unwrap();

        assert_eq!(
            result,
            TransitionResult::Pending {
                status: OrderStatus::Processing,
                attempts: 2,
            }
        );
        let order = store.order(job.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.attempts, 2);
        let kept = store.job_for_order(job.order_id).await.unwrap();
        assert!(kept.pooled_at.is_some());
    }

    #[tokio::test]
    async fn test_defer_keeps_job_and_counts_attempts() {
        let (store, engine, job) = setup("79927398713").await;

        for expected in 1..=3 {
            let result = engine.defer(&job, "not_registered").await.unwrap();
            assert_eq!(result, TransitionResult::Deferred { attempts: expected });
        }

        let order = store.order(job.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.attempts, 3);
        assert!(store.job_for_order(job.order_id).await.is_some());
    }

    #[tokio::test]
    async fn test_defer_schedules_backoff() {
        let store = Arc::new(MemoryStore::new());
        store.seed_user(UserId(1), Decimal::ZERO).await;
        let mut uow = store.begin().await.unwrap();
        let order = uow
            .insert_order(&NewOrder {
                order_number: "79927398713".to_string(),
                user_id: UserId(1),
            })
            .await
            .unwrap()
            .unwrap();
        uow.insert_job(order.id).await.unwrap();
        uow.commit().await.unwrap();
        let job = store.fetch_due(1).await.unwrap().remove(0);

        let engine = TransitionEngine::new(
            store.clone(),
            RetryPolicy {
                max_retries: u32::MAX,
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(600),
                multiplier: 2.0,
            },
        );
        engine.defer(&job, "unavailable").await.unwrap();

        let order = store.order(order.id).await.unwrap();
        assert!(order.next_attempt.unwrap() > Utc::now());
        assert!(store.fetch_due(10).await.unwrap().is_empty());
        assert!(store.job_for_order(order.id).await.is_some());
    }

    #[tokio::test]
    async fn test_hold_postpones_order_without_touching_job() {
        let (store, _, job) = setup("79927398713").await;
        let engine = TransitionEngine::new(
            store.clone(),
            RetryPolicy {
                max_retries: u32::MAX,
                initial_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(600),
                multiplier: 2.0,
            },
        );

        let result = engine.hold(&job, "ARCHIVED").await.unwrap();

        assert_eq!(result, TransitionResult::Held { attempts: 1 });
        let order = store.order(job.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.attempts, 1);
        assert!(order.next_attempt.unwrap() > Utc::now());
        let kept = store.job_for_order(job.order_id).await.unwrap();
        assert_eq!(kept, job);
        assert!(store.fetch_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hold_on_final_order_removes_stale_job() {
        let (store, engine, job) = setup("79927398713").await;
        engine.apply(&job, OrderStatus::Invalid, None).await.unwrap();

        let result = engine.hold(&job, "ARCHIVED").await.unwrap();

        assert_eq!(result, TransitionResult::AlreadyFinal);
        assert_eq!(store.order(job.order_id).await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_out_of_range_delay_saturates() {
        let (store, _, job) = setup("79927398713").await;
        let engine = TransitionEngine::new(
            store.clone(),
            RetryPolicy {
                max_retries: u32::MAX,
                initial_delay: Duration::from_secs(u64::MAX),
                max_delay: Duration::from_secs(u64::MAX),
                multiplier: 2.0,
            },
        );

        let result = engine.defer(&job, "unavailable").await.unwrap();

        assert_eq!(result, TransitionResult::Deferred { attempts: 1 });
        let order = store.order(job.order_id).await.unwrap();
        assert_eq!(order.next_attempt, Some(DateTime::<Utc>::MAX_UTC));
    }
}
