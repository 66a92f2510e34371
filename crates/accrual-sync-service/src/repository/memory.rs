//! 内存仓储实现
//!
//! 用于测试和本地开发。事务在状态副本上执行，提交时整体写回，
//! 持有期间独占整个存储，因此事务之间天然串行。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::traits::{JobRepositoryTrait, TransactionalStore, UnitOfWork};
use crate::error::{Result, SyncError};
use crate::models::{Balance, Job, NewOrder, Order, OrderStatus, UserId, Withdrawal};

#[derive(Debug, Clone)]
struct JobRow {
    id: i64,
    order_id: i64,
    created_at: DateTime<Utc>,
    pooled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<UserId, Decimal>,
    orders: BTreeMap<i64, Order>,
    jobs: BTreeMap<i64, JobRow>,
    withdrawals: Vec<Withdrawal>,
    next_order_id: i64,
    next_job_id: i64,
    next_withdrawal_id: i64,
}

impl MemoryState {
    fn insert_job(&mut self, order_id: i64) -> Result<i64> {
        if !self.orders.contains_key(&order_id) {
            return Err(SyncError::OrderNotFound(order_id));
        }
        if self.jobs.values().any(|j| j.order_id == order_id) {
            return Err(SyncError::DuplicateJob(order_id));
        }
        self.next_job_id += 1;
        let id = self.next_job_id;
        self.jobs.insert(
            id,
            JobRow {
                id,
                order_id,
                created_at: Utc::now(),
                pooled_at: None,
            },
        );
        Ok(id)
    }

    fn touch_job(&mut self, job_id: i64) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.pooled_at = Some(Utc::now());
        }
    }

    fn to_job(&self, row: &JobRow) -> Option<Job> {
        self.orders.get(&row.order_id).map(|order| Job {
            id: row.id,
            order_id: row.order_id,
            order_number: order.order_number.clone(),
            created_at: row.created_at,
            pooled_at: row.pooled_at,
        })
    }

    fn withdrawn(&self, user_id: UserId) -> Decimal {
        self.withdrawals
            .iter()
            .filter(|w| w.user_id == user_id)
            .map(|w| w.amount)
            .sum()
    }
}

/// 内存存储
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册用户并设置初始余额
    pub async fn seed_user(&self, user_id: UserId, balance: Decimal) {
        self.state.lock().await.users.insert(user_id, balance);
    }

    pub async fn order(&self, order_id: i64) -> Option<Order> {
        self.state.lock().await.orders.get(&order_id).cloned()
    }

    /// 订单当前的任务（如有）
    pub async fn job_for_order(&self, order_id: i64) -> Option<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .values()
            .find(|j| j.order_id == order_id)
            .and_then(|row| state.to_job(row))
    }

    /// 全部任务，按 id 排序
    pub async fn jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        state.jobs.values().filter_map(|row| state.to_job(row)).collect()
    }

    /// 清除订单的退避时间，使其立即可被拉取
    pub async fn release_backoff(&self, order_id: i64) {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            order.next_attempt = None;
        }
    }

    /// 调整任务创建时间，用于构造排序场景
    pub async fn set_job_created_at(&self, job_id: i64, created_at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&job_id) {
            job.created_at = created_at;
        }
    }
}

#[async_trait]
impl JobRepositoryTrait for MemoryStore {
    async fn enqueue(&self, order_id: i64) -> Result<i64> {
        self.state.lock().await.insert_job(order_id)
    }

    async fn fetch_due(&self, limit: i64) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let now = Utc::now();

        let mut due: Vec<&JobRow> = state
            .jobs
            .values()
            .filter(|row| {
                state
                    .orders
                    .get(&row.order_id)
                    .is_some_and(|o| o.next_attempt.is_none_or(|at| at <= now))
            })
            .collect();

        // None 排在 Some 之前，对应 NULLS FIRST
        due.sort_by_key(|row| (row.created_at, row.pooled_at, row.id));

        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(due
            .into_iter()
            .take(limit)
            .filter_map(|row| state.to_job(row))
            .collect())
    }

    async fn touch(&self, job_id: i64) -> Result<()> {
        self.state.lock().await.touch_job(job_id);
        Ok(())
    }

    async fn remove(&self, job_id: i64) -> Result<()> {
        self.state.lock().await.jobs.remove(&job_id);
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn get_order_by_number(&self, order_number: &str) -> Result<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Balance> {
        let state = self.state.lock().await;
        let current = state
            .users
            .get(&user_id)
            .copied()
            .ok_or_else(|| SyncError::Internal(format!("用户不存在: {}", user_id)))?;
        Ok(Balance {
            current,
            withdrawn: state.withdrawn(user_id),
        })
    }
}

/// 内存事务：在副本上修改，提交时写回
struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_order(&mut self, order_id: i64) -> Result<Option<Order>> {
        Ok(self.working.orders.get(&order_id).cloned())
    }

    async fn find_order_by_number(&mut self, order_number: &str) -> Result<Option<Order>> {
        Ok(self
            .working
            .orders
            .values()
            .find(|o| o.order_number == order_number)
            .cloned())
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<Option<Order>> {
        if !self.working.users.contains_key(&order.user_id) {
            return Err(SyncError::Internal(format!("用户不存在: {}", order.user_id)));
        }
        if self
            .working
            .orders
            .values()
            .any(|o| o.order_number == order.order_number)
        {
            return Ok(None);
        }

        self.working.next_order_id += 1;
        let now = Utc::now();
        let created = Order {
            id: self.working.next_order_id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            status: OrderStatus::New,
            accrual: None,
            attempts: 0,
            next_attempt: None,
            created_at: now,
            updated_at: now,
        };
        self.working.orders.insert(created.id, created.clone());
        Ok(Some(created))
    }

    async fn insert_job(&mut self, order_id: i64) -> Result<i64> {
        self.working.insert_job(order_id)
    }

    async fn update_order_state(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()> {
        if let Some(order) = self.working.orders.get_mut(&order_id) {
            order.status = status;
            order.accrual = accrual;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_attempt(&mut self, order_id: i64, next_attempt: DateTime<Utc>) -> Result<()> {
        if let Some(order) = self.working.orders.get_mut(&order_id) {
            order.attempts += 1;
            order.next_attempt = Some(next_attempt);
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn touch_job(&mut self, job_id: i64) -> Result<()> {
        self.working.touch_job(job_id);
        Ok(())
    }

    async fn delete_job(&mut self, job_id: i64) -> Result<bool> {
        Ok(self.working.jobs.remove(&job_id).is_some())
    }

    async fn credit_balance(&mut self, user_id: UserId, amount: Decimal) -> Result<()> {
        let balance = self
            .working
            .users
            .get_mut(&user_id)
            .ok_or_else(|| SyncError::Internal(format!("用户不存在: {}", user_id)))?;
        *balance += amount;
        Ok(())
    }

    async fn debit_balance(&mut self, user_id: UserId, amount: Decimal) -> Result<bool> {
        match self.working.users.get_mut(&user_id) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_withdrawal(
        &mut self,
        user_id: UserId,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Withdrawal> {
        if self
            .working
            .withdrawals
            .iter()
            .any(|w| w.order_number == order_number)
        {
            return Err(SyncError::OrderAlreadySubmitted(order_number.to_string()));
        }

        self.working.next_withdrawal_id += 1;
        let withdrawal = Withdrawal {
            id: self.working.next_withdrawal_id,
            user_id,
            order_number: order_number.to_string(),
            amount,
            created_at: Utc::now(),
        };
        self.working.withdrawals.push(withdrawal.clone());
        Ok(withdrawal)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
