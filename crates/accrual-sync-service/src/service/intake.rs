//! 订单受理服务
//!
//! 校验订单号后在同一事务内写入订单和同步任务，保证每个被受理的订单都会被同步。

use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::{Result, SyncError};
use crate::luhn::is_valid_order_number;
use crate::models::{NewOrder, Order, UserId};
use crate::repository::TransactionalStore;

/// 订单受理服务
pub struct OrderIntakeService<S: ?Sized> {
    store: Arc<S>,
}

impl<S> OrderIntakeService<S>
where
    S: TransactionalStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// 提交订单
    ///
    /// - 订单号必须为纯数字并通过 Luhn 校验
    /// - 当前用户重复提交返回 `OrderAlreadySubmitted`
    /// - 其他用户已提交返回 `OrderOwnedByAnotherUser`
    #[instrument(skip(self))]
    pub async fn submit(&self, user_id: UserId, order_number: &str) -> Result<Order> {
        let order_number = order_number.trim();
        if !is_valid_order_number(order_number) {
            return Err(SyncError::InvalidOrderNumber(order_number.to_string()));
        }

        let mut uow = self.store.begin().await?;

        if let Some(existing) = uow.find_order_by_number(order_number).await? {
            return Err(duplicate_error(&existing, user_id));
        }

        let inserted = uow
            .insert_order(&NewOrder {
                order_number: order_number.to_string(),
                user_id,
            })
            .await?;

        let order = match inserted {
            Some(order) => order,
            None => {
                // 并发提交：回滚后按最终归属判断
                drop(uow);
                return match self.store.get_order_by_number(order_number).await? {
                    Some(existing) => Err(duplicate_error(&existing, user_id)),
                    None => Err(SyncError::Internal(format!(
                        "订单写入冲突但未找到已有订单: {}",
                        order_number
                    ))),
                };
            }
        };

        uow.insert_job(order.id).await?;
        uow.commit().await?;

        info!(order_id = order.id, %user_id, order_number, "订单已受理");
        Ok(order)
    }
}

fn duplicate_error(existing: &Order, user_id: UserId) -> SyncError {
    if existing.user_id == user_id {
        SyncError::OrderAlreadySubmitted(existing.order_number.clone())
    } else {
        SyncError::OrderOwnedByAnotherUser(existing.order_number.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use crate::repository::{JobRepositoryTrait, MemoryStore};
    use rust_decimal::Decimal;

    async fn service() -> (Arc<MemoryStore>, OrderIntakeService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.seed_user(UserId(1), Decimal::ZERO).await;
        store.seed_user(UserId(2), Decimal::ZERO).await;
        (store.clone(), OrderIntakeService::new(store))
    }

    #[tokio::test]
    async fn test_submit_creates_order_and_job() {
        let (store, service) = service().await;

        let order = service.submit(UserId(1), "4561261212345467").await.unwrap();

        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.user_id, UserId(1));
        let job = store.job_for_order(order.id).await.unwrap();
        assert_eq!(job.order_number, "4561261212345467");
        assert_eq!(store.fetch_due(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_numbers() {
        let (store, service) = service().await;

        for bad in ["", "abc", "4561261212345464", "12 34"] {
            let err = service.submit(UserId(1), bad).await.unwrap_err();
            assert!(matches!(err, SyncError::InvalidOrderNumber(_)), "{bad}");
        }
        assert!(store.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_classified_by_owner() {
        let (store, service) = service().await;
        service.submit(UserId(1), "79927398713").await.unwrap();

        let same_user = service.submit(UserId(1), "79927398713").await.unwrap_err();
        assert_eq!(same_user.error_code(), "ORDER_ALREADY_SUBMITTED");

        let other_user = service.submit(UserId(2), "79927398713").await.unwrap_err();
        assert_eq!(other_user.error_code(), "ORDER_OWNED_BY_ANOTHER_USER");

        assert_eq!(store.jobs().await.len(), 1);
    }
}
