//! 余额服务
//!
//! 余额只通过原子的累加和条件扣减修改，不做"读取后写回"。

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{info, instrument};

use crate::error::{Result, SyncError};
use crate::luhn::is_valid_order_number;
use crate::models::money::round_money;
use crate::models::{Balance, UserId, Withdrawal};
use crate::repository::TransactionalStore;

/// 余额服务
pub struct BalanceService<S: ?Sized> {
    store: Arc<S>,
}

impl<S> BalanceService<S>
where
    S: TransactionalStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// 当前余额和累计提现
    pub async fn balance(&self, user_id: UserId) -> Result<Balance> {
        self.store.get_balance(user_id).await
    }

    /// 使用积分抵扣新订单
    ///
    /// 金额保留两位小数后必须为正；余额不足时不做任何修改。
    #[instrument(skip(self))]
    pub async fn withdraw(
        &self,
        user_id: UserId,
        order_number: &str,
        sum: Decimal,
    ) -> Result<Withdrawal> {
        let order_number = order_number.trim();
        if !is_valid_order_number(order_number) {
            return Err(SyncError::InvalidOrderNumber(order_number.to_string()));
        }

        let amount = round_money(sum);
        if amount <= Decimal::ZERO {
            return Err(SyncError::InvalidAmount(sum.to_string()));
        }

        let mut uow = self.store.begin().await?;

        if !uow.debit_balance(user_id, amount).await? {
            return Err(SyncError::InsufficientBalance { required: amount });
        }
        let withdrawal = uow.insert_withdrawal(user_id, order_number, amount).await?;
        uow.commit().await?;

        info!(%user_id, order_number, amount = %amount, "积分提现成功");
        Ok(withdrawal)
    }
}
