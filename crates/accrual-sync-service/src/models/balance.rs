//! 余额与提现模型

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::UserId;

/// 用户余额快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// 当前可用积分
    pub current: Decimal,
    /// 累计已提现积分
    pub withdrawn: Decimal,
}

/// 提现记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: UserId,
    pub order_number: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}
