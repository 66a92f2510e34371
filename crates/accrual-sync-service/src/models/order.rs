//! 订单模型

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 用户 ID
///
/// 由上游认证层解析后显式传入，服务层不从任何隐式上下文读取用户身份
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 订单状态
///
/// `NEW -> PROCESSING -> {INVALID | PROCESSED}`，后两者为终态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已受理，尚未被外部服务确认
    #[default]
    New,
    /// 外部服务计算中
    Processing,
    /// 外部服务拒绝计算积分（终态）
    Invalid,
    /// 积分计算完成（终态）
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    /// 解析外部积分服务返回的状态
    ///
    /// 外部的 `REGISTERED` 对应本地的 `NEW`，无法识别的状态返回 None
    pub fn from_remote(value: &str) -> Option<Self> {
        match value {
            "REGISTERED" => Some(Self::New),
            "PROCESSING" => Some(Self::Processing),
            "INVALID" => Some(Self::Invalid),
            "PROCESSED" => Some(Self::Processed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Processing => 1,
            Self::Invalid | Self::Processed => 2,
        }
    }

    /// 合并外部状态到当前状态
    ///
    /// 终态不再变化；非终态只前进不回退
    pub fn advance_to(self, remote: OrderStatus) -> OrderStatus {
        if self.is_terminal() || remote.rank() <= self.rank() {
            self
        } else {
            remote
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订单
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub user_id: UserId,
    pub status: OrderStatus,
    /// 仅在 PROCESSED 时可能有值
    pub accrual: Option<Decimal>,
    /// 非终态同步失败或未完成的累计次数
    pub attempts: i32,
    /// 下一次允许同步的时间，为空表示立即可同步
    pub next_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新受理的订单
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: String,
    pub user_id: UserId,
}
