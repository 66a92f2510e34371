//! 积分同步服务错误类型
//!
//! 定义订单受理、积分同步、余额扣减的业务错误和系统错误

use loyalty_shared::error::LoyaltyError;
use rust_decimal::Decimal;
use thiserror::Error;

/// 积分同步服务错误类型
#[derive(Debug, Error)]
pub enum SyncError {
    // === 订单相关错误 ===
    #[error("订单号格式无效: {0}")]
    InvalidOrderNumber(String),

    #[error("订单已由当前用户提交: {0}")]
    OrderAlreadySubmitted(String),

    #[error("订单已被其他用户提交: {0}")]
    OrderOwnedByAnotherUser(String),

    #[error("订单不存在: {0}")]
    OrderNotFound(i64),

    // === 任务队列相关错误 ===
    #[error("订单已存在同步任务: order_id={0}")]
    DuplicateJob(i64),

    // === 余额相关错误 ===
    #[error("余额不足: 需要 {required}")]
    InsufficientBalance { required: Decimal },

    #[error("金额无效: {0}")]
    InvalidAmount(String),

    // === 系统错误 ===
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Shared(#[from] LoyaltyError),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 积分同步服务 Result 类型别名
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// 检查是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) => true,
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// 检查是否为业务错误（非系统错误）
    pub fn is_business_error(&self) -> bool {
        !matches!(
            self,
            Self::Database(_) | Self::Shared(_) | Self::Internal(_)
        )
    }

    /// 获取错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidOrderNumber(_) => "INVALID_ORDER_NUMBER",
            Self::OrderAlreadySubmitted(_) => "ORDER_ALREADY_SUBMITTED",
            Self::OrderOwnedByAnotherUser(_) => "ORDER_OWNED_BY_ANOTHER_USER",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::DuplicateJob(_) => "DUPLICATE_JOB",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Shared(e) => e.code(),
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// PostgreSQL 唯一约束冲突
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}
