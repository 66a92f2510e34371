//! 外部积分计算服务网关
//!
//! 每次查询把外部响应归类为一个封闭的结果集合，调用方只需按结果分支处理，
//! 不必关心 HTTP 细节。

mod client;

pub use client::AccrualClient;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::OrderStatus;

/// 外部服务返回的订单状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Known(OrderStatus),
    /// 无法识别的状态，原样保留用于日志
    Unrecognized(String),
}

/// 一次查询的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// 外部服务给出了订单状态，积分仅在 PROCESSED 时可能有值（已规范化为两位小数）
    Resolved {
        status: RemoteStatus,
        accrual: Option<Decimal>,
    },
    /// 外部服务尚未登记该订单（204）
    NotYetRegistered,
    /// 外部服务不可用（500、网络错误、超时）
    ExternalUnavailable,
    /// 触发限流（429），`retry_after` 为服务端给出的冷却秒数
    RateLimited { retry_after: Option<u64> },
    /// 响应不符合约定
    ProtocolError { detail: String },
}

impl LookupOutcome {
    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved {
                status: RemoteStatus::Known(_),
                ..
            } => "resolved",
            Self::Resolved {
                status: RemoteStatus::Unrecognized(_),
                ..
            } => "unrecognized",
            Self::NotYetRegistered => "not_registered",
            Self::ExternalUnavailable => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProtocolError { .. } => "protocol_error",
        }
    }
}

/// 外部积分服务的抽象接口
///
/// 查询本身不返回错误：所有失败都已归类为 [`LookupOutcome`] 的某个分支。
#[async_trait]
pub trait AccrualGateway: Send + Sync {
    async fn lookup(&self, order_number: &str) -> LookupOutcome;
}
