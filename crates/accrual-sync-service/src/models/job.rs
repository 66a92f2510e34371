//! 同步任务模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 待同步任务
///
/// 每个订单至多一个任务，与订单在同一事务中创建，订单进入终态后删除。
/// `order_number` 来自拉取时对订单表的关联查询，便于 Worker 直接调用外部服务。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub order_id: i64,
    pub order_number: String,
    pub created_at: DateTime<Utc>,
    /// 最近一次被处理的时间，从未处理过为空
    pub pooled_at: Option<DateTime<Utc>>,
}
