//! 仓储 Trait 定义
//!
//! 服务层依赖抽象而非具体实现：生产环境使用 PostgreSQL，测试和本地开发使用内存实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::{Balance, Job, NewOrder, Order, OrderStatus, UserId, Withdrawal};

/// 同步任务队列接口
///
/// 非事务的单语句操作。调度器只依赖 [`JobRepositoryTrait::fetch_due`]；
/// 订单受理和状态迁移需要与订单、余额写入同进退，走 [`UnitOfWork`] 中对应的
/// `insert_job` / `touch_job` / `delete_job`。`enqueue` / `touch` / `remove`
/// 留给运维补录和人工清理，语义与事务内版本一致。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRepositoryTrait: Send + Sync {
    /// 为订单创建任务，订单已有任务时返回 `DuplicateJob`
    async fn enqueue(&self, order_id: i64) -> Result<i64>;

    /// 拉取至多 limit 个到期任务
    ///
    /// 按 `created_at ASC, pooled_at ASC NULLS FIRST, id ASC` 排序，
    /// 仅返回订单 `next_attempt` 为空或已到期的任务。不加可见性超时，重复投递由状态迁移兜底。
    async fn fetch_due(&self, limit: i64) -> Result<Vec<Job>>;

    /// 标记任务刚被处理过（`pooled_at = now`）
    async fn touch(&self, job_id: i64) -> Result<()>;

    /// 删除任务，任务不存在时不报错
    async fn remove(&self, job_id: i64) -> Result<()>;
}

/// 单个事务内的操作集合
///
/// 未调用 [`UnitOfWork::commit`] 就被 drop 时整体回滚。
#[async_trait]
pub trait UnitOfWork: Send {
    /// 读取并锁定订单行，直到事务结束
    async fn lock_order(&mut self, order_id: i64) -> Result<Option<Order>>;

    async fn find_order_by_number(&mut self, order_number: &str) -> Result<Option<Order>>;

    /// 插入 NEW 状态的订单，订单号已存在时返回 None
    async fn insert_order(&mut self, order: &NewOrder) -> Result<Option<Order>>;

    /// 插入同步任务，订单已有任务时返回 `DuplicateJob`
    async fn insert_job(&mut self, order_id: i64) -> Result<i64>;

    /// 写入订单状态和积分
    async fn update_order_state(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()>;

    /// 记录一次未完成的同步：`attempts + 1`，并设置下一次可同步时间
    async fn record_attempt(&mut self, order_id: i64, next_attempt: DateTime<Utc>) -> Result<()>;

    async fn touch_job(&mut self, job_id: i64) -> Result<()>;

    /// 删除任务，返回是否确实删除了一行
    async fn delete_job(&mut self, job_id: i64) -> Result<bool>;

    /// 原子累加余额（`balance = balance + amount`）
    async fn credit_balance(&mut self, user_id: UserId, amount: Decimal) -> Result<()>;

    /// 余额充足时原子扣减，返回是否扣减成功
    async fn debit_balance(&mut self, user_id: UserId, amount: Decimal) -> Result<bool>;

    async fn insert_withdrawal(
        &mut self,
        user_id: UserId,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Withdrawal>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// 支持事务的存储
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    async fn get_order_by_number(&self, order_number: &str) -> Result<Option<Order>>;

    async fn get_balance(&self, user_id: UserId) -> Result<Balance>;
}
