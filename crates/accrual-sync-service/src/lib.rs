//! 积分同步服务
//!
//! 把用户提交的订单可靠地同步到外部积分计算服务，并在订单进入终态时恰好一次地入账。
//!
//! ## 核心功能
//!
//! - **订单受理**：校验订单号，在同一事务内写入订单和同步任务
//! - **定时调度**：按固定间隔拉取到期任务，投递给有界 Worker 池
//! - **外部查询**：把积分服务的响应归类为封闭的结果集合
//! - **状态迁移**：事务内更新订单状态、按条件入账、删除或重新调度任务
//! - **限流退避**：收到 429 后全局暂停查询，直到冷却结束
//! - **余额与提现**：原子的余额扣减与提现记录
//!
//! ## 模块结构
//!
//! - `models`: 领域模型定义
//! - `error`: 错误类型定义
//! - `luhn`: 订单号校验
//! - `repository`: 仓储层（PostgreSQL 与内存实现）
//! - `gateway`: 外部积分服务网关
//! - `backoff`: 全局限流退避
//! - `transition`: 订单状态迁移
//! - `worker`: 调度器与 Worker 池
//! - `service`: 订单受理与余额服务

pub mod backoff;
pub mod error;
pub mod gateway;
pub mod luhn;
pub mod models;
pub mod repository;
pub mod service;
pub mod transition;
pub mod worker;

pub use backoff::BackoffController;
pub use error::{Result, SyncError};
pub use gateway::{AccrualClient, AccrualGateway, LookupOutcome, RemoteStatus};
pub use models::*;
pub use repository::{JobRepositoryTrait, MemoryStore, PgStore, TransactionalStore, UnitOfWork};
pub use service::{BalanceService, OrderIntakeService};
pub use transition::{TransitionEngine, TransitionResult};
pub use worker::{AccrualSynchronizer, Dispatcher, JobOutcome, SyncWorker};
