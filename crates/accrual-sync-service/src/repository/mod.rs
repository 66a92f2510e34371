//! 数据库仓储层
//!
//! ## 设计原则
//!
//! - 仓储只负责数据持久化，不包含业务逻辑
//! - 多步写入通过 [`UnitOfWork`] 在单个事务内完成，事务边界由服务层决定
//! - 定义 trait 接口以支持 mock 测试和内存实现

mod memory;
mod pg;
mod traits;

pub use memory::MemoryStore;
pub use pg::{PgStore, PgUnitOfWork};
pub use traits::*;
