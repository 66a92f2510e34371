//! 领域模型定义

mod balance;
mod job;
pub mod money;
mod order;

pub use balance::{Balance, Withdrawal};
pub use job::Job;
pub use order::{NewOrder, Order, OrderStatus, UserId};
