//! 业务服务层
//!
//! - `intake`: 订单受理，写入订单与同步任务
//! - `balance`: 余额查询与积分提现

mod balance;
mod intake;

pub use balance::BalanceService;
pub use intake::OrderIntakeService;
