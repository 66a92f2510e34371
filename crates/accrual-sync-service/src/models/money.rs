//! 金额处理
//!
//! 积分和余额统一保留两位小数，四舍五入方向为远离零。

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

/// 金额精度（小数位数）
pub const MONEY_SCALE: u32 = 2;

/// 保留两位小数，半数远离零舍入
pub fn round_money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

/// 将 JSON 数字规范化为两位小数
///
/// 在数字的十进制文本上舍入，避免二进制浮点把 `12.345` 舍成 `12.34`。
pub fn normalize_amount(number: &serde_json::Number) -> Option<Decimal> {
    let text = number.to_string();
    let value = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()?;
    Some(round_money(value))
}
