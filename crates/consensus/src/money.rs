//! Monetary units and money range rules.

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const CENT: Amount = 1_000_000;

/// No amount larger than this (in satoshi) is valid.
pub const MAX_MONEY: Amount = 21_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Renders an amount as a decimal coin string, e.g. `12.5`.
pub fn format_money(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let whole = abs / COIN as u64;
    let frac = abs % COIN as u64;
    if frac == 0 {
        return format!("{sign}{whole}.00");
    }
    let digits = format!("{frac:08}");
    format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
}
