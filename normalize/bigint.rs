//! Wire-value arithmetic.
//!
//! Values arrive as hex integers of arbitrary length in the smallest unit
//! (18 implied decimals). They are accumulated digit by digit into a
//! `BigUint`, then scaled down to the 8-decimal stored representation with
//! half-up rounding.

use crate::types::{Amount, DISPLAY_DECIMALS, WIRE_DECIMALS};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("invalid hex digit {digit:?} in {input:?}")]
    InvalidHexDigit { input: String, digit: char },
    #[error("value {0} wei exceeds the representable amount range")]
    Overflow(String),
}

/// Parse a hex integer (optional `0x`, any length, `""`/`"0x"` = 0).
pub fn parse_hex(hex: &str) -> Result<BigUint, ValueError> {
    let body = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    let mut acc = BigUint::zero();
    for c in body.chars() {
        let digit = c.to_digit(16).ok_or_else(|| ValueError::InvalidHexDigit {
            input: hex.to_string(),
            digit: c,
        })?;
        acc = acc * 16u32 + digit;
    }
    Ok(acc)
}

/// Hex integer to its base-10 string.
pub fn hex_to_decimal(hex: &str) -> Result<String, ValueError> {
    Ok(parse_hex(hex)?.to_str_radix(10))
}

/// Render a base-10 integer string as a fixed-point number with `decimals`
/// fractional digits (e.g. `"1500", 3` -> `"1.500"`).
pub fn to_fixed(decimal: &str, decimals: usize) -> String {
    let digits = decimal.trim_start_matches('0');
    if decimals == 0 {
        return if digits.is_empty() { "0".into() } else { digits.into() };
    }
    let padded = format!("{:0>width$}", digits, width = decimals + 1);
    let split = padded.len() - decimals;
    format!("{}.{}", &padded[..split], &padded[split..])
}

/// Scale wei (18 decimals) to base units (8 decimals), rounding half-up.
pub fn wei_to_units(wei: &BigUint) -> BigUint {
    let divisor = BigUint::from(10u32).pow(WIRE_DECIMALS - DISPLAY_DECIMALS);
    let half = &divisor / 2u32;
    (wei + half) / divisor
}

pub fn wei_to_amount(wei: &BigUint) -> Result<Amount, ValueError> {
    wei_to_units(wei)
        .to_u128()
        .map(Amount::from_units)
        .ok_or_else(|| ValueError::Overflow(wei.to_str_radix(10)))
}

/// Display form of a wei value with 8 decimals, not bounded by `Amount`.
pub fn wei_to_display(wei: &BigUint) -> String {
    to_fixed(&wei_to_units(wei).to_str_radix(10), DISPLAY_DECIMALS as usize)
}
