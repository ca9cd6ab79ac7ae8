//! Decimal string <-> 18-decimal base unit conversion.

use ethers::{
    types::U256,
    utils::{
        format_units,
        parse_units,
    },
};
use thiserror::Error;

/// Token and ETH amounts both use 18 decimals.
pub const DECIMALS: u32 = 18;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Please enter an amount")]
    Empty,
    #[error("Invalid amount: {0}")]
    Malformed(String),
    #[error("At most {DECIMALS} decimal places are supported")]
    TooPrecise,
    #[error("Amount is too large")]
    Overflow,
}

/// Whether `input` is an acceptable partially typed amount: digits with at
/// most one decimal point. The empty string is accepted.
pub fn is_amount_input(input: &str) -> bool {
    let mut seen_point = false;
    input.chars().all(|c| match c {
        '0'..='9' => true,
        '.' if !seen_point => {
            seen_point = true;
            true
        }
        _ => false,
    })
}

/// Parses a decimal amount such as `"1.5"`, `".5"` or `"5."` into base units.
pub fn parse_amount(input: &str) -> Result<U256, AmountError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Err(AmountError::Empty);
    }
    if !is_amount_input(trimmed) {
        return Err(AmountError::Malformed(trimmed.to_owned()));
    }
    let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    if fraction.len() > DECIMALS as usize {
        return Err(AmountError::TooPrecise);
    }
    let whole = if whole.is_empty() { "0" } else { whole };
    let normalized = if fraction.is_empty() {
        whole.to_owned()
    } else {
        format!("{whole}.{fraction}")
    };
    let parsed = parse_units(normalized.as_str(), DECIMALS).map_err(|_| AmountError::Overflow)?;
    Ok(parsed.into())
}

/// Formats base units as a decimal string without trailing zeros.
pub fn format_amount(value: U256) -> String {
    match format_units(value, DECIMALS) {
        Ok(formatted) => trim_fraction(&formatted),
        // `format_units` only fails for decimals above 77
        Err(_) => value.to_string(),
    }
}

fn trim_fraction(formatted: &str) -> String {
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_owned()
            } else {
                format!("{whole}.{fraction}")
            }
        }
        None => formatted.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use proptest::prelude::*;

    fn canonical(whole: &str, fraction: &str) -> String {
        let whole = whole.trim_start_matches('0');
        let whole = if whole.is_empty() { "0" } else { whole };
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            whole.to_owned()
        } else {
            format!("{whole}.{fraction}")
        }
    }

    #[test]
    fn parse_amount__scales_to_eighteen_decimals() {
        assert_eq!(
            parse_amount("1.5").unwrap(),
            U256::from(1_500_000_000_000_000_000u128)
        );
        assert_eq!(parse_amount("0.001").unwrap(), U256::from(1_000_000_000_000_000u64));
    }

    #[test]
    fn parse_amount__accepts_leading_and_trailing_points() {
        assert_eq!(parse_amount(".5").unwrap(), parse_amount("0.5").unwrap());
        assert_eq!(parse_amount("5.").unwrap(), parse_amount("5").unwrap());
    }

    #[test]
    fn parse_amount__rejects_bad_input() {
        assert_eq!(parse_amount(""), Err(AmountError::Empty));
        assert_eq!(parse_amount("."), Err(AmountError::Empty));
        assert_eq!(
            parse_amount("1.2.3"),
            Err(AmountError::Malformed("1.2.3".to_owned()))
        );
        assert_eq!(parse_amount("-1"), Err(AmountError::Malformed("-1".to_owned())));
        assert_eq!(
            parse_amount("0.0000000000000000001"),
            Err(AmountError::TooPrecise)
        );
    }

    #[test]
    fn format_amount__drops_trailing_zeros() {
        assert_eq!(format_amount(U256::zero()), "0");
        assert_eq!(format_amount(U256::from(10u64).pow(U256::from(18))), "1");
        assert_eq!(format_amount(U256::from(1_250_000_000_000_000_000u128)), "1.25");
        assert_eq!(format_amount(U256::one()), "0.000000000000000001");
    }

    #[test]
    fn is_amount_input__allows_single_point_only() {
        assert!(is_amount_input(""));
        assert!(is_amount_input("12."));
        assert!(is_amount_input(".25"));
        assert!(!is_amount_input("1.2.3"));
        assert!(!is_amount_input("1e5"));
    }

    proptest! {
        #[test]
        fn parse_then_format__returns_normalized_input(
            whole in "[0-9]{1,20}",
            fraction in "[0-9]{0,18}",
        ) {
            // given
            let input = if fraction.is_empty() {
                whole.clone()
            } else {
                format!("{whole}.{fraction}")
            };

            // when
            let scaled = parse_amount(&input).unwrap();
            let formatted = format_amount(scaled);

            // then
            prop_assert_eq!(formatted, canonical(&whole, &fraction));
        }
    }
}
