//! Fixed-point helpers for money, share and price arithmetic.
//!
//! Prices and quantities travel as `rust_decimal::Decimal` end to end and
//! are normalized to four fractional digits at the boundary. Balance debits
//! that would go below zero are programming errors and fail fast instead of
//! saturating silently.

use rust_decimal::Decimal;

/// Fractional digits carried by prices and quantities.
pub const SCALE: u32 = 4;

/// True when `value` has no significant digits beyond [`SCALE`].
pub fn fits_scale(value: Decimal) -> bool {
    value.normalize().scale() <= SCALE
}

/// True when `value` is an exact multiple of `tick`.
pub fn is_on_tick(value: Decimal, tick: Decimal) -> bool {
    if tick <= Decimal::ZERO {
        return false;
    }
    (value % tick).is_zero()
}

/// Normalize to the canonical 4dp representation used in persistence.
pub fn quantize(value: Decimal) -> Decimal {
    value.round_dp(SCALE).normalize()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("balance underflow: {minuend} - {subtrahend}")]
pub struct Underflow {
    pub minuend: Decimal,
    pub subtrahend: Decimal,
}

/// `minuend - subtrahend`, failing if the result would be negative.
/// Used for every debit of `available` or `locked`.
pub fn debit(minuend: Decimal, subtrahend: Decimal) -> Result<Decimal, Underflow> {
    let result = minuend - subtrahend;
    if result < Decimal::ZERO {
        debug_assert!(false, "balance underflow: {minuend} - {subtrahend}");
        return Err(Underflow {
            minuend,
            subtrahend,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn scale_check() {
        assert!(fits_scale(dec!(0.4000)));
        assert!(fits_scale(dec!(0.1234)));
        assert!(!fits_scale(dec!(0.12345)));
        assert!(fits_scale(dec!(100)));
    }

    #[test]
    fn tick_check() {
        assert!(is_on_tick(dec!(0.40), dec!(0.01)));
        assert!(!is_on_tick(dec!(0.405), dec!(0.01)));
        assert!(is_on_tick(dec!(60), dec!(1)));
        assert!(!is_on_tick(dec!(60.5), dec!(1)));
        assert!(!is_on_tick(dec!(1), dec!(0)));
    }

    #[test]
    fn debit_guards_underflow() {
        assert_eq!(debit(dec!(10), dec!(4)).unwrap(), dec!(6));
        assert_eq!(debit(dec!(4), dec!(4)).unwrap(), dec!(0));
    }

    #[test]
    #[should_panic]
    fn debit_panics_in_debug_on_underflow() {
        let _ = debit(dec!(1), dec!(2));
    }

    #[test]
    fn quantize_is_exact_at_4dp() {
        assert_eq!(quantize(dec!(0.40000)), dec!(0.4));
        assert_eq!(quantize(dec!(32.0000)), dec!(32));
    }
}
