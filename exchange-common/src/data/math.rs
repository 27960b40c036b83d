// exchange-common/src/data/math.rs
// ====
// Safe decimal arithmetic for prices and amounts
// ====
// All money math runs on rust_decimal past the boundary parse; `f64` only
// appears where a venue hands us floats, and is converted once, here.
// ====

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

/// Exact addition.
pub fn add(a: Decimal, b: Decimal) -> Decimal {
    (a + b).normalize()
}

/// Exact subtraction.
pub fn subtract(a: Decimal, b: Decimal) -> Decimal {
    (a - b).normalize()
}

/// Exact multiplication.
pub fn multiply(a: Decimal, b: Decimal) -> Decimal {
    (a * b).normalize()
}

/// Snaps `value` to the nearest multiple of `step` (a market's price or
/// amount precision). `step <= 0` returns the value unchanged.
pub fn adjust(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).round() * step).normalize()
}

/// Like [`adjust`] but rounds toward zero, for amounts that must never
/// exceed what the caller asked for.
pub fn adjust_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).trunc() * step).normalize()
}

/// Boundary conversion from venue floats. NaN/infinite collapse to zero.
pub fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Parses a venue decimal string; empty or malformed input reads as zero,
/// which is what every venue means by an absent numeric field.
pub fn parse_or_zero(s: &str) -> Decimal {
    Decimal::from_str(s.trim()).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_adjust_has_no_binary_drift() {
        // 0.1 + 0.2 in f64 is 0.30000000000000004
        let drifted = from_f64(0.1 + 0.2);
        assert_eq!(adjust(drifted, dec!(0.1)), dec!(0.3));
    }

    #[test]
    fn test_subtract_self_is_zero() {
        for a in [dec!(0.1), dec!(123.456), dec!(0.000001), dec!(98765.4321)] {
            assert_eq!(subtract(a, a), Decimal::ZERO);
        }
    }

    #[test]
    fn test_adjust_down_truncates() {
        assert_eq!(adjust_down(dec!(0.19), dec!(0.05)), dec!(0.15));
        assert_eq!(adjust(dec!(0.19), dec!(0.05)), dec!(0.2));
    }

    #[test]
    fn test_parse_or_zero() {
        assert_eq!(parse_or_zero("1.5"), dec!(1.5));
        assert_eq!(parse_or_zero(""), Decimal::ZERO);
        assert_eq!(parse_or_zero("n/a"), Decimal::ZERO);
    }
}
