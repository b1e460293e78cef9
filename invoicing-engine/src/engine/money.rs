//! Fixed-point monetary arithmetic.
//!
//! Never use floating-point for money. Everything downstream (line items,
//! totals, reconciliation) routes through these helpers so rounding happens
//! in one place, once, at the currency's minor unit.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::engine::error::EngineError;

/// Fractional digits of the default currency minor unit.
pub const DEFAULT_MINOR_UNITS: u32 = 2;

/// Round half-up (midpoint away from zero) to the given minor-unit scale.
pub fn round_minor(amount: Decimal, minor_units: u32) -> Decimal {
    amount.round_dp_with_strategy(minor_units, RoundingStrategy::MidpointAwayFromZero)
}

/// `rate` percent of `amount`, unrounded.
pub fn percent_of(amount: Decimal, rate: Decimal) -> Decimal {
    amount * rate / Decimal::ONE_HUNDRED
}

/// Reject negative values for fields that must be non-negative.
pub fn require_non_negative(value: Decimal, field: &str) -> Result<Decimal, EngineError> {
    if value.is_sign_negative() {
        return Err(EngineError::InvalidAmount(format!(
            "{field} must be non-negative, got {value}"
        )));
    }
    Ok(value)
}

/// Reject zero or negative quantities.
pub fn require_positive_quantity(quantity: Decimal) -> Result<Decimal, EngineError> {
    if quantity <= Decimal::ZERO {
        return Err(EngineError::InvalidQuantity(quantity));
    }
    Ok(quantity)
}

/// Reject tax rates outside 0-100 percent.
pub fn require_tax_rate(rate: Decimal) -> Result<Decimal, EngineError> {
    if rate.is_sign_negative() || rate > Decimal::ONE_HUNDRED {
        return Err(EngineError::InvalidTaxRate(rate));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_half_up_at_minor_unit() {
        assert_eq!(round_minor(dec!(1.005), 2), dec!(1.01));
        assert_eq!(round_minor(dec!(1.004), 2), dec!(1.00));
        assert_eq!(round_minor(dec!(2.675), 2), dec!(2.68));
    }

    #[test]
    fn rounds_to_configured_scale() {
        assert_eq!(round_minor(dec!(1.2345), 3), dec!(1.235));
        assert_eq!(round_minor(dec!(125.5), 0), dec!(126));
    }

    #[test]
    fn percent_of_is_exact() {
        assert_eq!(percent_of(dec!(1425.00), dec!(10)), dec!(142.5000));
        assert_eq!(percent_of(dec!(1500), dec!(5)), dec!(75.00));
    }

    #[test]
    fn rejects_negative_amounts() {
        assert!(require_non_negative(dec!(-0.01), "unit_price").is_err());
        assert!(require_non_negative(dec!(0), "unit_price").is_ok());
    }

    #[test]
    fn rejects_non_positive_quantity() {
        assert!(matches!(
            require_positive_quantity(dec!(0)),
            Err(EngineError::InvalidQuantity(_))
        ));
        assert!(matches!(
            require_positive_quantity(dec!(-1)),
            Err(EngineError::InvalidQuantity(_))
        ));
        assert!(require_positive_quantity(dec!(0.5)).is_ok());
    }

    #[test]
    fn rejects_out_of_range_tax_rate() {
        assert!(matches!(
            require_tax_rate(dec!(-1)),
            Err(EngineError::InvalidTaxRate(_))
        ));
        assert!(matches!(
            require_tax_rate(dec!(100.01)),
            Err(EngineError::InvalidTaxRate(_))
        ));
        assert!(require_tax_rate(dec!(0)).is_ok());
        assert!(require_tax_rate(dec!(100)).is_ok());
    }
}
