//! Single line-item calculation.

use rust_decimal::Decimal;

use crate::engine::error::EngineError;
use crate::engine::money;
use crate::models::{DiscountType, LineItemDraft};

/// Computed amounts for one line item.
///
/// `subtotal`, `discount_amount`, `tax_amount` and `total` are rounded to the
/// minor unit and are what gets persisted on the line row. `taxable` is the
/// exact post-discount base and `tax_rate` the input rate; the totals
/// aggregator works from those so invoice-level tax is rounded once, not once
/// per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineComputation {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub taxable: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Compute subtotal, discount, tax and total for one line-item draft.
///
/// The discount applies before tax: tax is charged on the post-discount
/// amount. A fixed discount larger than the line subtotal is capped so the
/// taxable base never goes negative.
pub fn compute_line_item(draft: &LineItemDraft) -> Result<LineComputation, EngineError> {
    let quantity = money::require_positive_quantity(draft.quantity)?;
    let unit_price = money::require_non_negative(draft.unit_price, "unit_price")?;
    let tax_rate = money::require_tax_rate(draft.tax_rate)?;
    let discount_value = money::require_non_negative(draft.discount_value, "discount_value")?;

    let subtotal = money::round_minor(quantity * unit_price, money::DEFAULT_MINOR_UNITS);

    let discount_amount = match draft.discount_type {
        Some(DiscountType::Percentage) => {
            if discount_value > Decimal::ONE_HUNDRED {
                return Err(EngineError::InvalidAmount(format!(
                    "percentage discount must be between 0 and 100, got {discount_value}"
                )));
            }
            money::round_minor(
                money::percent_of(subtotal, discount_value),
                money::DEFAULT_MINOR_UNITS,
            )
        }
        Some(DiscountType::Fixed) => {
            money::round_minor(discount_value.min(subtotal), money::DEFAULT_MINOR_UNITS)
        }
        None => Decimal::ZERO,
    };

    let taxable = subtotal - discount_amount;
    let tax_amount = money::round_minor(
        money::percent_of(taxable, tax_rate),
        money::DEFAULT_MINOR_UNITS,
    );

    Ok(LineComputation {
        subtotal,
        discount_amount,
        taxable,
        tax_rate,
        tax_amount,
        total: taxable + tax_amount,
    })
}
