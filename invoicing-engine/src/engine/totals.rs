//! Invoice-level totals aggregation.

use rust_decimal::Decimal;

use crate::engine::error::EngineError;
use crate::engine::line_item::LineComputation;
use crate::engine::money;
use crate::models::DiscountType;

/// Aggregated monetary fields for one invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub total_amount: Decimal,
}

/// Aggregate line computations into invoice totals.
///
/// The subtotal is the sum of each line's post-discount, pre-tax amount. An
/// invoice-level discount is distributed pro-rata across lines by their share
/// of the subtotal, so tax is charged on what the client actually owes. Tax
/// is summed exactly across lines and rounded once at the end; the result is
/// deterministic for identical inputs and the total never goes negative.
pub fn compute_invoice_totals(
    lines: &[LineComputation],
    discount: Option<(DiscountType, Decimal)>,
    shipping: Decimal,
) -> Result<InvoiceTotals, EngineError> {
    let shipping_amount =
        money::round_minor(money::require_non_negative(shipping, "shipping_amount")?, money::DEFAULT_MINOR_UNITS);

    // Line taxable bases are already minor-unit amounts, so this sum is exact.
    let subtotal: Decimal = lines.iter().map(|line| line.taxable).sum();

    let discount_amount = match discount {
        Some((DiscountType::Percentage, value)) => {
            let value = money::require_non_negative(value, "discount_value")?;
            if value > Decimal::ONE_HUNDRED {
                return Err(EngineError::InvalidAmount(format!(
                    "percentage discount must be between 0 and 100, got {value}"
                )));
            }
            money::round_minor(
                money::percent_of(subtotal, value),
                money::DEFAULT_MINOR_UNITS,
            )
        }
        // A fixed discount never drives the subtotal negative.
        Some((DiscountType::Fixed, value)) => money::round_minor(
            money::require_non_negative(value, "discount_value")?.min(subtotal),
            money::DEFAULT_MINOR_UNITS,
        ),
        None => Decimal::ZERO,
    };

    // Share of each taxable base that survives the invoice-level discount.
    let retained = if subtotal.is_zero() {
        Decimal::ZERO
    } else {
        (subtotal - discount_amount) / subtotal
    };

    let tax_exact: Decimal = lines
        .iter()
        .map(|line| money::percent_of(line.taxable * retained, line.tax_rate))
        .sum();
    let tax_amount = money::round_minor(tax_exact, money::DEFAULT_MINOR_UNITS);

    Ok(InvoiceTotals {
        subtotal,
        discount_amount,
        tax_amount,
        shipping_amount,
        total_amount: subtotal - discount_amount + tax_amount + shipping_amount,
    })
}
