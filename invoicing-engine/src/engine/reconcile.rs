//! Payment reconciliation: applying and refunding payments against an
//! invoice's outstanding balance.
//!
//! Both operations are pure value transformations; the persistence layer
//! wraps them in a single atomic unit of work per invoice so concurrent
//! reconciliations cannot read a stale balance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::engine::error::EngineError;
use crate::engine::lifecycle;
use crate::models::{Invoice, InvoiceStatus, Payment, PaymentStatus};

fn require_same_invoice(invoice: &Invoice, payment: &Payment) -> Result<(), EngineError> {
    if payment.invoice_id != invoice.invoice_id {
        return Err(EngineError::InvalidAmount(format!(
            "payment {} does not belong to invoice {}",
            payment.payment_id, invoice.invoice_id
        )));
    }
    Ok(())
}

/// Apply a completed payment to an invoice.
///
/// Rejects overpayment outright rather than capping: `amount_paid` must end
/// up exactly equal to the sum of non-refunded payments, so a correcting
/// amount is the caller's job. When the balance reaches exactly zero the
/// invoice settles to `paid`; a partial payment leaves the status untouched.
pub fn apply_payment(
    invoice: &Invoice,
    payment: &Payment,
    now: DateTime<Utc>,
) -> Result<(Invoice, Payment), EngineError> {
    require_same_invoice(invoice, payment)?;

    if payment.amount <= Decimal::ZERO {
        return Err(EngineError::InvalidAmount(format!(
            "payment amount must be positive, got {}",
            payment.amount
        )));
    }
    if payment.status != PaymentStatus::Completed {
        return Err(EngineError::PaymentNotCompleted(payment.payment_id));
    }
    if !matches!(
        invoice.status,
        InvoiceStatus::Sent | InvoiceStatus::Viewed
    ) {
        return Err(EngineError::InvalidTransition {
            from: invoice.status,
            to: InvoiceStatus::Paid,
        });
    }

    let new_amount_paid = invoice.amount_paid + payment.amount;
    if new_amount_paid > invoice.total_amount {
        return Err(EngineError::OverpaymentNotAllowed {
            amount: payment.amount,
            amount_due: invoice.amount_due,
        });
    }

    let mut updated = invoice.clone();
    updated.amount_paid = new_amount_paid;
    updated.amount_due = updated.total_amount - new_amount_paid;
    updated.updated_utc = now;

    if updated.amount_due.is_zero() {
        updated = lifecycle::settle(&updated, now);
    }

    Ok((updated, payment.clone()))
}

/// Refund a completed payment.
///
/// The payment flips to `refunded` and stops counting toward `amount_paid`.
/// A `paid` invoice whose balance reopens moves to `refunded`, preserving the
/// record that money changed hands and was returned.
pub fn refund_payment(
    invoice: &Invoice,
    payment: &Payment,
    now: DateTime<Utc>,
) -> Result<(Invoice, Payment), EngineError> {
    require_same_invoice(invoice, payment)?;

    if payment.status != PaymentStatus::Completed {
        return Err(EngineError::PaymentNotCompleted(payment.payment_id));
    }
    if !matches!(
        invoice.status,
        InvoiceStatus::Sent | InvoiceStatus::Viewed | InvoiceStatus::Paid | InvoiceStatus::Refunded
    ) {
        return Err(EngineError::InvalidTransition {
            from: invoice.status,
            to: InvoiceStatus::Refunded,
        });
    }

    let mut refunded = payment.clone();
    refunded.status = PaymentStatus::Refunded;
    refunded.updated_utc = now;

    let mut updated = invoice.clone();
    updated.amount_paid = invoice.amount_paid - payment.amount;
    updated.amount_due = updated.total_amount - updated.amount_paid;
    updated.updated_utc = now;

    if invoice.status == InvoiceStatus::Paid && updated.amount_due > Decimal::ZERO {
        updated = lifecycle::mark_refunded(&updated, now);
    }

    Ok((updated, refunded))
}
