//! Invoice lifecycle state machine.
//!
//! All transition legality lives here. `transition` handles the externally
//! requestable moves (send, mark viewed, cancel); `settle` and `mark_refunded`
//! are reserved for the reconciliation engine, which is the only component
//! allowed to move an invoice into `paid` or `refunded`. `overdue` is a
//! derived status, re-evaluated on read, never stored.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::engine::error::EngineError;
use crate::models::{Invoice, InvoiceStatus};

/// Facts about the invoice's surroundings that transitions depend on.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub line_item_count: usize,
    pub has_completed_payment: bool,
    pub now: DateTime<Utc>,
}

/// Attempt a requested status transition, returning the updated invoice.
pub fn transition(
    invoice: &Invoice,
    target: InvoiceStatus,
    ctx: &TransitionContext,
) -> Result<Invoice, EngineError> {
    let mut updated = invoice.clone();
    updated.updated_utc = ctx.now;

    match (invoice.status, target) {
        (InvoiceStatus::Draft, InvoiceStatus::Sent) => {
            // Zero-total invoices are permitted; empty ones are not.
            if ctx.line_item_count == 0 {
                return Err(EngineError::EmptyInvoice(invoice.invoice_id));
            }
            updated.status = InvoiceStatus::Sent;
            updated.sent_at = Some(ctx.now);
            Ok(updated)
        }
        // Idempotent marking that the client opened the invoice.
        (InvoiceStatus::Sent | InvoiceStatus::Viewed, InvoiceStatus::Viewed) => {
            updated.status = InvoiceStatus::Viewed;
            updated.viewed_at = updated.viewed_at.or(Some(ctx.now));
            Ok(updated)
        }
        (
            InvoiceStatus::Draft | InvoiceStatus::Sent | InvoiceStatus::Viewed,
            InvoiceStatus::Cancelled,
        ) => {
            if ctx.has_completed_payment {
                return Err(EngineError::CannotCancelPaidInvoice(invoice.invoice_id));
            }
            updated.status = InvoiceStatus::Cancelled;
            updated.cancelled_at = Some(ctx.now);
            Ok(updated)
        }
        // A paid invoice by definition carries a completed payment.
        (InvoiceStatus::Paid, InvoiceStatus::Cancelled) => {
            Err(EngineError::CannotCancelPaidInvoice(invoice.invoice_id))
        }
        (from, to) => Err(EngineError::InvalidTransition { from, to }),
    }
}

/// The status an invoice presents as right now: `sent`/`viewed` invoices past
/// their due date with an outstanding balance read as `overdue`. Settling the
/// balance makes the derived status disappear with no stored transition.
pub fn effective_status(invoice: &Invoice, today: NaiveDate) -> InvoiceStatus {
    match invoice.status {
        InvoiceStatus::Sent | InvoiceStatus::Viewed
            if invoice.due_date < today && invoice.amount_due > Decimal::ZERO =>
        {
            InvoiceStatus::Overdue
        }
        status => status,
    }
}

/// Move a fully settled invoice into `paid`. Reconciliation only.
pub(crate) fn settle(invoice: &Invoice, now: DateTime<Utc>) -> Invoice {
    let mut updated = invoice.clone();
    updated.status = InvoiceStatus::Paid;
    updated.paid_at = Some(now);
    updated.updated_utc = now;
    updated
}

/// Move a paid invoice whose settling payment was returned into `refunded`.
/// The invoice is not reopened as `sent`: the refund trail stays auditable
/// and continued collection requires a new corrective invoice.
pub(crate) fn mark_refunded(invoice: &Invoice, now: DateTime<Utc>) -> Invoice {
    let mut updated = invoice.clone();
    updated.status = InvoiceStatus::Refunded;
    updated.updated_utc = now;
    updated
}
