//! Typed errors for the calculation and lifecycle engine.
//!
//! Engine functions never log or swallow failures; every invalid input or
//! illegal move comes back as one of these variants and the transport layer
//! decides presentation via the `AppError` conversion.

use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::InvoiceStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid quantity {0}: must be positive")]
    InvalidQuantity(Decimal),

    #[error("invalid tax rate {0}: must be between 0 and 100")]
    InvalidTaxRate(Decimal),

    #[error("invoice {0} is not in draft status; totals are locked")]
    InvoiceLocked(Uuid),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("invoice {0} has no line items")]
    EmptyInvoice(Uuid),

    #[error("invoice {0} has completed payments and cannot be cancelled")]
    CannotCancelPaidInvoice(Uuid),

    #[error("payment of {amount} would exceed the outstanding balance of {amount_due}")]
    OverpaymentNotAllowed {
        amount: Decimal,
        amount_due: Decimal,
    },

    #[error("payment {0} is not in completed status")]
    PaymentNotCompleted(Uuid),

    #[error("document number sequence exhausted for business {0}")]
    SequenceExhausted(Uuid),

    #[error("could not acquire invoice lock; the operation is safe to retry")]
    ConcurrencyConflict,
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidAmount(_)
            | EngineError::InvalidQuantity(_)
            | EngineError::InvalidTaxRate(_)
            | EngineError::EmptyInvoice(_) => AppError::BadRequest(anyhow::anyhow!("{err}")),
            EngineError::InvoiceLocked(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::CannotCancelPaidInvoice(_)
            | EngineError::OverpaymentNotAllowed { .. }
            | EngineError::PaymentNotCompleted(_)
            | EngineError::ConcurrencyConflict => AppError::Conflict(anyhow::anyhow!("{err}")),
            EngineError::SequenceExhausted(_) => AppError::InternalError(anyhow::anyhow!("{err}")),
        }
    }
}
