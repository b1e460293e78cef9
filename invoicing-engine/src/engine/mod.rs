//! The financial-calculation and lifecycle engine.
//!
//! Everything in this module is pure: values in, values out, no I/O and no
//! logging. `services::database` composes these functions inside atomic units
//! of work.

pub mod error;
pub mod lifecycle;
pub mod line_item;
pub mod money;
pub mod reconcile;
pub mod sequence;
pub mod totals;

pub use error::EngineError;
pub use lifecycle::{effective_status, transition, TransitionContext};
pub use line_item::{compute_line_item, LineComputation};
pub use reconcile::{apply_payment, refund_payment};
pub use sequence::DocumentType;
pub use totals::{compute_invoice_totals, InvoiceTotals};
