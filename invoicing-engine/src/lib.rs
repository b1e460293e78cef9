//! invoicing-engine: financial calculation, lifecycle and payment
//! reconciliation for multi-tenant invoicing.
//!
//! The `engine` module holds the pure core: line-item and invoice totals
//! computation, the status state machine, payment reconciliation and document
//! number formatting. `models` are the plain value records those functions
//! operate on. `services` binds the core to PostgreSQL, wrapping each
//! operation in the atomic unit of work the invariants require. Transport
//! (REST/GraphQL), authentication and tax-rate resolution live with the
//! callers of this crate.

pub mod engine;
pub mod models;
pub mod services;
