//! Domain models for invoicing-engine.

mod invoice;
mod line_item;
mod payment;

pub use invoice::{
    CreateInvoice, DiscountType, Invoice, InvoiceStatus, ListInvoicesFilter, PaymentTerms,
    UpdateInvoice,
};
pub use line_item::{LineItem, LineItemDraft, UpdateLineItem};
pub use payment::{CreatePayment, Payment, PaymentMethod, PaymentStatus};
