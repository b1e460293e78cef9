//! Invoice model for invoicing-engine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::LineItemDraft;

/// Invoice lifecycle status.
///
/// Transition rules live in `engine::lifecycle`; nothing else re-derives
/// legality from these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Viewed,
    Paid,
    Overdue,
    Cancelled,
    Refunded,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Viewed => "viewed",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Refunded => "refunded",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Cancelled | InvoiceStatus::Refunded)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invoice-level discount kind. A missing discount means none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "discount_type", rename_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

/// Payment terms controlling due-date derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_terms", rename_all = "snake_case")]
pub enum PaymentTerms {
    DueOnReceipt,
    Net15,
    Net30,
    Net60,
    Custom,
}

impl PaymentTerms {
    /// Days until due, `None` for custom terms (caller supplies the days).
    pub fn net_days(&self) -> Option<i64> {
        match self {
            PaymentTerms::DueOnReceipt => Some(0),
            PaymentTerms::Net15 => Some(15),
            PaymentTerms::Net30 => Some(30),
            PaymentTerms::Net60 => Some(60),
            PaymentTerms::Custom => None,
        }
    }

    /// Derive a due date from the invoice date.
    pub fn due_date_from(&self, invoice_date: NaiveDate, custom_days: Option<i32>) -> NaiveDate {
        let days = self
            .net_days()
            .unwrap_or_else(|| i64::from(custom_days.unwrap_or(0)));
        invoice_date + chrono::Duration::days(days)
    }
}

/// Invoice record.
///
/// Monetary fields obey `total_amount = subtotal - discount_amount +
/// tax_amount + shipping_amount` and `amount_due = total_amount -
/// amount_paid`; both are maintained by the engine, never ad hoc.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub business_id: Uuid,
    pub client_id: Uuid,
    pub invoice_number: String,
    pub status: InvoiceStatus,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub payment_terms: PaymentTerms,
    pub custom_due_days: Option<i32>,
    pub currency: String,
    pub subtotal: Decimal,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub total_amount: Decimal,
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
    pub notes: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a draft invoice with its line items.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub business_id: Uuid,
    pub client_id: Uuid,
    pub invoice_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub payment_terms: PaymentTerms,
    pub custom_due_days: Option<i32>,
    pub currency: String,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Decimal,
    pub shipping_amount: Decimal,
    pub notes: Option<String>,
    pub items: Vec<LineItemDraft>,
}

/// Input for updating a draft invoice.
#[derive(Debug, Clone, Default)]
pub struct UpdateInvoice {
    pub due_date: Option<NaiveDate>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub shipping_amount: Option<Decimal>,
    pub notes: Option<String>,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub client_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
