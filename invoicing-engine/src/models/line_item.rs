//! Line item model for invoicing-engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::DiscountType;

/// Line item on an invoice.
///
/// Monetary columns are computed by `engine::line_item`; identity is fixed at
/// creation and the row is mutable only while the owning invoice is a draft.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub invoice_id: Uuid,
    pub business_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub tax_rate: Decimal,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub line_total: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

/// Input for a line item before any amounts are computed.
#[derive(Debug, Clone)]
pub struct LineItemDraft {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    /// Resolved tax percentage (0-100); lookup from product/category data is
    /// the caller's concern.
    pub tax_rate: Decimal,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Decimal,
    pub sort_order: i32,
}

impl LineItemDraft {
    pub fn new(description: impl Into<String>, quantity: Decimal, unit_price: Decimal) -> Self {
        Self {
            description: description.into(),
            quantity,
            unit_price,
            tax_rate: Decimal::ZERO,
            discount_type: None,
            discount_value: Decimal::ZERO,
            sort_order: 0,
        }
    }
}

/// Input for updating a line item on a draft invoice.
#[derive(Debug, Clone, Default)]
pub struct UpdateLineItem {
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
    pub discount_type: Option<DiscountType>,
    pub discount_value: Option<Decimal>,
    pub sort_order: Option<i32>,
}
