//! Shared builders for invoicing-engine tests.
#![allow(dead_code)]

use chrono::{NaiveDate, TimeZone, Utc};
use invoicing_engine::models::{
    Invoice, InvoiceStatus, Payment, PaymentMethod, PaymentStatus, PaymentTerms,
};
use rust_decimal::Decimal;
use uuid::Uuid;

pub fn test_date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// An invoice with consistent monetary fields: subtotal == total, nothing
/// paid yet.
pub fn invoice(status: InvoiceStatus, total: Decimal) -> Invoice {
    let created = Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap();
    Invoice {
        invoice_id: Uuid::new_v4(),
        business_id: Uuid::new_v4(),
        client_id: Uuid::new_v4(),
        invoice_number: "INV-00001".to_string(),
        status,
        invoice_date: test_date(2026, 1, 15),
        due_date: test_date(2026, 2, 14),
        payment_terms: PaymentTerms::Net30,
        custom_due_days: None,
        currency: "USD".to_string(),
        subtotal: total,
        discount_type: None,
        discount_value: Decimal::ZERO,
        discount_amount: Decimal::ZERO,
        tax_amount: Decimal::ZERO,
        shipping_amount: Decimal::ZERO,
        total_amount: total,
        amount_paid: Decimal::ZERO,
        amount_due: total,
        notes: None,
        sent_at: None,
        viewed_at: None,
        paid_at: None,
        cancelled_at: None,
        created_utc: created,
        updated_utc: created,
    }
}

/// A completed payment against the given invoice.
pub fn payment_for(invoice: &Invoice, amount: Decimal) -> Payment {
    let created = Utc.with_ymd_and_hms(2026, 1, 20, 12, 0, 0).unwrap();
    Payment {
        payment_id: Uuid::new_v4(),
        invoice_id: invoice.invoice_id,
        business_id: invoice.business_id,
        payment_number: "PAY-00001".to_string(),
        payment_date: test_date(2026, 1, 20),
        amount,
        payment_method: PaymentMethod::BankTransfer,
        status: PaymentStatus::Completed,
        transaction_id: None,
        reference_number: None,
        notes: None,
        created_utc: created,
        updated_utc: created,
    }
}
