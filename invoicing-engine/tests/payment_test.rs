//! Payment reconciliation tests: partial payments, settlement, overpayment
//! rejection and refunds. Every assertion block re-checks the balance
//! identity `amount_due = total_amount - amount_paid`.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use invoicing_engine::engine::{apply_payment, refund_payment, EngineError};
use invoicing_engine::models::{Invoice, InvoiceStatus, PaymentStatus};
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{invoice, payment_for};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 25, 14, 30, 0).unwrap()
}

fn assert_balance_identity(inv: &Invoice) {
    assert_eq!(inv.amount_due, inv.total_amount - inv.amount_paid);
}

#[test]
fn partial_payment_reduces_balance_without_settling() {
    let inv = invoice(InvoiceStatus::Sent, dec!(1000.00));
    let pay = payment_for(&inv, dec!(400.00));

    let (updated, recorded) = apply_payment(&inv, &pay, now()).expect("payment applies");

    assert_eq!(updated.amount_paid, dec!(400.00));
    assert_eq!(updated.amount_due, dec!(600.00));
    assert_eq!(updated.status, InvoiceStatus::Sent);
    assert!(updated.paid_at.is_none());
    assert_eq!(recorded.status, PaymentStatus::Completed);
    assert_balance_identity(&updated);
}

#[test]
fn exact_settlement_moves_invoice_to_paid() {
    let inv = invoice(InvoiceStatus::Viewed, dec!(250.00));

    let first = payment_for(&inv, dec!(100.00));
    let (inv, _) = apply_payment(&inv, &first, now()).expect("payment applies");
    assert_eq!(inv.status, InvoiceStatus::Viewed);

    let second = payment_for(&inv, dec!(150.00));
    let (inv, _) = apply_payment(&inv, &second, now()).expect("payment applies");

    assert_eq!(inv.status, InvoiceStatus::Paid);
    assert_eq!(inv.amount_due, dec!(0.00));
    assert!(inv.paid_at.is_some());
    assert_balance_identity(&inv);
}

#[test]
fn full_payment_settles_and_a_cent_more_is_rejected() {
    let inv = invoice(InvoiceStatus::Viewed, dec!(1567.50));

    let too_much = payment_for(&inv, dec!(1567.51));
    assert!(matches!(
        apply_payment(&inv, &too_much, now()),
        Err(EngineError::OverpaymentNotAllowed { .. })
    ));

    let exact = payment_for(&inv, dec!(1567.50));
    let (inv, _) = apply_payment(&inv, &exact, now()).expect("payment applies");
    assert_eq!(inv.status, InvoiceStatus::Paid);
    assert_eq!(inv.amount_due, dec!(0.00));
    assert_balance_identity(&inv);
}

#[test]
fn overpayment_is_rejected_and_state_unchanged() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let pay = payment_for(&inv, dec!(100.01));

    let err = apply_payment(&inv, &pay, now()).expect_err("overpayment rejected");
    assert!(matches!(
        err,
        EngineError::OverpaymentNotAllowed { amount, amount_due }
            if amount == dec!(100.01) && amount_due == dec!(100.00)
    ));

    // The caller still holds the untouched invoice.
    assert_eq!(inv.amount_paid, dec!(0));
    assert_balance_identity(&inv);
}

#[test]
fn overpayment_check_uses_remaining_balance() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let (inv, _) =
        apply_payment(&inv, &payment_for(&inv, dec!(60.00)), now()).expect("payment applies");

    let too_much = payment_for(&inv, dec!(50.00));
    assert!(matches!(
        apply_payment(&inv, &too_much, now()),
        Err(EngineError::OverpaymentNotAllowed { .. })
    ));

    let exact = payment_for(&inv, dec!(40.00));
    let (inv, _) = apply_payment(&inv, &exact, now()).expect("payment applies");
    assert_eq!(inv.status, InvoiceStatus::Paid);
}

#[test]
fn rejects_payments_against_draft_and_terminal_invoices() {
    for status in [
        InvoiceStatus::Draft,
        InvoiceStatus::Paid,
        InvoiceStatus::Cancelled,
        InvoiceStatus::Refunded,
    ] {
        let inv = invoice(status, dec!(100.00));
        let pay = payment_for(&inv, dec!(50.00));
        assert!(
            matches!(
                apply_payment(&inv, &pay, now()),
                Err(EngineError::InvalidTransition { .. })
            ),
            "payment against {status} invoice should be rejected"
        );
    }
}

#[test]
fn rejects_non_completed_payment() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let mut pay = payment_for(&inv, dec!(50.00));
    pay.status = PaymentStatus::Pending;

    assert!(matches!(
        apply_payment(&inv, &pay, now()),
        Err(EngineError::PaymentNotCompleted(_))
    ));
}

#[test]
fn rejects_zero_or_negative_amounts() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));

    for amount in [dec!(0), dec!(-10.00)] {
        let pay = payment_for(&inv, amount);
        assert!(matches!(
            apply_payment(&inv, &pay, now()),
            Err(EngineError::InvalidAmount(_))
        ));
    }
}

#[test]
fn rejects_payment_bound_to_another_invoice() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let mut pay = payment_for(&inv, dec!(50.00));
    pay.invoice_id = Uuid::new_v4();

    assert!(apply_payment(&inv, &pay, now()).is_err());
}

#[test]
fn refund_of_settling_payment_moves_invoice_to_refunded() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let pay = payment_for(&inv, dec!(100.00));
    let (inv, pay) = apply_payment(&inv, &pay, now()).expect("payment applies");
    assert_eq!(inv.status, InvoiceStatus::Paid);

    let (inv, refunded) = refund_payment(&inv, &pay, now()).expect("refund applies");

    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(inv.status, InvoiceStatus::Refunded);
    assert_eq!(inv.amount_paid, dec!(0.00));
    assert_eq!(inv.amount_due, dec!(100.00));
    assert_balance_identity(&inv);
}

#[test]
fn refund_of_partial_payment_keeps_invoice_open() {
    let inv = invoice(InvoiceStatus::Viewed, dec!(500.00));
    let pay = payment_for(&inv, dec!(200.00));
    let (inv, pay) = apply_payment(&inv, &pay, now()).expect("payment applies");

    let (inv, refunded) = refund_payment(&inv, &pay, now()).expect("refund applies");

    // The invoice never reached paid, so it stays collectible as-is.
    assert_eq!(inv.status, InvoiceStatus::Viewed);
    assert_eq!(refunded.status, PaymentStatus::Refunded);
    assert_eq!(inv.amount_due, dec!(500.00));
    assert_balance_identity(&inv);
}

#[test]
fn refunded_payment_cannot_be_refunded_twice() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let pay = payment_for(&inv, dec!(100.00));
    let (inv, pay) = apply_payment(&inv, &pay, now()).expect("payment applies");
    let (inv, pay) = refund_payment(&inv, &pay, now()).expect("refund applies");

    assert!(matches!(
        refund_payment(&inv, &pay, now()),
        Err(EngineError::PaymentNotCompleted(_))
    ));
}

#[test]
fn refunded_invoice_accepts_no_further_payments() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let pay = payment_for(&inv, dec!(100.00));
    let (inv, pay) = apply_payment(&inv, &pay, now()).expect("payment applies");
    let (inv, _) = refund_payment(&inv, &pay, now()).expect("refund applies");

    let retry = payment_for(&inv, dec!(100.00));
    assert!(matches!(
        apply_payment(&inv, &retry, now()),
        Err(EngineError::InvalidTransition { .. })
    ));
}
