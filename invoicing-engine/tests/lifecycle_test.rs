//! Lifecycle state machine tests: legal transitions, terminal states and the
//! derived overdue status.

mod common;

use chrono::{TimeZone, Utc};
use invoicing_engine::engine::{effective_status, transition, EngineError, TransitionContext};
use invoicing_engine::models::InvoiceStatus;
use rust_decimal_macros::dec;

use common::{invoice, test_date};

fn ctx(line_item_count: usize, has_completed_payment: bool) -> TransitionContext {
    TransitionContext {
        line_item_count,
        has_completed_payment,
        now: Utc.with_ymd_and_hms(2026, 1, 16, 10, 0, 0).unwrap(),
    }
}

#[test]
fn send_moves_draft_to_sent_and_stamps_sent_at() {
    let inv = invoice(InvoiceStatus::Draft, dec!(100.00));
    let sent = transition(&inv, InvoiceStatus::Sent, &ctx(2, false)).expect("legal transition");

    assert_eq!(sent.status, InvoiceStatus::Sent);
    assert!(sent.sent_at.is_some());
    assert!(sent.viewed_at.is_none());
}

#[test]
fn cannot_send_an_empty_invoice() {
    let inv = invoice(InvoiceStatus::Draft, dec!(0.00));
    assert!(matches!(
        transition(&inv, InvoiceStatus::Sent, &ctx(0, false)),
        Err(EngineError::EmptyInvoice(_))
    ));
}

#[test]
fn zero_total_invoice_with_items_can_be_sent() {
    let inv = invoice(InvoiceStatus::Draft, dec!(0.00));
    let sent = transition(&inv, InvoiceStatus::Sent, &ctx(1, false)).expect("legal transition");
    assert_eq!(sent.status, InvoiceStatus::Sent);
}

#[test]
fn marking_viewed_is_idempotent() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    let viewed = transition(&inv, InvoiceStatus::Viewed, &ctx(1, false)).expect("legal transition");
    assert_eq!(viewed.status, InvoiceStatus::Viewed);
    let first_seen = viewed.viewed_at;
    assert!(first_seen.is_some());

    // A second view keeps the original timestamp.
    let later = TransitionContext {
        now: Utc.with_ymd_and_hms(2026, 1, 18, 8, 0, 0).unwrap(),
        ..ctx(1, false)
    };
    let again = transition(&viewed, InvoiceStatus::Viewed, &later).expect("legal transition");
    assert_eq!(again.status, InvoiceStatus::Viewed);
    assert_eq!(again.viewed_at, first_seen);
}

#[test]
fn draft_cannot_be_marked_viewed() {
    let inv = invoice(InvoiceStatus::Draft, dec!(100.00));
    assert!(matches!(
        transition(&inv, InvoiceStatus::Viewed, &ctx(1, false)),
        Err(EngineError::InvalidTransition {
            from: InvoiceStatus::Draft,
            to: InvoiceStatus::Viewed,
        })
    ));
}

#[test]
fn cancel_is_allowed_until_money_arrives() {
    for status in [
        InvoiceStatus::Draft,
        InvoiceStatus::Sent,
        InvoiceStatus::Viewed,
    ] {
        let inv = invoice(status, dec!(100.00));
        let cancelled =
            transition(&inv, InvoiceStatus::Cancelled, &ctx(1, false)).expect("legal transition");
        assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
    }
}

#[test]
fn cannot_cancel_once_a_payment_completed() {
    let inv = invoice(InvoiceStatus::Viewed, dec!(100.00));
    assert!(matches!(
        transition(&inv, InvoiceStatus::Cancelled, &ctx(1, true)),
        Err(EngineError::CannotCancelPaidInvoice(_))
    ));

    let paid = invoice(InvoiceStatus::Paid, dec!(100.00));
    assert!(matches!(
        transition(&paid, InvoiceStatus::Cancelled, &ctx(1, false)),
        Err(EngineError::CannotCancelPaidInvoice(_))
    ));
}

#[test]
fn paid_is_not_externally_requestable() {
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    assert!(matches!(
        transition(&inv, InvoiceStatus::Paid, &ctx(1, false)),
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[test]
fn terminal_states_admit_no_transitions() {
    for status in [InvoiceStatus::Cancelled, InvoiceStatus::Refunded] {
        let inv = invoice(status, dec!(100.00));
        for target in [
            InvoiceStatus::Sent,
            InvoiceStatus::Viewed,
            InvoiceStatus::Cancelled,
        ] {
            assert!(
                transition(&inv, target, &ctx(1, false)).is_err(),
                "{status} -> {target} should be rejected"
            );
        }
    }
}

#[test]
fn overdue_is_derived_not_stored() {
    let mut inv = invoice(InvoiceStatus::Sent, dec!(100.00));

    // Due 2026-02-14: on the due date itself the invoice is not yet overdue.
    assert_eq!(
        effective_status(&inv, test_date(2026, 2, 14)),
        InvoiceStatus::Sent
    );
    assert_eq!(
        effective_status(&inv, test_date(2026, 2, 15)),
        InvoiceStatus::Overdue
    );

    // The stored status never changed; settling the balance clears the
    // derived overdue with no transition.
    assert_eq!(inv.status, InvoiceStatus::Sent);
    inv.amount_paid = inv.total_amount;
    inv.amount_due = dec!(0);
    assert_eq!(
        effective_status(&inv, test_date(2026, 2, 15)),
        InvoiceStatus::Sent
    );
}

#[test]
fn overdue_applies_to_viewed_but_not_draft() {
    let viewed = invoice(InvoiceStatus::Viewed, dec!(100.00));
    assert_eq!(
        effective_status(&viewed, test_date(2026, 3, 1)),
        InvoiceStatus::Overdue
    );

    let draft = invoice(InvoiceStatus::Draft, dec!(100.00));
    assert_eq!(
        effective_status(&draft, test_date(2026, 3, 1)),
        InvoiceStatus::Draft
    );
}

#[test]
fn overdue_invoice_can_still_be_cancelled() {
    // The stored status stays sent, so cancellation remains legal even while
    // the invoice presents as overdue.
    let inv = invoice(InvoiceStatus::Sent, dec!(100.00));
    assert_eq!(
        effective_status(&inv, test_date(2026, 3, 1)),
        InvoiceStatus::Overdue
    );

    let cancelled =
        transition(&inv, InvoiceStatus::Cancelled, &ctx(1, false)).expect("legal transition");
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
}
