mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use common::{seed_customer, TestContext};
use erp_fulfillment::{
    entities::{
        customer::TaxHandling,
        invoice::{InvoiceMode, InvoiceStatus},
        order::{DeliveryStatus, InvoicingStatus, PaymentStatus},
    },
    events::Event,
    services::{
        delivery_notes::{DeliveryLineRequest, DeliveryNoteRequest},
        order_status::OrderStatus,
        orders::{NewOrder, NewOrderLine},
    },
    ErrorKind,
};

#[tokio::test]
async fn full_delivery_invoice_and_payment_completes_the_order() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, lines) = app.order_with_lines(&[(10, 8)]).await;

    let note = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .expect("delivery note");
    assert_eq!(note.lines.len(), 1);
    assert_eq!(note.lines[0].order_line_id, lines[0].id);
    assert_eq!(note.total_quantity(), dec!(10));
    assert_eq!(note.header.number, format!("{}-001", order.number));

    let invoice = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::FromDelivery)
        .await
        .expect("invoice");
    assert_eq!(invoice.lines.len(), 1);
    assert_eq!(invoice.lines[0].quantity, dec!(10));
    assert_eq!(invoice.header.net_total, dec!(80));
    assert_eq!(invoice.header.tax_total, dec!(20));
    assert_eq!(invoice.header.gross_total, dec!(100));
    assert_eq!(invoice.header.status, InvoiceStatus::Open);

    let today = Utc::now().date_naive();
    let receipt = app
        .services()
        .payments
        .record_payment(&ctx, invoice.header.id, dec!(100), today)
        .await
        .expect("payment");
    assert_eq!(receipt.invoice.status, InvoiceStatus::Paid);
    assert_eq!(receipt.balance.open_balance, dec!(0));

    let order = app.order(order.id).await;
    assert_eq!(order.delivery_status, DeliveryStatus::Shipped);
    assert_eq!(order.invoice_status, InvoicingStatus::Invoiced);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.paid_at, Some(today));
    assert!(order.fully_delivered);
    assert!(order.shipped_at.is_some());
    assert_eq!(order.open_line_count, 0);

    let status = app
        .services()
        .order_status
        .get_status(&ctx, order.id)
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Shipped);
}

#[tokio::test]
async fn partial_deliveries_add_up_to_the_ordered_quantity() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, lines) = app.order_with_lines(&[(10, 8)]).await;

    let first = app
        .services()
        .delivery_notes
        .create_delivery_note(
            &ctx,
            DeliveryNoteRequest {
                order_id: order.id,
                lines: Some(vec![DeliveryLineRequest {
                    order_line_id: lines[0].id,
                    quantity: dec!(4),
                    lot_id: None,
                }]),
                ship_from_location_id: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(first.total_quantity(), dec!(4));

    let after_first = app.order(order.id).await;
    assert_eq!(after_first.delivery_status, DeliveryStatus::PartiallyShipped);
    assert!(after_first.shipped_at.is_none());
    assert_eq!(after_first.open_line_count, 1);

    let second = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();
    assert_eq!(second.total_quantity(), dec!(6));
    assert_eq!(second.header.sequence, 2);
    assert_eq!(first.total_quantity() + second.total_quantity(), dec!(10));

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDeliverableLines);

    let order = app.order(order.id).await;
    assert_eq!(order.delivery_note_count, 2);
    assert!(order.fully_delivered);

    let notes = app
        .services()
        .delivery_notes
        .list_for_order(&ctx, order.id)
        .await
        .unwrap();
    assert_eq!(notes.len(), 2);
}

#[tokio::test]
async fn explicit_delivery_beyond_remaining_is_rejected() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, lines) = app.order_with_lines(&[(10, 8)]).await;

    let request = |quantity| DeliveryNoteRequest {
        order_id: order.id,
        lines: Some(vec![DeliveryLineRequest {
            order_line_id: lines[0].id,
            quantity,
            lot_id: None,
        }]),
        ship_from_location_id: None,
    };

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, request(dec!(11)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverDelivery);

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, request(dec!(0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // nothing was written by the failed attempts
    let order = app.order(order.id).await;
    assert_eq!(order.delivery_note_count, 0);
    assert_eq!(order.delivery_status, DeliveryStatus::NotShipped);
}

#[tokio::test]
async fn invoicing_in_steps_follows_the_deliveries() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, lines) = app.order_with_lines(&[(10, 8)]).await;

    let err = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::FromDelivery)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDeliveryNote);

    app.services()
        .delivery_notes
        .create_delivery_note(
            &ctx,
            DeliveryNoteRequest {
                order_id: order.id,
                lines: Some(vec![DeliveryLineRequest {
                    order_line_id: lines[0].id,
                    quantity: dec!(4),
                    lot_id: None,
                }]),
                ship_from_location_id: None,
            },
        )
        .await
        .unwrap();
    let first = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::FromDelivery)
        .await
        .unwrap();
    assert_eq!(first.header.gross_total, dec!(40));
    assert_eq!(
        app.order(order.id).await.invoice_status,
        InvoicingStatus::PartiallyInvoiced
    );

    app.services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();
    let second = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::FromDelivery)
        .await
        .unwrap();
    assert_eq!(second.lines[0].quantity, dec!(6));
    assert_eq!(second.header.gross_total, dec!(60));
    assert_ne!(first.header.number, second.header.number);

    // nothing pending: the call hands back the latest invoice
    let again = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::FromDelivery)
        .await
        .unwrap();
    assert!(again.replayed);
    assert_eq!(again.header.id, second.header.id);

    let order = app.order(order.id).await;
    assert_eq!(order.invoice_status, InvoicingStatus::Invoiced);
    assert_eq!(order.payment_status, PaymentStatus::Unpaid);
    let invoices = app
        .services()
        .invoices
        .list_for_order(&ctx, order.id)
        .await
        .unwrap();
    assert_eq!(invoices.len(), 2);
}

#[tokio::test]
async fn direct_invoice_bills_every_line_once() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, _) = app.order_with_lines(&[(10, 8), (2, 5)]).await;

    let invoice = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::Direct)
        .await
        .unwrap();
    assert_eq!(invoice.lines.len(), 2);
    assert_eq!(invoice.header.gross_total, dec!(112.5));
    assert_eq!(invoice.header.mode, Some(InvoiceMode::Direct));
    assert_eq!(
        invoice.header.due_on,
        Utc::now().date_naive() + Duration::days(14)
    );

    let status = app
        .services()
        .order_status
        .get_status(&ctx, order.id)
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::InProgress);

    let again = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::Direct)
        .await
        .unwrap();
    assert!(again.replayed);
    assert_eq!(again.header.id, invoice.header.id);

    app.services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();
    let err = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::FromDelivery)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverInvoice);
}

#[tokio::test]
async fn reverse_charge_customers_are_invoiced_without_tax() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let customer = seed_customer(&app.db, "Pharma B.V.", 30, TaxHandling::ReverseCharge).await;

    let order = app
        .services()
        .orders
        .create_order(
            &ctx,
            NewOrder {
                customer_id: customer.id,
                currency: "eur".into(),
                number: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(order.currency, "EUR");
    app.services()
        .orders
        .add_line(
            &ctx,
            NewOrderLine {
                order_id: order.id,
                article_id: app.article.id,
                quantity: dec!(5),
                unit_price: None,
                discount_percent: Some(dec!(50)),
                tax_rate: None,
            },
        )
        .await
        .unwrap();

    let invoice = app
        .services()
        .invoices
        .create_invoice(&ctx, order.id, InvoiceMode::Direct)
        .await
        .unwrap();
    assert_eq!(invoice.header.net_total, dec!(20));
    assert_eq!(invoice.header.tax_total, dec!(0));
    assert_eq!(invoice.lines[0].tax_rate, dec!(0));
    assert_eq!(invoice.header.payment_terms_days, 30);
}

#[tokio::test]
async fn replayed_delivery_note_returns_the_first_result() {
    let app = TestContext::new().await;
    let (order, _) = app.order_with_lines(&[(10, 8)]).await;
    let (other, _) = app.order_with_lines(&[(3, 8)]).await;

    let ctx = app.keyed("dn-4711");
    let first = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();
    let second = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.header.id, second.header.id);
    assert_eq!(second.total_quantity(), dec!(10));
    assert_eq!(app.order(order.id).await.delivery_note_count, 1);

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(other.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn external_order_numbers_are_idempotent_per_customer() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let stranger = seed_customer(&app.db, "Other GmbH", 7, TaxHandling::Standard).await;

    let new_order = |customer_id| NewOrder {
        customer_id,
        currency: "EUR".into(),
        number: Some("SHOP-1001".into()),
    };

    let first = app
        .services()
        .orders
        .create_order(&ctx, new_order(app.customer.id))
        .await
        .unwrap();
    let again = app
        .services()
        .orders
        .create_order(&ctx, new_order(app.customer.id))
        .await
        .unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(first.number, "SHOP-1001");

    let err = app
        .services()
        .orders
        .create_order(&ctx, new_order(stranger.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let generated = app
        .services()
        .orders
        .create_order(
            &ctx,
            NewOrder {
                customer_id: app.customer.id,
                currency: "EUR".into(),
                number: None,
            },
        )
        .await
        .unwrap();
    assert!(generated.number.starts_with("AU-"));
}

#[tokio::test]
async fn order_line_validation() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, _) = app.order_with_lines(&[]).await;

    let line = |quantity, discount| NewOrderLine {
        order_id: order.id,
        article_id: app.article.id,
        quantity,
        unit_price: None,
        discount_percent: Some(discount),
        tax_rate: None,
    };

    let err = app
        .services()
        .orders
        .add_line(&ctx, line(dec!(0), dec!(0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = app
        .services()
        .orders
        .add_line(&ctx, line(dec!(1), dec!(101)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let added = app
        .services()
        .orders
        .add_line(&ctx, line(dec!(2), dec!(0)))
        .await
        .unwrap();
    assert_eq!(added.unit_price, dec!(8));
    assert_eq!(added.tax_rate, dec!(25));
    assert_eq!(added.position, 1);

    let details = app.services().orders.get_order(&ctx, order.id).await.unwrap();
    assert_eq!(details.lines.len(), 1);
    assert_eq!(details.order.gross_total, dec!(20));
    assert_eq!(details.status, OrderStatus::Open);
}

#[tokio::test]
async fn cancellation_rules() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, _) = app.order_with_lines(&[(10, 8)]).await;

    let err = app
        .services()
        .orders
        .cancel_order(&ctx, order.id, "  ")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let cancelled = app
        .services()
        .orders
        .cancel_order(&ctx, order.id, "customer withdrew")
        .await
        .unwrap();
    assert!(cancelled.cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("customer withdrew"));

    let again = app
        .services()
        .orders
        .cancel_order(&ctx, order.id, "twice")
        .await
        .unwrap();
    assert_eq!(again.cancel_reason.as_deref(), Some("customer withdrew"));

    let status = app
        .services()
        .order_status
        .get_status(&ctx, order.id)
        .await
        .unwrap();
    assert_eq!(status, OrderStatus::Cancelled);

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = app
        .services()
        .orders
        .add_line(
            &ctx,
            NewOrderLine {
                order_id: order.id,
                article_id: app.article.id,
                quantity: dec!(1),
                unit_price: None,
                discount_percent: None,
                tax_rate: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // an order with a delivery note can no longer be cancelled
    let (delivered, _) = app.order_with_lines(&[(1, 8)]).await;
    app.services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(delivered.id))
        .await
        .unwrap();
    let err = app
        .services()
        .orders
        .cancel_order(&ctx, delivered.id, "too late")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn workflow_moves_forward_only() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, _) = app.order_with_lines(&[(1, 8)]).await;

    let transition = app
        .services()
        .order_status
        .advance_workflow(&ctx, order.id, OrderStatus::ReadyToShip)
        .await
        .unwrap();
    assert_eq!(transition.from, OrderStatus::Open);
    assert_eq!(transition.to, OrderStatus::ReadyToShip);

    let err = app
        .services()
        .order_status
        .advance_workflow(&ctx, order.id, OrderStatus::InProgress)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = app
        .services()
        .order_status
        .advance_workflow(&ctx, order.id, OrderStatus::Cancelled)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn recalculation_is_idempotent() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let (order, _) = app.order_with_lines(&[(10, 8), (3, 4)]).await;
    app.services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();

    let first = app
        .services()
        .order_summary
        .recalculate(&ctx, order.id)
        .await
        .unwrap();
    let before = app.order(order.id).await;
    let second = app
        .services()
        .order_summary
        .recalculate(&ctx, order.id)
        .await
        .unwrap();
    let after = app.order(order.id).await;

    assert_eq!(first, second);
    assert_eq!(before.updated_at, after.updated_at);
    assert_eq!(second.gross_total, dec!(115));
    assert_eq!(second.delivered_line_count, 2);

    let progress = app
        .services()
        .order_summary
        .line_progress(&ctx, order.id)
        .await
        .unwrap();
    assert!(progress.iter().all(|line| line.remaining() == dec!(0)));
}

#[tokio::test]
async fn committed_operations_publish_events() {
    let (app, mut events) = TestContext::with_events().await;
    let ctx = app.ctx();
    let (order, lines) = app.order_with_lines(&[(2, 8)]).await;

    assert_matches!(
        events.try_recv(),
        Ok(Event::OrderCreated { order_id, .. }) if order_id == order.id
    );
    assert_matches!(
        events.try_recv(),
        Ok(Event::OrderLineAdded { order_line_id, .. }) if order_line_id == lines[0].id
    );
    while events.try_recv().is_ok() {}

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(
            &ctx,
            DeliveryNoteRequest {
                order_id: order.id,
                lines: Some(vec![DeliveryLineRequest {
                    order_line_id: lines[0].id,
                    quantity: dec!(3),
                    lot_id: None,
                }]),
                ship_from_location_id: None,
            },
        )
        .await;
    assert!(err.is_err());
    assert!(events.try_recv().is_err(), "a failed operation publishes nothing");

    let note = app
        .services()
        .delivery_notes
        .create_delivery_note(&ctx, DeliveryNoteRequest::all_remaining(order.id))
        .await
        .unwrap();
    assert_matches!(
        events.try_recv(),
        Ok(Event::DeliveryNoteCreated { delivery_note_id, .. }) if delivery_note_id == note.header.id
    );
}
