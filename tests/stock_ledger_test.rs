mod common;

use rust_decimal_macros::dec;

use common::{seed_location, TestContext};
use erp_fulfillment::{
    entities::{quarantine_event::QuarantineAction, stock_movement::MovementReason},
    services::{
        delivery_notes::{DeliveryLineRequest, DeliveryNoteRequest},
        inventory::{IssueReason, StockIssue, StockReceipt, StockTransfer},
        quarantine::LotState,
    },
    ErrorKind,
};

fn lot_issue(article_id: i64, lot_id: i64, quantity: rust_decimal::Decimal) -> StockIssue {
    StockIssue {
        article_id,
        location_id: None,
        quantity,
        reason: IssueReason::Shrinkage,
        source_lot_id: Some(lot_id),
        reference_document_id: None,
    }
}

#[tokio::test]
async fn quarantine_round_trip_only_moves_the_lot() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let inventory = &app.services().inventory;
    let lot = app.receive_lot(app.main, "CH-2024-01", 50).await;
    let total_before = inventory.stock_balance(&ctx, app.article.id, None).await.unwrap();

    let quarantined = app
        .services()
        .quarantine
        .quarantine(&ctx, lot.id, "recall")
        .await
        .unwrap();
    assert_eq!(quarantined.state, LotState::Quarantined);
    assert_eq!(quarantined.quantity, dec!(50));
    let movement = quarantined.movement.as_ref().expect("quarantine movement");
    assert_eq!(movement.reason, MovementReason::Quarantine);
    assert_eq!(movement.from_location_id, Some(app.main));
    assert_eq!(movement.to_location_id, Some(app.quarantine));
    assert_eq!(app.lot(lot.id).await.location_id, app.quarantine);
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, Some(app.main)).await.unwrap(),
        dec!(0)
    );
    assert_eq!(inventory.available_balance(&ctx, app.article.id).await.unwrap(), dec!(0));

    let released = app
        .services()
        .quarantine
        .release(&ctx, lot.id, None)
        .await
        .unwrap();
    assert_eq!(released.state, LotState::Available);
    let movement = released.movement.as_ref().expect("release movement");
    assert_eq!(movement.reason, MovementReason::Release);
    assert_eq!(movement.from_location_id, Some(app.quarantine));
    assert_eq!(movement.to_location_id, Some(app.main));
    assert_eq!(movement.quantity, dec!(50));

    assert_eq!(app.lot(lot.id).await.location_id, app.main);
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, None).await.unwrap(),
        total_before
    );
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, Some(app.main)).await.unwrap(),
        dec!(50)
    );

    let history = app.services().quarantine.history(&ctx, lot.id).await.unwrap();
    let actions: Vec<_> = history.iter().map(|event| event.action).collect();
    assert_eq!(actions, vec![QuarantineAction::Quarantine, QuarantineAction::Release]);
    assert_eq!(history[0].reason.as_deref(), Some("recall"));
    assert_eq!(
        inventory.lot_movements(&ctx, lot.id).await.unwrap().len(),
        3
    );
}

#[tokio::test]
async fn quarantine_and_release_must_alternate() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let lot = app.receive_lot(app.main, "CH-ALT", 10).await;

    let err = app
        .services()
        .quarantine
        .release(&ctx, lot.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    app.services()
        .quarantine
        .quarantine(&ctx, lot.id, "damaged packaging")
        .await
        .unwrap();
    let err = app
        .services()
        .quarantine
        .quarantine(&ctx, lot.id, "again")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(
        app.services().quarantine.lot_state(&ctx, lot.id).await.unwrap(),
        LotState::Quarantined
    );

    app.services().quarantine.release(&ctx, lot.id, None).await.unwrap();
    let err = app
        .services()
        .quarantine
        .release(&ctx, lot.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(app.services().quarantine.history(&ctx, lot.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn release_honours_a_target_hint() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let lot = app.receive_lot(app.main, "CH-HINT", 8).await;
    app.services()
        .quarantine
        .quarantine(&ctx, lot.id, "temperature excursion")
        .await
        .unwrap();

    let err = app
        .services()
        .quarantine
        .release(&ctx, lot.id, Some(app.quarantine))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let released = app
        .services()
        .quarantine
        .release(&ctx, lot.id, Some(app.shelf))
        .await
        .unwrap();
    assert_eq!(released.event.to_location_id, app.shelf);
    assert_eq!(app.lot(lot.id).await.location_id, app.shelf);
    assert_eq!(
        app.services()
            .inventory
            .stock_balance(&ctx, app.article.id, Some(app.shelf))
            .await
            .unwrap(),
        dec!(8)
    );
}

#[tokio::test]
async fn empty_lots_cannot_be_quarantined() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let lot = app.receive_lot(app.main, "CH-EMPTY", 5).await;
    app.services()
        .inventory
        .record_issue(&ctx, lot_issue(app.article.id, lot.id, dec!(5)))
        .await
        .unwrap();

    let err = app
        .services()
        .quarantine
        .quarantine(&ctx, lot.id, "recall")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(app.services().quarantine.history(&ctx, lot.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn replayed_quarantine_returns_the_first_transition() {
    let app = TestContext::new().await;
    let lot = app.receive_lot(app.main, "CH-KEY", 12).await;
    let other = app.receive_lot(app.main, "CH-KEY-2", 3).await;
    let ctx = app.keyed("q-lot-1");

    let first = app
        .services()
        .quarantine
        .quarantine(&ctx, lot.id, "recall")
        .await
        .unwrap();
    let second = app
        .services()
        .quarantine
        .quarantine(&ctx, lot.id, "recall")
        .await
        .unwrap();
    assert_eq!(first.event.id, second.event.id);
    assert_eq!(app.services().quarantine.history(&app.ctx(), lot.id).await.unwrap().len(), 1);

    let err = app
        .services()
        .quarantine
        .quarantine(&ctx, other.id, "recall")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn quarantined_stock_cannot_be_sold() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let lot = app.receive_lot(app.main, "CH-SALE", 20).await;
    app.services()
        .quarantine
        .quarantine(&ctx, lot.id, "recall")
        .await
        .unwrap();

    let err = app
        .services()
        .inventory
        .record_issue(
            &ctx,
            StockIssue {
                reason: IssueReason::Sale,
                ..lot_issue(app.article.id, lot.id, dec!(1))
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // write-offs from quarantine are allowed
    app.services()
        .inventory
        .record_issue(&ctx, lot_issue(app.article.id, lot.id, dec!(2)))
        .await
        .unwrap();
    assert_eq!(
        app.services().inventory.lot_balance(&ctx, lot.id).await.unwrap(),
        dec!(18)
    );
}

#[tokio::test]
async fn issue_beyond_lot_balance_leaves_stock_untouched() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let lot = app.receive_lot(app.main, "CH-60", 50).await;

    let err = app
        .services()
        .inventory
        .record_issue(&ctx, lot_issue(app.article.id, lot.id, dec!(60)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    let inventory = &app.services().inventory;
    assert_eq!(inventory.lot_balance(&ctx, lot.id).await.unwrap(), dec!(50));
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, Some(app.main)).await.unwrap(),
        dec!(50)
    );
    assert_eq!(inventory.lot_movements(&ctx, lot.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn issues_without_a_lot_use_the_location_balance() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let inventory = &app.services().inventory;
    inventory
        .record_receipt(
            &ctx,
            StockReceipt {
                article_id: app.article.id,
                location_id: app.shelf,
                quantity: dec!(7.5),
                lot_number: None,
                expiry_date: None,
                unit_cost: None,
                reference_document_id: None,
            },
        )
        .await
        .unwrap();

    let issue = |location_id, quantity| StockIssue {
        article_id: app.article.id,
        location_id,
        quantity,
        reason: IssueReason::StockCount,
        source_lot_id: None,
        reference_document_id: None,
    };

    // nothing at the default location
    let err = inventory.record_issue(&ctx, issue(None, dec!(1))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    let movement = inventory
        .record_issue(&ctx, issue(Some(app.shelf), dec!(2.5)))
        .await
        .unwrap();
    assert_eq!(movement.reason, MovementReason::StockCount);
    assert_eq!(movement.lot_id, None);
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, Some(app.shelf)).await.unwrap(),
        dec!(5)
    );

    let err = inventory
        .record_issue(&ctx, issue(Some(app.shelf), dec!(-1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn receipts_validate_lots_and_costs() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let inventory = &app.services().inventory;
    let lot = app.receive_lot(app.main, "CH-R", 10).await;

    let receipt = |location_id, batch: &str| StockReceipt {
        article_id: app.article.id,
        location_id,
        quantity: dec!(5),
        lot_number: Some(batch.to_string()),
        expiry_date: None,
        unit_cost: None,
        reference_document_id: None,
    };

    // topping up the lot where it lives
    let movement = inventory.record_receipt(&ctx, receipt(app.main, "CH-R")).await.unwrap();
    assert_eq!(movement.lot_id, Some(lot.id));
    assert_eq!(inventory.lot_balance(&ctx, lot.id).await.unwrap(), dec!(15));

    let err = inventory
        .record_receipt(&ctx, receipt(app.shelf, "CH-R"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = inventory
        .record_receipt(
            &ctx,
            StockReceipt {
                unit_cost: Some(dec!(-1)),
                ..receipt(app.main, "CH-NEG")
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = inventory.record_receipt(&ctx, receipt(999, "CH-X")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let found = inventory
        .find_lot(&ctx, app.article.id, "CH-R")
        .await
        .unwrap()
        .expect("lot by batch number");
    assert_eq!(found.id, lot.id);
    assert!(inventory.find_lot(&ctx, app.article.id, "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn goods_receipt_is_all_or_nothing_and_replayable() {
    let app = TestContext::new().await;
    let inventory = &app.services().inventory;
    let line = |batch: &str, quantity| StockReceipt {
        article_id: app.article.id,
        location_id: app.main,
        quantity,
        lot_number: Some(batch.to_string()),
        expiry_date: None,
        unit_cost: Some(dec!(2.5)),
        reference_document_id: Some(77),
    };

    let err = inventory
        .record_goods_receipt(&app.ctx(), vec![line("WE-1", dec!(4)), line("WE-2", dec!(0))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(
        inventory.stock_balance(&app.ctx(), app.article.id, None).await.unwrap(),
        dec!(0)
    );

    let ctx = app.keyed("we-77");
    let lines = vec![line("WE-1", dec!(4)), line("WE-2", dec!(6))];
    let first = inventory.record_goods_receipt(&ctx, lines.clone()).await.unwrap();
    let second = inventory.record_goods_receipt(&ctx, lines).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(
        first.iter().map(|m| m.id).collect::<Vec<_>>(),
        second.iter().map(|m| m.id).collect::<Vec<_>>()
    );
    assert_eq!(
        inventory.stock_balance(&app.ctx(), app.article.id, None).await.unwrap(),
        dec!(10)
    );
}

#[tokio::test]
async fn lots_transfer_as_a_whole() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let inventory = &app.services().inventory;
    let lot = app.receive_lot(app.main, "CH-T", 9).await;

    let transfer = |quantity, to_location_id| StockTransfer {
        article_id: app.article.id,
        lot_id: Some(lot.id),
        from_location_id: None,
        to_location_id,
        quantity,
    };

    let err = inventory.transfer(&ctx, transfer(dec!(4), app.shelf)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = inventory.transfer(&ctx, transfer(dec!(9), app.main)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let movement = inventory.transfer(&ctx, transfer(dec!(9), app.shelf)).await.unwrap();
    assert_eq!(movement.reason, MovementReason::Transfer);
    assert_eq!(app.lot(lot.id).await.location_id, app.shelf);
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, Some(app.shelf)).await.unwrap(),
        dec!(9)
    );
    assert_eq!(inventory.stock_balance(&ctx, app.article.id, None).await.unwrap(), dec!(9));
}

#[tokio::test]
async fn coverage_compares_open_demand_with_available_stock() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    app.receive_lot(app.main, "CH-COV", 6).await;
    let held = app.receive_lot(app.main, "CH-HOLD", 4).await;
    app.services()
        .quarantine
        .quarantine(&ctx, held.id, "recall")
        .await
        .unwrap();
    app.order_with_lines(&[(10, 8)]).await;
    let (cancelled, _) = app.order_with_lines(&[(100, 8)]).await;
    app.services()
        .orders
        .cancel_order(&ctx, cancelled.id, "duplicate")
        .await
        .unwrap();

    let coverage = app
        .services()
        .inventory
        .stock_coverage(&ctx, app.article.id, dec!(1))
        .await
        .unwrap();
    assert_eq!(coverage.on_hand, dec!(10));
    assert_eq!(coverage.available, dec!(6));
    assert_eq!(coverage.open_demand, dec!(10));
    assert_eq!(coverage.shortfall, dec!(3));
    assert!(!coverage.is_covered());

    let err = app
        .services()
        .inventory
        .stock_coverage(&ctx, app.article.id, dec!(-1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn shipping_from_stock_issues_sale_movements() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let lot = app.receive_lot(app.main, "CH-SHIP", 10).await;
    let (order, lines) = app.order_with_lines(&[(4, 8)]).await;

    let note = app
        .services()
        .delivery_notes
        .create_delivery_note(
            &ctx,
            DeliveryNoteRequest {
                order_id: order.id,
                lines: Some(vec![DeliveryLineRequest {
                    order_line_id: lines[0].id,
                    quantity: dec!(4),
                    lot_id: Some(lot.id),
                }]),
                ship_from_location_id: Some(app.main),
            },
        )
        .await
        .unwrap();

    assert_eq!(note.movements.len(), 1);
    let movement = &note.movements[0];
    assert_eq!(movement.reason, MovementReason::Sale);
    assert_eq!(movement.reference_document_id, Some(note.header.id));
    assert_eq!(movement.lot_id, Some(lot.id));
    assert_eq!(
        app.services().inventory.lot_balance(&ctx, lot.id).await.unwrap(),
        dec!(6)
    );

    let loaded = app
        .services()
        .delivery_notes
        .get_delivery_note(&ctx, note.header.id)
        .await
        .unwrap();
    assert_eq!(loaded.movements.len(), 1);
    assert_eq!(loaded.lines.len(), 1);
}

#[tokio::test]
async fn stock_shortage_rolls_back_the_delivery_note() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let spare = seed_location(&app.db, "Overflow", false).await;
    app.receive_lot(spare, "CH-FEW", 3).await;
    let (order, _) = app.order_with_lines(&[(5, 8)]).await;

    let err = app
        .services()
        .delivery_notes
        .create_delivery_note(
            &ctx,
            DeliveryNoteRequest {
                ship_from_location_id: Some(spare),
                ..DeliveryNoteRequest::all_remaining(order.id)
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    let order = app.order(order.id).await;
    assert_eq!(order.delivery_note_count, 0);
    assert!(app
        .services()
        .delivery_notes
        .list_for_order(&ctx, order.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        app.services()
            .inventory
            .stock_balance(&ctx, app.article.id, Some(spare))
            .await
            .unwrap(),
        dec!(3)
    );
}

#[tokio::test]
async fn plain_transfers_never_cross_the_quarantine_boundary() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let inventory = &app.services().inventory;
    let quarantine = &app.services().quarantine;
    let lot = app.receive_lot(app.main, "CH-GATE", 50).await;

    let lot_transfer = |to_location_id| StockTransfer {
        article_id: app.article.id,
        lot_id: Some(lot.id),
        from_location_id: None,
        to_location_id,
        quantity: dec!(50),
    };

    // an available lot does not slip into quarantine through a transfer
    let err = inventory
        .transfer(&ctx, lot_transfer(app.quarantine))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(app.lot(lot.id).await.location_id, app.main);

    quarantine.quarantine(&ctx, lot.id, "recall").await.unwrap();

    // nor does a quarantined lot leave it
    let err = inventory.transfer(&ctx, lot_transfer(app.main)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = inventory
        .transfer(
            &ctx,
            StockTransfer {
                lot_id: None,
                from_location_id: Some(app.quarantine),
                ..lot_transfer(app.main)
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    assert_eq!(quarantine.lot_state(&ctx, lot.id).await.unwrap(), LotState::Quarantined);
    assert_eq!(app.lot(lot.id).await.location_id, app.quarantine);
    assert_eq!(inventory.lot_movements(&ctx, lot.id).await.unwrap().len(), 2);
    let err = inventory
        .record_issue(
            &ctx,
            StockIssue {
                reason: IssueReason::Sale,
                ..lot_issue(app.article.id, lot.id, dec!(50))
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    // the workflow still works end to end
    quarantine.release(&ctx, lot.id, None).await.unwrap();
    let movement = inventory.transfer(&ctx, lot_transfer(app.shelf)).await.unwrap();
    assert_eq!(movement.reason, MovementReason::Transfer);
    assert_eq!(app.lot(lot.id).await.location_id, app.shelf);
}

#[tokio::test]
async fn issues_without_a_lot_leave_lot_stock_alone() {
    let app = TestContext::new().await;
    let ctx = app.ctx();
    let inventory = &app.services().inventory;
    let lot = app.receive_lot(app.main, "CH-BOUND", 10).await;
    inventory
        .record_receipt(
            &ctx,
            StockReceipt {
                article_id: app.article.id,
                location_id: app.main,
                quantity: dec!(2),
                lot_number: None,
                expiry_date: None,
                unit_cost: None,
                reference_document_id: None,
            },
        )
        .await
        .unwrap();

    let loose_issue = |quantity| StockIssue {
        article_id: app.article.id,
        location_id: Some(app.main),
        quantity,
        reason: IssueReason::Shrinkage,
        source_lot_id: None,
        reference_document_id: None,
    };

    let err = inventory.record_issue(&ctx, loose_issue(dec!(5))).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);
    let err = inventory
        .transfer(
            &ctx,
            StockTransfer {
                article_id: app.article.id,
                lot_id: None,
                from_location_id: Some(app.main),
                to_location_id: app.shelf,
                quantity: dec!(5),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientStock);

    inventory.record_issue(&ctx, loose_issue(dec!(2))).await.unwrap();
    assert_eq!(
        inventory.stock_balance(&ctx, app.article.id, Some(app.main)).await.unwrap(),
        dec!(10)
    );
    assert_eq!(inventory.lot_balance(&ctx, lot.id).await.unwrap(), dec!(10));

    // the lot still holds everything it reports
    let transition = app
        .services()
        .quarantine
        .quarantine(&ctx, lot.id, "recall")
        .await
        .unwrap();
    assert_eq!(transition.quantity, dec!(10));
}
