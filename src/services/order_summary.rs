//! Order summary (Eckdaten) recalculation.
//!
//! The summary is a pure function of an order's lines, delivery notes,
//! invoices, credit notes and payments. It is recomputed wholesale after
//! every fulfillment mutation and written to the cached columns of the
//! order header inside the same transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{lock_for_update, with_deadline, UnitOfWork},
    entities::{
        delivery_note::{self, Entity as DeliveryNoteEntity},
        delivery_note_line::{self, Entity as DeliveryNoteLineEntity},
        invoice::{self, Entity as InvoiceEntity, InvoiceKind},
        invoice_line::{self, Entity as InvoiceLineEntity},
        order::{self, DeliveryStatus, Entity as OrderEntity, InvoicingStatus, PaymentStatus},
        order_line::{self, Entity as OrderLineEntity},
        payment::{self, Entity as PaymentEntity},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        payments::open_balance,
        pricing::{line_amounts, LineAmounts},
    },
};

/// Everything the summary is derived from.
#[derive(Debug, Clone, Default)]
pub struct OrderSnapshot {
    pub lines: Vec<order_line::Model>,
    pub delivery_notes: Vec<delivery_note::Model>,
    pub delivery_lines: Vec<delivery_note_line::Model>,
    /// Invoices and credit notes of the order.
    pub invoices: Vec<invoice::Model>,
    pub invoice_lines: Vec<invoice_line::Model>,
    pub payments: Vec<payment::Model>,
}

/// Fulfillment progress of one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineProgress {
    pub order_line_id: i64,
    pub article_id: i64,
    pub ordered: Decimal,
    pub delivered: Decimal,
    pub invoiced: Decimal,
}

impl LineProgress {
    pub fn remaining(&self) -> Decimal {
        self.ordered - self.delivered
    }

    pub fn is_fully_delivered(&self) -> bool {
        self.delivered >= self.ordered
    }
}

/// Derived order aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_id: i64,
    pub net_total: Decimal,
    pub tax_total: Decimal,
    pub gross_total: Decimal,
    pub invoiced_gross: Decimal,
    /// Payments plus credit notes against non-cancelled invoices.
    pub settled: Decimal,
    pub open_balance: Decimal,
    pub delivery_status: DeliveryStatus,
    pub invoice_status: InvoicingStatus,
    pub payment_status: PaymentStatus,
    pub fully_delivered: bool,
    pub delivery_note_count: i32,
    pub delivered_line_count: i32,
    pub open_line_count: i32,
    pub paid_at: Option<NaiveDate>,
}

/// Delivered and invoiced quantities per order line, in line order.
pub fn line_progress(snapshot: &OrderSnapshot) -> Vec<LineProgress> {
    let mut delivered: HashMap<i64, Decimal> = HashMap::new();
    for line in &snapshot.delivery_lines {
        *delivered.entry(line.order_line_id).or_default() += line.quantity;
    }

    let live_invoices: Vec<i64> = snapshot
        .invoices
        .iter()
        .filter(|invoice| invoice.kind == InvoiceKind::Invoice && !invoice.is_cancelled())
        .map(|invoice| invoice.id)
        .collect();
    let mut invoiced: HashMap<i64, Decimal> = HashMap::new();
    for line in &snapshot.invoice_lines {
        if let Some(order_line_id) = line.order_line_id {
            if live_invoices.contains(&line.invoice_id) {
                *invoiced.entry(order_line_id).or_default() += line.quantity;
            }
        }
    }

    snapshot
        .lines
        .iter()
        .map(|line| LineProgress {
            order_line_id: line.id,
            article_id: line.article_id,
            ordered: line.quantity,
            delivered: delivered.get(&line.id).copied().unwrap_or_default(),
            invoiced: invoiced.get(&line.id).copied().unwrap_or_default(),
        })
        .collect()
}

/// Paid and credited amounts against one invoice.
pub fn settlement(snapshot: &OrderSnapshot, invoice_id: i64) -> (Decimal, Decimal) {
    let paid = snapshot
        .payments
        .iter()
        .filter(|payment| payment.invoice_id == invoice_id)
        .map(|payment| payment.amount)
        .sum();
    let credited = snapshot
        .invoices
        .iter()
        .filter(|note| {
            note.is_credit_note()
                && !note.is_cancelled()
                && note.original_invoice_id == Some(invoice_id)
        })
        .map(|note| note.gross_total.abs())
        .sum();
    (paid, credited)
}

pub fn compute_summary(order_id: i64, snapshot: &OrderSnapshot) -> OrderSummary {
    let totals = snapshot
        .lines
        .iter()
        .map(|line| {
            line_amounts(
                line.quantity,
                line.unit_price,
                line.discount_percent,
                line.tax_rate,
            )
        })
        .fold(LineAmounts::default(), |acc, amounts| acc + amounts);

    let progress = line_progress(snapshot);
    let any_delivered = progress.iter().any(|line| line.delivered > Decimal::ZERO);
    let fully_delivered = !progress.is_empty() && progress.iter().all(LineProgress::is_fully_delivered);
    let delivery_status = if fully_delivered {
        DeliveryStatus::Shipped
    } else if any_delivered {
        DeliveryStatus::PartiallyShipped
    } else {
        DeliveryStatus::NotShipped
    };

    let any_invoiced = progress.iter().any(|line| line.invoiced > Decimal::ZERO);
    let fully_invoiced =
        !progress.is_empty() && progress.iter().all(|line| line.invoiced >= line.ordered);
    let invoice_status = if fully_invoiced {
        InvoicingStatus::Invoiced
    } else if any_invoiced {
        InvoicingStatus::PartiallyInvoiced
    } else {
        InvoicingStatus::NotInvoiced
    };

    let mut invoiced_gross = Decimal::ZERO;
    let mut settled = Decimal::ZERO;
    let mut all_settled = true;
    let mut paid_at: Option<NaiveDate> = None;
    for invoice in snapshot
        .invoices
        .iter()
        .filter(|invoice| invoice.kind == InvoiceKind::Invoice && !invoice.is_cancelled())
    {
        let (paid, credited) = settlement(snapshot, invoice.id);
        invoiced_gross += invoice.gross_total;
        settled += paid + credited;
        if open_balance(invoice.gross_total, paid, credited) > Decimal::ZERO {
            all_settled = false;
        }
        paid_at = paid_at.max(invoice.paid_on);
    }

    let payment_status = if fully_invoiced && all_settled {
        PaymentStatus::Paid
    } else if settled > Decimal::ZERO {
        PaymentStatus::PartiallyPaid
    } else {
        PaymentStatus::Unpaid
    };

    let count = |n: usize| i32::try_from(n).unwrap_or(i32::MAX);

    OrderSummary {
        order_id,
        net_total: totals.net,
        tax_total: totals.tax,
        gross_total: totals.gross,
        invoiced_gross,
        settled,
        open_balance: invoiced_gross - settled,
        delivery_status,
        invoice_status,
        payment_status,
        fully_delivered,
        delivery_note_count: count(snapshot.delivery_notes.len()),
        delivered_line_count: count(progress.iter().filter(|line| line.is_fully_delivered()).count()),
        open_line_count: count(
            progress
                .iter()
                .filter(|line| line.remaining() > Decimal::ZERO)
                .count(),
        ),
        paid_at: if payment_status == PaymentStatus::Paid {
            paid_at
        } else {
            None
        },
    }
}

pub(crate) async fn load_snapshot<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
) -> Result<OrderSnapshot, ServiceError> {
    let lines = OrderLineEntity::find()
        .filter(order_line::Column::OrderId.eq(order_id))
        .order_by_asc(order_line::Column::Position)
        .order_by_asc(order_line::Column::Id)
        .all(conn)
        .await?;

    let delivery_notes = DeliveryNoteEntity::find()
        .filter(delivery_note::Column::OrderId.eq(order_id))
        .order_by_asc(delivery_note::Column::Sequence)
        .all(conn)
        .await?;
    let note_ids: Vec<i64> = delivery_notes.iter().map(|note| note.id).collect();
    let delivery_lines = if note_ids.is_empty() {
        Vec::new()
    } else {
        DeliveryNoteLineEntity::find()
            .filter(delivery_note_line::Column::DeliveryNoteId.is_in(note_ids))
            .order_by_asc(delivery_note_line::Column::Id)
            .all(conn)
            .await?
    };

    let invoices = InvoiceEntity::find()
        .filter(invoice::Column::OrderId.eq(order_id))
        .order_by_asc(invoice::Column::Id)
        .all(conn)
        .await?;
    let invoice_ids: Vec<i64> = invoices.iter().map(|invoice| invoice.id).collect();
    let (invoice_lines, payments) = if invoice_ids.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        let invoice_lines = InvoiceLineEntity::find()
            .filter(invoice_line::Column::InvoiceId.is_in(invoice_ids.clone()))
            .order_by_asc(invoice_line::Column::Id)
            .all(conn)
            .await?;
        let payments = PaymentEntity::find()
            .filter(payment::Column::InvoiceId.is_in(invoice_ids))
            .order_by_asc(payment::Column::Id)
            .all(conn)
            .await?;
        (invoice_lines, payments)
    };

    Ok(OrderSnapshot {
        lines,
        delivery_notes,
        delivery_lines,
        invoices,
        invoice_lines,
        payments,
    })
}

/// Recomputes the summary of `order_id` and writes the cached columns.
/// Runs inside the caller's transaction.
pub(crate) async fn recalculate_in<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
) -> Result<OrderSummary, ServiceError> {
    let order = OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
    let snapshot = load_snapshot(conn, order_id).await?;
    let summary = compute_summary(order_id, &snapshot);

    if !summary_matches(&order, &summary) {
        let mut active: order::ActiveModel = order.into();
        active.net_total = Set(summary.net_total);
        active.tax_total = Set(summary.tax_total);
        active.gross_total = Set(summary.gross_total);
        active.delivery_status = Set(summary.delivery_status);
        active.invoice_status = Set(summary.invoice_status);
        active.payment_status = Set(summary.payment_status);
        active.fully_delivered = Set(summary.fully_delivered);
        active.delivery_note_count = Set(summary.delivery_note_count);
        active.open_line_count = Set(summary.open_line_count);
        active.paid_at = Set(summary.paid_at);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        debug!(order_id, "Order summary columns updated");
    }

    Ok(summary)
}

fn summary_matches(order: &order::Model, summary: &OrderSummary) -> bool {
    order.net_total == summary.net_total
        && order.tax_total == summary.tax_total
        && order.gross_total == summary.gross_total
        && order.delivery_status == summary.delivery_status
        && order.invoice_status == summary.invoice_status
        && order.payment_status == summary.payment_status
        && order.fully_delivered == summary.fully_delivered
        && order.delivery_note_count == summary.delivery_note_count
        && order.open_line_count == summary.open_line_count
        && order.paid_at == summary.paid_at
}

#[derive(Clone)]
pub struct OrderSummaryService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    event_sender: Option<EventSender>,
}

impl OrderSummaryService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        settings: Arc<LedgerSettings>,
        event_sender: Option<EventSender>,
    ) -> Self {
        let uow = UnitOfWork::new(db.clone(), settings.retry);
        Self {
            db,
            uow,
            event_sender,
        }
    }

    /// Recomputes and stores the summary of an order.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn recalculate(
        &self,
        ctx: &OperationContext,
        order_id: i64,
    ) -> Result<OrderSummary, ServiceError> {
        let summary = self
            .uow
            .run(ctx.deadline, |txn| {
                Box::pin(async move {
                    lock_for_update(OrderEntity::find_by_id(order_id), txn)
                        .one(txn)
                        .await?
                        .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
                    recalculate_in(txn, order_id).await
                })
            })
            .await?;

        info!(
            order_id,
            delivery = %summary.delivery_status,
            invoicing = %summary.invoice_status,
            payment = %summary.payment_status,
            "Order summary recalculated"
        );
        publish(&self.event_sender, Event::OrderSummaryRecalculated(order_id)).await;
        Ok(summary)
    }

    /// Delivered and invoiced quantities per line of an order.
    #[instrument(skip(self, ctx))]
    pub async fn line_progress(
        &self,
        ctx: &OperationContext,
        order_id: i64,
    ) -> Result<Vec<LineProgress>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            OrderEntity::find_by_id(order_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
            let snapshot = load_snapshot(db, order_id).await?;
            Ok(line_progress(&snapshot))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{customer::TaxHandling, invoice::InvoiceStatus};
    use rust_decimal_macros::dec;

    fn line(id: i64, quantity: Decimal, price: Decimal) -> order_line::Model {
        order_line::Model {
            id,
            order_id: 1,
            position: id as i32,
            article_id: 100 + id,
            quantity,
            unit_price: price,
            discount_percent: dec!(0),
            tax_rate: dec!(25),
        }
    }

    fn delivered(id: i64, order_line_id: i64, quantity: Decimal) -> delivery_note_line::Model {
        delivery_note_line::Model {
            id,
            delivery_note_id: 1,
            order_line_id,
            quantity,
            lot_id: None,
        }
    }

    fn invoice(id: i64, gross: Decimal, status: InvoiceStatus) -> invoice::Model {
        invoice::Model {
            id,
            kind: InvoiceKind::Invoice,
            number: format!("RE-{}", id),
            order_id: Some(1),
            customer_id: 1,
            original_invoice_id: None,
            mode: None,
            status,
            currency: "EUR".into(),
            customer_name: "Apotheke".into(),
            payment_terms_days: 14,
            tax_handling: TaxHandling::Standard,
            net_total: gross,
            tax_total: dec!(0),
            gross_total: gross,
            reason: None,
            due_on: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            paid_on: None,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_note: None,
            idempotency_key: None,
            created_by: "test".into(),
            created_at: Utc::now(),
        }
    }

    fn invoiced(id: i64, invoice_id: i64, order_line_id: i64, quantity: Decimal) -> invoice_line::Model {
        invoice_line::Model {
            id,
            invoice_id,
            position: 1,
            article_id: None,
            order_line_id: Some(order_line_id),
            delivery_note_line_id: None,
            description: None,
            quantity,
            unit_price: dec!(0),
            discount_percent: dec!(0),
            tax_rate: dec!(0),
            net_amount: dec!(0),
            tax_amount: dec!(0),
            gross_amount: dec!(0),
        }
    }

    fn payment(id: i64, invoice_id: i64, amount: Decimal) -> payment::Model {
        payment::Model {
            id,
            invoice_id,
            amount,
            paid_on: NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            idempotency_key: None,
            recorded_by: "test".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_order_is_untouched() {
        let summary = compute_summary(1, &OrderSnapshot::default());
        assert_eq!(summary.gross_total, dec!(0));
        assert_eq!(summary.delivery_status, DeliveryStatus::NotShipped);
        assert_eq!(summary.invoice_status, InvoicingStatus::NotInvoiced);
        assert_eq!(summary.payment_status, PaymentStatus::Unpaid);
        assert!(!summary.fully_delivered);
    }

    #[test]
    fn partial_delivery_and_invoice() {
        let snapshot = OrderSnapshot {
            lines: vec![line(1, dec!(10), dec!(8)), line(2, dec!(2), dec!(5))],
            delivery_lines: vec![delivered(1, 1, dec!(4))],
            invoices: vec![invoice(1, dec!(40), InvoiceStatus::Open)],
            invoice_lines: vec![invoiced(1, 1, 1, dec!(4))],
            ..Default::default()
        };

        let summary = compute_summary(1, &snapshot);
        assert_eq!(summary.net_total, dec!(90));
        assert_eq!(summary.tax_total, dec!(22.5));
        assert_eq!(summary.gross_total, dec!(112.5));
        assert_eq!(summary.delivery_status, DeliveryStatus::PartiallyShipped);
        assert_eq!(summary.invoice_status, InvoicingStatus::PartiallyInvoiced);
        assert_eq!(summary.payment_status, PaymentStatus::Unpaid);
        assert_eq!(summary.open_line_count, 2);
        assert_eq!(summary.delivered_line_count, 0);
    }

    #[test]
    fn paid_requires_full_invoicing() {
        let mut paid_invoice = invoice(1, dec!(40), InvoiceStatus::Paid);
        paid_invoice.paid_on = NaiveDate::from_ymd_opt(2024, 3, 20);
        let mut snapshot = OrderSnapshot {
            lines: vec![line(1, dec!(10), dec!(8))],
            delivery_lines: vec![delivered(1, 1, dec!(4))],
            invoices: vec![paid_invoice],
            invoice_lines: vec![invoiced(1, 1, 1, dec!(4))],
            payments: vec![payment(1, 1, dec!(40))],
            ..Default::default()
        };
        let summary = compute_summary(1, &snapshot);
        assert_eq!(summary.payment_status, PaymentStatus::PartiallyPaid);
        assert_eq!(summary.paid_at, None);

        snapshot.delivery_lines.push(delivered(2, 1, dec!(6)));
        snapshot.invoice_lines.push(invoiced(2, 1, 1, dec!(6)));
        let summary = compute_summary(1, &snapshot);
        assert_eq!(summary.payment_status, PaymentStatus::Paid);
        assert_eq!(summary.delivery_status, DeliveryStatus::Shipped);
        assert!(summary.fully_delivered);
        assert_eq!(summary.paid_at, NaiveDate::from_ymd_opt(2024, 3, 20));
    }

    #[test]
    fn cancelled_invoices_do_not_count() {
        let snapshot = OrderSnapshot {
            lines: vec![line(1, dec!(1), dec!(8))],
            invoices: vec![invoice(1, dec!(10), InvoiceStatus::Cancelled)],
            invoice_lines: vec![invoiced(1, 1, 1, dec!(1))],
            ..Default::default()
        };
        let summary = compute_summary(1, &snapshot);
        assert_eq!(summary.invoice_status, InvoicingStatus::NotInvoiced);
        assert_eq!(summary.invoiced_gross, dec!(0));
    }

    #[test]
    fn credit_notes_settle_invoices() {
        let mut note = invoice(2, dec!(-10), InvoiceStatus::Paid);
        note.kind = InvoiceKind::CreditNote;
        note.original_invoice_id = Some(1);
        let snapshot = OrderSnapshot {
            lines: vec![line(1, dec!(1), dec!(8))],
            invoices: vec![invoice(1, dec!(10), InvoiceStatus::Paid), note],
            invoice_lines: vec![invoiced(1, 1, 1, dec!(1))],
            ..Default::default()
        };
        assert_eq!(settlement(&snapshot, 1), (dec!(0), dec!(10)));
        let summary = compute_summary(1, &snapshot);
        assert_eq!(summary.payment_status, PaymentStatus::Paid);
        assert_eq!(summary.open_balance, dec!(0));
    }

    #[test]
    fn recalculation_is_deterministic() {
        let snapshot = OrderSnapshot {
            lines: vec![line(1, dec!(3), dec!(1.25))],
            delivery_lines: vec![delivered(1, 1, dec!(3))],
            ..Default::default()
        };
        assert_eq!(compute_summary(1, &snapshot), compute_summary(1, &snapshot));
    }
}
