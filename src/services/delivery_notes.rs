use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{with_deadline, UnitOfWork},
    entities::{
        delivery_note::{self, Entity as DeliveryNoteEntity},
        delivery_note_line::{self, Entity as DeliveryNoteLineEntity},
        order,
        stock_movement::{self, Entity as StockMovementEntity, MovementReason},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        inventory::{issue_in, IssueReason, StockIssue},
        numbering::delivery_note_number,
        order_summary::{line_progress, load_snapshot, recalculate_in, LineProgress, OrderSummary},
        orders::lock_order,
    },
};

/// One requested delivery line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLineRequest {
    pub order_line_id: i64,
    pub quantity: Decimal,
    /// Lot the goods are shipped from.
    pub lot_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryNoteRequest {
    pub order_id: i64,
    /// Every line with remaining quantity is delivered in full when absent.
    pub lines: Option<Vec<DeliveryLineRequest>>,
    /// Issues stock for each line from this location when set.
    pub ship_from_location_id: Option<i64>,
}

impl DeliveryNoteRequest {
    pub fn all_remaining(order_id: i64) -> Self {
        Self {
            order_id,
            ..Default::default()
        }
    }
}

/// A persisted delivery note with what the call skipped and shipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryNote {
    pub header: delivery_note::Model,
    pub lines: Vec<delivery_note_line::Model>,
    /// Requested order lines without remaining quantity.
    pub skipped_line_ids: Vec<i64>,
    pub movements: Vec<stock_movement::Model>,
    #[serde(skip)]
    pub replayed: bool,
}

impl DeliveryNote {
    pub fn total_quantity(&self) -> Decimal {
        self.lines.iter().map(|line| line.quantity).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedLine {
    pub order_line_id: i64,
    pub article_id: i64,
    pub quantity: Decimal,
    pub lot_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DeliveryPlan {
    pub lines: Vec<PlannedLine>,
    pub skipped_line_ids: Vec<i64>,
}

/// Decides what a delivery note ships. Lines without remaining quantity are
/// skipped; asking for more than remains is an error and never clamped.
pub(crate) fn plan_delivery(
    order_id: i64,
    progress: &[LineProgress],
    requested: Option<&[DeliveryLineRequest]>,
) -> Result<DeliveryPlan, ServiceError> {
    let mut plan = DeliveryPlan::default();

    let Some(requested) = requested else {
        for line in progress {
            if line.remaining() > Decimal::ZERO {
                plan.lines.push(PlannedLine {
                    order_line_id: line.order_line_id,
                    article_id: line.article_id,
                    quantity: line.remaining(),
                    lot_id: None,
                });
            } else {
                plan.skipped_line_ids.push(line.order_line_id);
            }
        }
        return Ok(plan);
    };

    let by_id: HashMap<i64, &LineProgress> = progress
        .iter()
        .map(|line| (line.order_line_id, line))
        .collect();
    let mut planned: HashMap<i64, Decimal> = HashMap::new();

    for request in requested {
        if request.quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "delivery quantity for order line {} must be greater than zero",
                request.order_line_id
            )));
        }
        let line = by_id.get(&request.order_line_id).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "order line {} does not belong to order {}",
                request.order_line_id, order_id
            ))
        })?;

        let already = planned.get(&line.order_line_id).copied().unwrap_or_default();
        let remaining = line.remaining() - already;
        if remaining <= Decimal::ZERO {
            plan.skipped_line_ids.push(line.order_line_id);
            continue;
        }
        if request.quantity > remaining {
            return Err(ServiceError::OverDelivery(format!(
                "order line {} has {} remaining, {} requested",
                line.order_line_id, remaining, request.quantity
            )));
        }

        *planned.entry(line.order_line_id).or_default() += request.quantity;
        plan.lines.push(PlannedLine {
            order_line_id: line.order_line_id,
            article_id: line.article_id,
            quantity: request.quantity,
            lot_id: request.lot_id,
        });
    }

    Ok(plan)
}

async fn load_note<C: ConnectionTrait>(
    conn: &C,
    header: delivery_note::Model,
) -> Result<DeliveryNote, ServiceError> {
    let lines = DeliveryNoteLineEntity::find()
        .filter(delivery_note_line::Column::DeliveryNoteId.eq(header.id))
        .order_by_asc(delivery_note_line::Column::Id)
        .all(conn)
        .await?;
    let movements = StockMovementEntity::find()
        .filter(stock_movement::Column::ReferenceDocumentId.eq(header.id))
        .filter(stock_movement::Column::Reason.eq(MovementReason::Sale))
        .order_by_asc(stock_movement::Column::Id)
        .all(conn)
        .await?;
    Ok(DeliveryNote {
        header,
        lines,
        skipped_line_ids: Vec::new(),
        movements,
        replayed: false,
    })
}

pub(crate) async fn create_delivery_note_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    request: &DeliveryNoteRequest,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<(DeliveryNote, OrderSummary), ServiceError> {
    if let Some(key) = idempotency_key.as_deref() {
        let existing = DeliveryNoteEntity::find()
            .filter(delivery_note::Column::IdempotencyKey.eq(key))
            .one(conn)
            .await?;
        if let Some(header) = existing {
            if header.order_id != request.order_id {
                return Err(ServiceError::Conflict(format!(
                    "idempotency key {} was used for order {}",
                    key, header.order_id
                )));
            }
            let summary = recalculate_in(conn, header.order_id).await?;
            let mut note = load_note(conn, header).await?;
            note.replayed = true;
            return Ok((note, summary));
        }
    }

    let order = lock_order(conn, request.order_id).await?;
    if order.cancelled {
        return Err(ServiceError::InvalidState(format!(
            "order {} is cancelled",
            order.number
        )));
    }

    let snapshot = load_snapshot(conn, order.id).await?;
    let progress = line_progress(&snapshot);
    let plan = plan_delivery(order.id, &progress, request.lines.as_deref())?;
    if plan.lines.is_empty() {
        return Err(ServiceError::NoDeliverableLines(order.id));
    }

    let sequence = i32::try_from(snapshot.delivery_notes.len() + 1).map_err(|_| {
        ServiceError::InternalError(format!("order {} has too many delivery notes", order.id))
    })?;
    let now = Utc::now();
    let header = delivery_note::ActiveModel {
        order_id: Set(order.id),
        number: Set(delivery_note_number(&order.number, sequence)),
        sequence: Set(sequence),
        ship_from_location_id: Set(request.ship_from_location_id),
        idempotency_key: Set(idempotency_key),
        created_by: Set(actor.to_string()),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    let mut lines = Vec::with_capacity(plan.lines.len());
    let mut movements = Vec::new();
    for planned in &plan.lines {
        let line = delivery_note_line::ActiveModel {
            delivery_note_id: Set(header.id),
            order_line_id: Set(planned.order_line_id),
            quantity: Set(planned.quantity),
            lot_id: Set(planned.lot_id),
            ..Default::default()
        }
        .insert(conn)
        .await?;

        if let Some(location_id) = request.ship_from_location_id {
            let issue = StockIssue {
                article_id: planned.article_id,
                location_id: Some(location_id),
                quantity: planned.quantity,
                reason: IssueReason::Sale,
                source_lot_id: planned.lot_id,
                reference_document_id: Some(header.id),
            };
            movements.push(issue_in(conn, &issue, settings, actor, None).await?);
        }
        lines.push(line);
    }

    let summary = recalculate_in(conn, order.id).await?;
    if summary.fully_delivered && order.shipped_at.is_none() {
        order::ActiveModel {
            id: Set(order.id),
            shipped_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        }
        .update(conn)
        .await?;
    }

    Ok((
        DeliveryNote {
            header,
            lines,
            skipped_line_ids: plan.skipped_line_ids,
            movements,
            replayed: false,
        },
        summary,
    ))
}

/// Converts remaining order quantity into delivery notes.
#[derive(Clone)]
pub struct DeliveryNoteService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl DeliveryNoteService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        settings: Arc<LedgerSettings>,
        event_sender: Option<EventSender>,
    ) -> Self {
        let uow = UnitOfWork::new(db.clone(), settings.retry);
        Self {
            db,
            uow,
            settings,
            event_sender,
        }
    }

    /// Creates a delivery note, ships its stock and refreshes the order
    /// summary in one transaction. A stock shortage rolls back the note.
    #[instrument(skip(self, ctx, request), fields(actor = %ctx.actor, order_id = request.order_id))]
    pub async fn create_delivery_note(
        &self,
        ctx: &OperationContext,
        request: DeliveryNoteRequest,
    ) -> Result<DeliveryNote, ServiceError> {
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let (note, summary) = self
            .uow
            .run(ctx.deadline, |txn| {
                let request = request.clone();
                let actor = actor.clone();
                let key = key.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    create_delivery_note_in(txn, &settings, &request, &actor, key).await
                })
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "Delivery note rejected");
                e
            })?;

        if note.replayed {
            info!(delivery_note_id = note.header.id, "Delivery note {} replayed", note.header.number);
            return Ok(note);
        }

        info!(
            delivery_note_id = note.header.id,
            lines = note.lines.len(),
            skipped = note.skipped_line_ids.len(),
            delivery = %summary.delivery_status,
            "Delivery note {} created",
            note.header.number
        );
        publish(
            &self.event_sender,
            Event::DeliveryNoteCreated {
                delivery_note_id: note.header.id,
                order_id: note.header.order_id,
                number: note.header.number.clone(),
            },
        )
        .await;
        for movement in &note.movements {
            publish(
                &self.event_sender,
                Event::StockIssued {
                    movement_id: movement.id,
                    article_id: movement.article_id,
                    lot_id: movement.lot_id,
                    quantity: movement.quantity,
                    reason: movement.reason.to_string(),
                },
            )
            .await;
        }
        publish(
            &self.event_sender,
            Event::OrderSummaryRecalculated(note.header.order_id),
        )
        .await;
        Ok(note)
    }

    #[instrument(skip(self, ctx))]
    pub async fn get_delivery_note(
        &self,
        ctx: &OperationContext,
        delivery_note_id: i64,
    ) -> Result<DeliveryNote, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            let header = DeliveryNoteEntity::find_by_id(delivery_note_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Delivery note", delivery_note_id))?;
            load_note(db, header).await
        })
        .await
    }

    /// Delivery notes of an order in sequence order.
    #[instrument(skip(self, ctx))]
    pub async fn list_for_order(
        &self,
        ctx: &OperationContext,
        order_id: i64,
    ) -> Result<Vec<delivery_note::Model>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            Ok(DeliveryNoteEntity::find()
                .filter(delivery_note::Column::OrderId.eq(order_id))
                .order_by_asc(delivery_note::Column::Sequence)
                .all(db)
                .await?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn progress(id: i64, ordered: Decimal, delivered: Decimal) -> LineProgress {
        LineProgress {
            order_line_id: id,
            article_id: 10 * id,
            ordered,
            delivered,
            invoiced: Decimal::ZERO,
        }
    }

    fn request(id: i64, quantity: Decimal) -> DeliveryLineRequest {
        DeliveryLineRequest {
            order_line_id: id,
            quantity,
            lot_id: None,
        }
    }

    #[test]
    fn auto_plan_takes_full_remaining() {
        let lines = [progress(1, dec!(10), dec!(4)), progress(2, dec!(3), dec!(3))];
        let plan = plan_delivery(1, &lines, None).unwrap();

        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.lines[0].quantity, dec!(6));
        assert_eq!(plan.skipped_line_ids, vec![2]);
    }

    #[test]
    fn explicit_plan_rejects_over_delivery() {
        let lines = [progress(1, dec!(10), dec!(4))];
        assert_matches!(
            plan_delivery(1, &lines, Some(&[request(1, dec!(7))])),
            Err(ServiceError::OverDelivery(_))
        );
        assert_matches!(
            plan_delivery(1, &lines, Some(&[request(1, dec!(4)), request(1, dec!(3))])),
            Err(ServiceError::OverDelivery(_))
        );
    }

    #[test]
    fn explicit_plan_validates_lines() {
        let lines = [progress(1, dec!(10), dec!(0))];
        assert_matches!(
            plan_delivery(1, &lines, Some(&[request(1, dec!(0))])),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            plan_delivery(1, &lines, Some(&[request(9, dec!(1))])),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn explicit_plan_skips_finished_lines() {
        let lines = [progress(1, dec!(10), dec!(10)), progress(2, dec!(5), dec!(0))];
        let plan = plan_delivery(1, &lines, Some(&[request(1, dec!(2)), request(2, dec!(5))])).unwrap();

        assert_eq!(plan.skipped_line_ids, vec![1]);
        assert_eq!(plan.lines.len(), 1);
        assert_eq!(plan.lines[0].order_line_id, 2);
    }
}
