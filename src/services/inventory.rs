use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, ConnectionTrait,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{lock_for_update, with_deadline, UnitOfWork},
    entities::{
        article::{self, Entity as ArticleEntity},
        delivery_note_line::{self, Entity as DeliveryNoteLineEntity},
        order::{self, Entity as OrderEntity},
        order_line::{self, Entity as OrderLineEntity},
        stock_lot::{self, Entity as StockLotEntity},
        stock_movement::{self, Entity as StockMovementEntity, MovementReason},
        warehouse_location::{self, Entity as WarehouseLocationEntity},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::quarantine::{lot_state_in, LotState},
};

/// Why stock leaves a location.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum IssueReason {
    Sale,
    StockCount,
    Shrinkage,
    Return,
    Transfer,
    Correction,
}

impl From<IssueReason> for MovementReason {
    fn from(reason: IssueReason) -> Self {
        match reason {
            IssueReason::Sale => MovementReason::Sale,
            IssueReason::StockCount => MovementReason::StockCount,
            IssueReason::Shrinkage => MovementReason::Shrinkage,
            IssueReason::Return => MovementReason::Return,
            IssueReason::Transfer => MovementReason::Transfer,
            IssueReason::Correction => MovementReason::Correction,
        }
    }
}

/// Goods arriving at a location, optionally into a lot.
#[derive(Debug, Clone, Validate)]
pub struct StockReceipt {
    pub article_id: i64,
    pub location_id: i64,
    pub quantity: Decimal,
    #[validate(length(min = 1, max = 64))]
    pub lot_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub unit_cost: Option<Decimal>,
    pub reference_document_id: Option<i64>,
}

/// Goods leaving stock. Without a location the lot's location, or the
/// configured default location, is used.
#[derive(Debug, Clone)]
pub struct StockIssue {
    pub article_id: i64,
    pub location_id: Option<i64>,
    pub quantity: Decimal,
    pub reason: IssueReason,
    pub source_lot_id: Option<i64>,
    pub reference_document_id: Option<i64>,
}

/// Stock moving between two locations. A lot always moves as a whole.
#[derive(Debug, Clone)]
pub struct StockTransfer {
    pub article_id: i64,
    pub lot_id: Option<i64>,
    pub from_location_id: Option<i64>,
    pub to_location_id: i64,
    pub quantity: Decimal,
}

/// Open order demand for an article against what can cover it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockCoverage {
    pub article_id: i64,
    pub on_hand: Decimal,
    pub available: Decimal,
    pub expected_incoming: Decimal,
    pub open_demand: Decimal,
    pub shortfall: Decimal,
}

impl StockCoverage {
    pub fn is_covered(&self) -> bool {
        self.shortfall.is_zero()
    }
}

pub(crate) fn ensure_positive(quantity: Decimal, what: &str) -> Result<(), ServiceError> {
    if quantity <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "{} must be greater than zero, got {}",
            what, quantity
        )));
    }
    Ok(())
}

/// Replays a movement log into a balance. With a location the balance at
/// that location, otherwise total stock on hand.
pub fn replay_balance(movements: &[stock_movement::Model], location: Option<i64>) -> Decimal {
    movements
        .iter()
        .map(|movement| match location {
            Some(location) => movement.delta_at(location),
            None => movement.net_delta(),
        })
        .sum()
}

/// Per-location balances of a movement log.
pub fn balances_by_location(movements: &[stock_movement::Model]) -> BTreeMap<i64, Decimal> {
    let mut balances = BTreeMap::new();
    for movement in movements {
        if let Some(to) = movement.to_location_id {
            *balances.entry(to).or_insert(Decimal::ZERO) += movement.quantity;
        }
        if let Some(from) = movement.from_location_id {
            *balances.entry(from).or_insert(Decimal::ZERO) -= movement.quantity;
        }
    }
    balances
}

pub(crate) async fn find_article<C: ConnectionTrait>(
    conn: &C,
    article_id: i64,
) -> Result<article::Model, ServiceError> {
    ArticleEntity::find_by_id(article_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Article", article_id))
}

pub(crate) async fn find_location<C: ConnectionTrait>(
    conn: &C,
    location_id: i64,
) -> Result<warehouse_location::Model, ServiceError> {
    WarehouseLocationEntity::find_by_id(location_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Location", location_id))
}

pub(crate) async fn find_lot_for_update<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
) -> Result<stock_lot::Model, ServiceError> {
    lock_for_update(StockLotEntity::find_by_id(lot_id), conn)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Lot", lot_id))
}

/// Serializes stock writers per article.
async fn lock_article<C: ConnectionTrait>(
    conn: &C,
    article_id: i64,
) -> Result<article::Model, ServiceError> {
    lock_for_update(ArticleEntity::find_by_id(article_id), conn)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Article", article_id))
}

/// Locks a lot for a lot-level transition. The article row is locked first,
/// in the same order as the issue path.
pub(crate) async fn lock_lot_with_article<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
) -> Result<stock_lot::Model, ServiceError> {
    let lot = StockLotEntity::find_by_id(lot_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Lot", lot_id))?;
    lock_article(conn, lot.article_id).await?;
    find_lot_for_update(conn, lot_id).await
}

/// Ids of every location whose stock is not available for sale.
pub(crate) async fn quarantine_location_ids<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
) -> Result<HashSet<i64>, ServiceError> {
    let mut ids: HashSet<i64> = WarehouseLocationEntity::find()
        .filter(warehouse_location::Column::IsQuarantine.eq(true))
        .all(conn)
        .await?
        .into_iter()
        .map(|location| location.id)
        .collect();
    ids.extend(settings.quarantine_location_id);
    Ok(ids)
}

async fn movement_by_key<C: ConnectionTrait>(
    conn: &C,
    key: Option<&str>,
) -> Result<Option<stock_movement::Model>, ServiceError> {
    match key {
        Some(key) => Ok(StockMovementEntity::find()
            .filter(stock_movement::Column::IdempotencyKey.eq(key))
            .one(conn)
            .await?),
        None => Ok(None),
    }
}

pub(crate) async fn article_movements<C: ConnectionTrait>(
    conn: &C,
    article_id: i64,
    location_id: Option<i64>,
) -> Result<Vec<stock_movement::Model>, ServiceError> {
    let mut query =
        StockMovementEntity::find().filter(stock_movement::Column::ArticleId.eq(article_id));
    if let Some(location_id) = location_id {
        query = query.filter(
            Condition::any()
                .add(stock_movement::Column::FromLocationId.eq(location_id))
                .add(stock_movement::Column::ToLocationId.eq(location_id)),
        );
    }
    Ok(query
        .order_by_asc(stock_movement::Column::Id)
        .all(conn)
        .await?)
}

pub(crate) async fn lot_movements_in<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
) -> Result<Vec<stock_movement::Model>, ServiceError> {
    Ok(StockMovementEntity::find()
        .filter(stock_movement::Column::LotId.eq(lot_id))
        .order_by_asc(stock_movement::Column::Id)
        .all(conn)
        .await?)
}

pub(crate) async fn balance_in<C: ConnectionTrait>(
    conn: &C,
    article_id: i64,
    location_id: Option<i64>,
) -> Result<Decimal, ServiceError> {
    let movements = article_movements(conn, article_id, location_id).await?;
    Ok(replay_balance(&movements, location_id))
}

pub(crate) async fn lot_balance_in<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
    location_id: Option<i64>,
) -> Result<Decimal, ServiceError> {
    let movements = lot_movements_in(conn, lot_id).await?;
    Ok(replay_balance(&movements, location_id))
}

/// Stock at a location that is not held by any lot.
pub(crate) async fn loose_balance_in<C: ConnectionTrait>(
    conn: &C,
    article_id: i64,
    location_id: i64,
) -> Result<Decimal, ServiceError> {
    let movements: Vec<stock_movement::Model> =
        article_movements(conn, article_id, Some(location_id))
            .await?
            .into_iter()
            .filter(|movement| movement.lot_id.is_none())
            .collect();
    Ok(replay_balance(&movements, Some(location_id)))
}

struct NewMovement<'a> {
    article_id: i64,
    lot_id: Option<i64>,
    from_location_id: Option<i64>,
    to_location_id: Option<i64>,
    quantity: Decimal,
    reason: MovementReason,
    reference_document_id: Option<i64>,
    unit_cost: Option<Decimal>,
    idempotency_key: Option<String>,
    actor: &'a str,
}

async fn append_movement<C: ConnectionTrait>(
    conn: &C,
    movement: NewMovement<'_>,
) -> Result<stock_movement::Model, ServiceError> {
    ensure_positive(movement.quantity, "movement quantity")?;
    let row = stock_movement::ActiveModel {
        article_id: Set(movement.article_id),
        lot_id: Set(movement.lot_id),
        from_location_id: Set(movement.from_location_id),
        to_location_id: Set(movement.to_location_id),
        quantity: Set(movement.quantity),
        reason: Set(movement.reason),
        reference_document_id: Set(movement.reference_document_id),
        unit_cost: Set(movement.unit_cost),
        idempotency_key: Set(movement.idempotency_key),
        actor: Set(movement.actor.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    Ok(row.insert(conn).await?)
}

/// Lots are unique per (article, batch number). An existing lot only takes
/// receipts at the location it currently lives at.
pub(crate) async fn find_or_create_lot<C: ConnectionTrait>(
    conn: &C,
    receipt: &StockReceipt,
    batch_number: &str,
) -> Result<stock_lot::Model, ServiceError> {
    let existing = StockLotEntity::find()
        .filter(stock_lot::Column::ArticleId.eq(receipt.article_id))
        .filter(stock_lot::Column::BatchNumber.eq(batch_number))
        .one(conn)
        .await?;

    if let Some(lot) = existing {
        if lot.location_id != receipt.location_id {
            return Err(ServiceError::ValidationError(format!(
                "lot {} lives at location {}, not {}",
                batch_number, lot.location_id, receipt.location_id
            )));
        }
        return Ok(lot);
    }

    let lot = stock_lot::ActiveModel {
        article_id: Set(receipt.article_id),
        location_id: Set(receipt.location_id),
        batch_number: Set(batch_number.to_string()),
        expiry_date: Set(receipt.expiry_date),
        unit_cost: Set(receipt.unit_cost),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    Ok(lot.insert(conn).await?)
}

pub(crate) async fn receive_in<C: ConnectionTrait>(
    conn: &C,
    receipt: &StockReceipt,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<stock_movement::Model, ServiceError> {
    if let Some(existing) = movement_by_key(conn, idempotency_key.as_deref()).await? {
        return Ok(existing);
    }

    ensure_positive(receipt.quantity, "receipt quantity")?;
    if receipt.unit_cost.map_or(false, |cost| cost < Decimal::ZERO) {
        return Err(ServiceError::ValidationError(
            "unit cost must not be negative".to_string(),
        ));
    }
    find_article(conn, receipt.article_id).await?;
    find_location(conn, receipt.location_id).await?;

    let lot_id = match receipt.lot_number.as_deref() {
        Some(batch_number) => Some(find_or_create_lot(conn, receipt, batch_number).await?.id),
        None => None,
    };

    append_movement(
        conn,
        NewMovement {
            article_id: receipt.article_id,
            lot_id,
            from_location_id: None,
            to_location_id: Some(receipt.location_id),
            quantity: receipt.quantity,
            reason: MovementReason::Receipt,
            reference_document_id: receipt.reference_document_id,
            unit_cost: receipt.unit_cost,
            idempotency_key,
            actor,
        },
    )
    .await
}

/// Appends an issue after checking that neither the location nor the source
/// lot would go negative.
pub(crate) async fn issue_in<C: ConnectionTrait>(
    conn: &C,
    issue: &StockIssue,
    settings: &LedgerSettings,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<stock_movement::Model, ServiceError> {
    if let Some(existing) = movement_by_key(conn, idempotency_key.as_deref()).await? {
        return Ok(existing);
    }

    ensure_positive(issue.quantity, "issue quantity")?;
    lock_article(conn, issue.article_id).await?;

    let lot = match issue.source_lot_id {
        Some(lot_id) => Some(find_lot_for_update(conn, lot_id).await?),
        None => None,
    };

    let location_id = match (&lot, issue.location_id) {
        (Some(lot), Some(location_id)) if lot.location_id != location_id => {
            return Err(ServiceError::ValidationError(format!(
                "lot {} is at location {}, not {}",
                lot.batch_number, lot.location_id, location_id
            )));
        }
        (Some(lot), _) => lot.location_id,
        (None, Some(location_id)) => location_id,
        (None, None) => settings.default_location_id,
    };

    if let Some(lot) = &lot {
        if lot.article_id != issue.article_id {
            return Err(ServiceError::ValidationError(format!(
                "lot {} holds article {}, not {}",
                lot.batch_number, lot.article_id, issue.article_id
            )));
        }
    }

    if issue.reason == IssueReason::Sale
        && quarantine_location_ids(conn, settings)
            .await?
            .contains(&location_id)
    {
        return Err(ServiceError::InvalidState(format!(
            "stock at quarantine location {} cannot be sold",
            location_id
        )));
    }

    if let Some(lot) = &lot {
        let lot_on_hand = lot_balance_in(conn, lot.id, Some(location_id)).await?;
        if lot_on_hand < issue.quantity {
            warn!(
                lot_id = lot.id,
                on_hand = %lot_on_hand,
                requested = %issue.quantity,
                "Rejected issue: lot would go negative"
            );
            return Err(ServiceError::InsufficientStock(format!(
                "lot {} has {} on hand, {} requested",
                lot.batch_number, lot_on_hand, issue.quantity
            )));
        }
    }

    // Issues without a lot may only draw on stock that no lot accounts for.
    let on_hand = match &lot {
        Some(_) => balance_in(conn, issue.article_id, Some(location_id)).await?,
        None => loose_balance_in(conn, issue.article_id, location_id).await?,
    };
    if on_hand < issue.quantity {
        warn!(
            article_id = issue.article_id,
            location_id,
            on_hand = %on_hand,
            requested = %issue.quantity,
            lot_bound = lot.is_none(),
            "Rejected issue: location would go negative"
        );
        return Err(ServiceError::InsufficientStock(format!(
            "article {} has {} {} at location {}, {} requested",
            issue.article_id,
            on_hand,
            if lot.is_some() { "on hand" } else { "outside lots" },
            location_id,
            issue.quantity
        )));
    }

    append_movement(
        conn,
        NewMovement {
            article_id: issue.article_id,
            lot_id: lot.as_ref().map(|lot| lot.id),
            from_location_id: Some(location_id),
            to_location_id: None,
            quantity: issue.quantity,
            reason: issue.reason.into(),
            reference_document_id: issue.reference_document_id,
            unit_cost: lot.as_ref().and_then(|lot| lot.unit_cost),
            idempotency_key,
            actor,
        },
    )
    .await
}

/// Moves stock between locations as one movement. Moving a lot relocates it.
pub(crate) async fn transfer_in<C: ConnectionTrait>(
    conn: &C,
    transfer: &StockTransfer,
    reason: MovementReason,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<stock_movement::Model, ServiceError> {
    if let Some(existing) = movement_by_key(conn, idempotency_key.as_deref()).await? {
        return Ok(existing);
    }

    ensure_positive(transfer.quantity, "transfer quantity")?;
    lock_article(conn, transfer.article_id).await?;
    find_location(conn, transfer.to_location_id).await?;

    let lot = match transfer.lot_id {
        Some(lot_id) => Some(find_lot_for_update(conn, lot_id).await?),
        None => None,
    };

    let from_location_id = match (&lot, transfer.from_location_id) {
        (Some(lot), _) => lot.location_id,
        (None, Some(location_id)) => location_id,
        (None, None) => {
            return Err(ServiceError::ValidationError(
                "transfer needs a lot or a source location".to_string(),
            ))
        }
    };
    if from_location_id == transfer.to_location_id {
        return Err(ServiceError::ValidationError(
            "transfer source and target are the same location".to_string(),
        ));
    }

    if let Some(lot) = &lot {
        if lot.article_id != transfer.article_id {
            return Err(ServiceError::ValidationError(format!(
                "lot {} holds article {}, not {}",
                lot.batch_number, lot.article_id, transfer.article_id
            )));
        }
        let lot_on_hand = lot_balance_in(conn, lot.id, Some(from_location_id)).await?;
        if lot_on_hand < transfer.quantity {
            return Err(ServiceError::InsufficientStock(format!(
                "lot {} has {} on hand, {} requested",
                lot.batch_number, lot_on_hand, transfer.quantity
            )));
        }
        if lot_on_hand != transfer.quantity {
            return Err(ServiceError::ValidationError(format!(
                "lot {} moves as a whole ({} on hand)",
                lot.batch_number, lot_on_hand
            )));
        }
    }

    let on_hand = match &lot {
        Some(_) => balance_in(conn, transfer.article_id, Some(from_location_id)).await?,
        None => loose_balance_in(conn, transfer.article_id, from_location_id).await?,
    };
    if on_hand < transfer.quantity {
        return Err(ServiceError::InsufficientStock(format!(
            "article {} has {} on hand at location {}, {} requested",
            transfer.article_id, on_hand, from_location_id, transfer.quantity
        )));
    }

    let movement = append_movement(
        conn,
        NewMovement {
            article_id: transfer.article_id,
            lot_id: lot.as_ref().map(|lot| lot.id),
            from_location_id: Some(from_location_id),
            to_location_id: Some(transfer.to_location_id),
            quantity: transfer.quantity,
            reason,
            reference_document_id: None,
            unit_cost: lot.as_ref().and_then(|lot| lot.unit_cost),
            idempotency_key,
            actor,
        },
    )
    .await?;

    if let Some(lot) = lot {
        let mut active: stock_lot::ActiveModel = lot.into();
        active.location_id = Set(transfer.to_location_id);
        active.update(conn).await?;
    }

    Ok(movement)
}

/// A plain transfer never crosses the quarantine boundary; lots enter and
/// leave quarantine through the quarantine workflow only.
async fn ensure_outside_quarantine_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    transfer: &StockTransfer,
) -> Result<(), ServiceError> {
    let source = match transfer.lot_id {
        Some(lot_id) => {
            let lot = lock_lot_with_article(conn, lot_id).await?;
            if lot_state_in(conn, lot.id).await? == LotState::Quarantined {
                return Err(ServiceError::InvalidState(format!(
                    "lot {} is quarantined and must be released first",
                    lot.batch_number
                )));
            }
            Some(lot.location_id)
        }
        None => {
            lock_article(conn, transfer.article_id).await?;
            transfer.from_location_id
        }
    };

    let quarantine = quarantine_location_ids(conn, settings).await?;
    for location_id in source.into_iter().chain([transfer.to_location_id]) {
        if quarantine.contains(&location_id) {
            return Err(ServiceError::InvalidState(format!(
                "location {} is a quarantine location; use quarantine or release",
                location_id
            )));
        }
    }
    Ok(())
}

/// Σ (ordered − delivered) over open lines of non-cancelled orders.
pub(crate) async fn open_demand_in<C: ConnectionTrait>(
    conn: &C,
    article_id: i64,
) -> Result<Decimal, ServiceError> {
    let lines: Vec<order_line::Model> = OrderLineEntity::find()
        .filter(order_line::Column::ArticleId.eq(article_id))
        .find_also_related(OrderEntity)
        .all(conn)
        .await?
        .into_iter()
        .filter(|(_, order)| order.as_ref().map_or(false, |o: &order::Model| !o.cancelled))
        .map(|(line, _)| line)
        .collect();

    if lines.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let line_ids: Vec<i64> = lines.iter().map(|line| line.id).collect();
    let mut delivered: HashMap<i64, Decimal> = HashMap::new();
    for delivery_line in DeliveryNoteLineEntity::find()
        .filter(delivery_note_line::Column::OrderLineId.is_in(line_ids))
        .all(conn)
        .await?
    {
        *delivered
            .entry(delivery_line.order_line_id)
            .or_insert(Decimal::ZERO) += delivery_line.quantity;
    }

    Ok(lines
        .iter()
        .map(|line| {
            let done = delivered.get(&line.id).copied().unwrap_or(Decimal::ZERO);
            (line.quantity - done).max(Decimal::ZERO)
        })
        .sum())
}

/// Service for the append-only stock movement ledger
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl InventoryService {
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

    /// Records goods arriving at a location.
    #[instrument(skip(self, ctx, receipt), fields(actor = %ctx.actor, article_id = receipt.article_id))]
    pub async fn record_receipt(
        &self,
        ctx: &OperationContext,
        receipt: StockReceipt,
    ) -> Result<stock_movement::Model, ServiceError> {
        receipt.validate()?;
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();

        let movement = self
            .uow
            .run(ctx.deadline, |txn| {
                let receipt = receipt.clone();
                let key = key.clone();
                let actor = actor.clone();
                Box::pin(async move { receive_in(txn, &receipt, &actor, key).await })
            })
            .await?;

        info!(
            movement_id = movement.id,
            quantity = %movement.quantity,
            "Stock received"
        );
        publish(
            &self.event_sender,
            Event::StockReceived {
                movement_id: movement.id,
                article_id: movement.article_id,
                lot_id: movement.lot_id,
                quantity: movement.quantity,
            },
        )
        .await;
        Ok(movement)
    }

    /// Records a multi-line warehouse receipt as one transaction.
    #[instrument(skip(self, ctx, receipts), fields(actor = %ctx.actor, lines = receipts.len()))]
    pub async fn record_goods_receipt(
        &self,
        ctx: &OperationContext,
        receipts: Vec<StockReceipt>,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        if receipts.is_empty() {
            return Err(ServiceError::ValidationError(
                "goods receipt has no lines".to_string(),
            ));
        }
        for receipt in &receipts {
            receipt.validate()?;
        }
        let actor = ctx.actor.clone();

        let movements = self
            .uow
            .run(ctx.deadline, |txn| {
                let receipts = receipts.clone();
                let actor = actor.clone();
                let keys: Vec<Option<String>> =
                    (0..receipts.len()).map(|index| ctx.item_key(index)).collect();
                Box::pin(async move {
                    let mut movements = Vec::with_capacity(receipts.len());
                    for (receipt, key) in receipts.iter().zip(keys) {
                        movements.push(receive_in(txn, receipt, &actor, key).await?);
                    }
                    Ok(movements)
                })
            })
            .await?;

        info!(lines = movements.len(), "Goods receipt recorded");
        for movement in &movements {
            publish(
                &self.event_sender,
                Event::StockReceived {
                    movement_id: movement.id,
                    article_id: movement.article_id,
                    lot_id: movement.lot_id,
                    quantity: movement.quantity,
                },
            )
            .await;
        }
        Ok(movements)
    }

    /// Records goods leaving stock. Nothing is persisted on a shortage.
    #[instrument(skip(self, ctx, issue), fields(actor = %ctx.actor, article_id = issue.article_id, reason = %issue.reason))]
    pub async fn record_issue(
        &self,
        ctx: &OperationContext,
        issue: StockIssue,
    ) -> Result<stock_movement::Model, ServiceError> {
        ensure_positive(issue.quantity, "issue quantity")?;
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let movement = self
            .uow
            .run(ctx.deadline, |txn| {
                let issue = issue.clone();
                let key = key.clone();
                let settings = settings.clone();
                let actor = actor.clone();
                Box::pin(async move { issue_in(txn, &issue, &settings, &actor, key).await })
            })
            .await?;

        info!(
            movement_id = movement.id,
            quantity = %movement.quantity,
            "Stock issued"
        );
        publish(
            &self.event_sender,
            Event::StockIssued {
                movement_id: movement.id,
                article_id: movement.article_id,
                lot_id: movement.lot_id,
                quantity: movement.quantity,
                reason: issue.reason.to_string(),
            },
        )
        .await;
        Ok(movement)
    }

    /// Moves stock between two locations.
    #[instrument(skip(self, ctx, transfer), fields(actor = %ctx.actor, article_id = transfer.article_id))]
    pub async fn transfer(
        &self,
        ctx: &OperationContext,
        transfer: StockTransfer,
    ) -> Result<stock_movement::Model, ServiceError> {
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let movement = self
            .uow
            .run(ctx.deadline, |txn| {
                let transfer = transfer.clone();
                let key = key.clone();
                let actor = actor.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    ensure_outside_quarantine_in(txn, &settings, &transfer).await?;
                    transfer_in(txn, &transfer, MovementReason::Transfer, &actor, key).await
                })
            })
            .await?;

        info!(movement_id = movement.id, "Stock transferred");
        if let (Some(from_location_id), Some(to_location_id)) =
            (movement.from_location_id, movement.to_location_id)
        {
            publish(
                &self.event_sender,
                Event::StockTransferred {
                    movement_id: movement.id,
                    article_id: movement.article_id,
                    from_location_id,
                    to_location_id,
                    quantity: movement.quantity,
                },
            )
            .await;
        }
        Ok(movement)
    }

    /// On-hand quantity of an article, at one location or in total.
    #[instrument(skip(self, ctx))]
    pub async fn stock_balance(
        &self,
        ctx: &OperationContext,
        article_id: i64,
        location_id: Option<i64>,
    ) -> Result<Decimal, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, balance_in(db, article_id, location_id)).await
    }

    /// On-hand quantity of a lot.
    #[instrument(skip(self, ctx))]
    pub async fn lot_balance(&self, ctx: &OperationContext, lot_id: i64) -> Result<Decimal, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            StockLotEntity::find_by_id(lot_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Lot", lot_id))?;
            lot_balance_in(db, lot_id, None).await
        })
        .await
    }

    /// Every movement of a lot, oldest first.
    #[instrument(skip(self, ctx))]
    pub async fn lot_movements(
        &self,
        ctx: &OperationContext,
        lot_id: i64,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, lot_movements_in(db, lot_id)).await
    }

    pub async fn find_lot(
        &self,
        ctx: &OperationContext,
        article_id: i64,
        batch_number: &str,
    ) -> Result<Option<stock_lot::Model>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            Ok(StockLotEntity::find()
                .filter(stock_lot::Column::ArticleId.eq(article_id))
                .filter(stock_lot::Column::BatchNumber.eq(batch_number))
                .one(db)
                .await?)
        })
        .await
    }

    /// On-hand quantity outside quarantine locations.
    #[instrument(skip(self, ctx))]
    pub async fn available_balance(
        &self,
        ctx: &OperationContext,
        article_id: i64,
    ) -> Result<Decimal, ServiceError> {
        let db = &*self.db;
        let settings = &*self.settings;
        with_deadline(ctx.deadline, async {
            let quarantine = quarantine_location_ids(db, settings).await?;
            let movements = article_movements(db, article_id, None).await?;
            Ok(balances_by_location(&movements)
                .into_iter()
                .filter(|(location, _)| !quarantine.contains(location))
                .map(|(_, quantity)| quantity)
                .sum())
        })
        .await
    }

    /// Checks open order demand against available stock plus expected
    /// incoming goods.
    #[instrument(skip(self, ctx))]
    pub async fn stock_coverage(
        &self,
        ctx: &OperationContext,
        article_id: i64,
        expected_incoming: Decimal,
    ) -> Result<StockCoverage, ServiceError> {
        if expected_incoming < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "expected incoming quantity must not be negative".to_string(),
            ));
        }
        let db = &*self.db;
        let on_hand = self.stock_balance(ctx, article_id, None).await?;
        let available = self.available_balance(ctx, article_id).await?;
        let open_demand = with_deadline(ctx.deadline, open_demand_in(db, article_id)).await?;
        let shortfall = (open_demand - available - expected_incoming).max(Decimal::ZERO);

        if !shortfall.is_zero() {
            warn!(article_id, %open_demand, %available, %shortfall, "Open demand not covered by stock");
        }

        Ok(StockCoverage {
            article_id,
            on_hand,
            available,
            expected_incoming,
            open_demand,
            shortfall,
        })
    }
}
