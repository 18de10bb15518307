//! Batch quarantine workflow.
//!
//! A lot is either `Available` at its home location or `Quarantined` at the
//! quarantine location. Every transition moves the lot's full balance through
//! the movement ledger and appends a `QuarantineEvent`, so the history of a
//! lot strictly alternates between the two actions.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{with_deadline, UnitOfWork},
    entities::{
        quarantine_event::{self, Entity as QuarantineEventEntity, QuarantineAction},
        stock_lot,
        stock_movement::{self, Entity as StockMovementEntity, MovementReason},
        warehouse_location::{self, Entity as WarehouseLocationEntity},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::inventory::{
        find_location, lock_lot_with_article, lot_balance_in, quarantine_location_ids,
        transfer_in, StockTransfer,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum LotState {
    Available,
    Quarantined,
}

impl LotState {
    /// State implied by the most recent quarantine event of a lot.
    pub fn after(last_action: Option<QuarantineAction>) -> Self {
        match last_action {
            Some(QuarantineAction::Quarantine) => LotState::Quarantined,
            Some(QuarantineAction::Release) | None => LotState::Available,
        }
    }

    /// Applies `action`, failing with `InvalidState` when the lot is not in
    /// the state the action starts from.
    pub fn apply(self, action: QuarantineAction) -> Result<LotState, ServiceError> {
        match (self, action) {
            (LotState::Available, QuarantineAction::Quarantine) => Ok(LotState::Quarantined),
            (LotState::Quarantined, QuarantineAction::Release) => Ok(LotState::Available),
            (state, action) => Err(ServiceError::InvalidState(format!(
                "cannot {} a lot that is {}",
                action.to_string().to_lowercase(),
                state.to_string().to_lowercase()
            ))),
        }
    }
}

/// Outcome of a quarantine or release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantineTransition {
    pub lot_id: i64,
    pub state: LotState,
    pub event: quarantine_event::Model,
    /// Absent when an empty lot was released.
    pub movement: Option<stock_movement::Model>,
    pub quantity: Decimal,
}

pub(crate) async fn history_in<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
) -> Result<Vec<quarantine_event::Model>, ServiceError> {
    Ok(QuarantineEventEntity::find()
        .filter(quarantine_event::Column::LotId.eq(lot_id))
        .order_by_asc(quarantine_event::Column::Id)
        .all(conn)
        .await?)
}

pub(crate) async fn last_event_in<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
) -> Result<Option<quarantine_event::Model>, ServiceError> {
    Ok(QuarantineEventEntity::find()
        .filter(quarantine_event::Column::LotId.eq(lot_id))
        .order_by_desc(quarantine_event::Column::Id)
        .one(conn)
        .await?)
}

pub(crate) async fn lot_state_in<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
) -> Result<LotState, ServiceError> {
    let last = last_event_in(conn, lot_id).await?;
    Ok(LotState::after(last.map(|event| event.action)))
}

/// The configured quarantine location, else the first location flagged as
/// quarantine.
pub(crate) async fn quarantine_location_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
) -> Result<i64, ServiceError> {
    if let Some(location_id) = settings.quarantine_location_id {
        return Ok(find_location(conn, location_id).await?.id);
    }
    WarehouseLocationEntity::find()
        .filter(warehouse_location::Column::IsQuarantine.eq(true))
        .order_by_asc(warehouse_location::Column::Id)
        .one(conn)
        .await?
        .map(|location| location.id)
        .ok_or_else(|| {
            ServiceError::ValidationError("no quarantine location is configured".to_string())
        })
}

/// Replays a transition that already committed under the same key.
async fn replayed_transition<C: ConnectionTrait>(
    conn: &C,
    lot_id: i64,
    idempotency_key: Option<&str>,
) -> Result<Option<QuarantineTransition>, ServiceError> {
    let Some(key) = idempotency_key else {
        return Ok(None);
    };
    let Some(movement) = StockMovementEntity::find()
        .filter(stock_movement::Column::IdempotencyKey.eq(key))
        .one(conn)
        .await?
    else {
        return Ok(None);
    };
    if movement.lot_id != Some(lot_id) {
        return Err(ServiceError::Conflict(format!(
            "idempotency key {} belongs to another operation",
            key
        )));
    }
    let event = QuarantineEventEntity::find()
        .filter(quarantine_event::Column::MovementId.eq(movement.id))
        .one(conn)
        .await?
        .ok_or_else(|| {
            ServiceError::Conflict(format!(
                "idempotency key {} belongs to another operation",
                key
            ))
        })?;
    let state = LotState::after(Some(event.action));
    Ok(Some(QuarantineTransition {
        lot_id,
        state,
        quantity: movement.quantity,
        event,
        movement: Some(movement),
    }))
}

async fn append_event<C: ConnectionTrait>(
    conn: &C,
    lot: &stock_lot::Model,
    action: QuarantineAction,
    reason: Option<String>,
    to_location_id: i64,
    movement_id: Option<i64>,
    actor: &str,
) -> Result<quarantine_event::Model, ServiceError> {
    let event = quarantine_event::ActiveModel {
        lot_id: Set(lot.id),
        action: Set(action),
        reason: Set(reason),
        from_location_id: Set(lot.location_id),
        to_location_id: Set(to_location_id),
        movement_id: Set(movement_id),
        actor: Set(actor.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    Ok(event.insert(conn).await?)
}

pub(crate) async fn quarantine_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    lot_id: i64,
    reason: &str,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<QuarantineTransition, ServiceError> {
    if let Some(replayed) = replayed_transition(conn, lot_id, idempotency_key.as_deref()).await? {
        return Ok(replayed);
    }

    let lot = lock_lot_with_article(conn, lot_id).await?;
    let state = lot_state_in(conn, lot.id)
        .await?
        .apply(QuarantineAction::Quarantine)?;

    let quarantine_location_id = quarantine_location_in(conn, settings).await?;
    if lot.location_id == quarantine_location_id {
        return Err(ServiceError::InvalidState(format!(
            "lot {} already sits at the quarantine location",
            lot.batch_number
        )));
    }

    let quantity = lot_balance_in(conn, lot.id, Some(lot.location_id)).await?;
    if quantity <= Decimal::ZERO {
        return Err(ServiceError::InvalidState(format!(
            "lot {} has no stock to quarantine",
            lot.batch_number
        )));
    }

    let movement = transfer_in(
        conn,
        &StockTransfer {
            article_id: lot.article_id,
            lot_id: Some(lot.id),
            from_location_id: None,
            to_location_id: quarantine_location_id,
            quantity,
        },
        MovementReason::Quarantine,
        actor,
        idempotency_key,
    )
    .await?;

    let event = append_event(
        conn,
        &lot,
        QuarantineAction::Quarantine,
        Some(reason.to_string()),
        quarantine_location_id,
        Some(movement.id),
        actor,
    )
    .await?;

    Ok(QuarantineTransition {
        lot_id: lot.id,
        state,
        event,
        movement: Some(movement),
        quantity,
    })
}

/// Release target: a valid hint, else the location the lot was quarantined
/// from, else the configured default location.
async fn release_target_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    last_event: Option<&quarantine_event::Model>,
    hint: Option<i64>,
) -> Result<i64, ServiceError> {
    let quarantine = quarantine_location_ids(conn, settings).await?;

    if let Some(hint) = hint {
        let location = find_location(conn, hint).await?;
        if location.is_quarantine || quarantine.contains(&location.id) {
            return Err(ServiceError::ValidationError(format!(
                "location {} is a quarantine location",
                location.id
            )));
        }
        return Ok(location.id);
    }

    let recorded_home = last_event
        .filter(|event| event.action == QuarantineAction::Quarantine)
        .map(|event| event.from_location_id);
    if let Some(home) = recorded_home {
        let exists = WarehouseLocationEntity::find_by_id(home)
            .one(conn)
            .await?
            .is_some();
        if exists && !quarantine.contains(&home) {
            return Ok(home);
        }
        warn!(home, "Recorded home location unusable, releasing to default");
    }

    Ok(settings.default_location_id)
}

pub(crate) async fn release_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    lot_id: i64,
    hint: Option<i64>,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<QuarantineTransition, ServiceError> {
    if let Some(replayed) = replayed_transition(conn, lot_id, idempotency_key.as_deref()).await? {
        return Ok(replayed);
    }

    let lot = lock_lot_with_article(conn, lot_id).await?;
    let last_event = last_event_in(conn, lot.id).await?;
    let state = LotState::after(last_event.as_ref().map(|event| event.action))
        .apply(QuarantineAction::Release)?;

    let target = release_target_in(conn, settings, last_event.as_ref(), hint).await?;
    let quantity = lot_balance_in(conn, lot.id, Some(lot.location_id)).await?;

    let movement = if quantity > Decimal::ZERO {
        Some(
            transfer_in(
                conn,
                &StockTransfer {
                    article_id: lot.article_id,
                    lot_id: Some(lot.id),
                    from_location_id: None,
                    to_location_id: target,
                    quantity,
                },
                MovementReason::Release,
                actor,
                idempotency_key,
            )
            .await?,
        )
    } else {
        // Nothing left to move; the lot still returns home.
        let mut active: stock_lot::ActiveModel = lot.clone().into();
        active.location_id = Set(target);
        active.update(conn).await?;
        None
    };

    let event = append_event(
        conn,
        &lot,
        QuarantineAction::Release,
        None,
        target,
        movement.as_ref().map(|movement| movement.id),
        actor,
    )
    .await?;

    Ok(QuarantineTransition {
        lot_id: lot.id,
        state,
        event,
        movement,
        quantity,
    })
}

#[derive(Clone)]
pub struct QuarantineService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl QuarantineService {
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

    /// Moves a lot's full balance from its home to the quarantine location.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn quarantine(
        &self,
        ctx: &OperationContext,
        lot_id: i64,
        reason: &str,
    ) -> Result<QuarantineTransition, ServiceError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "a quarantine needs a reason".to_string(),
            ));
        }
        let reason = reason.to_string();
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let transition = self
            .uow
            .run(ctx.deadline, |txn| {
                let reason = reason.clone();
                let actor = actor.clone();
                let key = key.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    quarantine_in(txn, &settings, lot_id, &reason, &actor, key).await
                })
            })
            .await?;

        info!(
            lot_id,
            quantity = %transition.quantity,
            to = transition.event.to_location_id,
            "Lot quarantined"
        );
        if let Some(movement) = &transition.movement {
            publish(
                &self.event_sender,
                Event::LotQuarantined {
                    lot_id,
                    movement_id: movement.id,
                    quantity: transition.quantity,
                },
            )
            .await;
        }
        Ok(transition)
    }

    /// Returns a quarantined lot to `hint`, or to where it came from.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn release(
        &self,
        ctx: &OperationContext,
        lot_id: i64,
        hint: Option<i64>,
    ) -> Result<QuarantineTransition, ServiceError> {
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let transition = self
            .uow
            .run(ctx.deadline, |txn| {
                let actor = actor.clone();
                let key = key.clone();
                let settings = settings.clone();
                Box::pin(async move { release_in(txn, &settings, lot_id, hint, &actor, key).await })
            })
            .await?;

        info!(
            lot_id,
            quantity = %transition.quantity,
            to = transition.event.to_location_id,
            "Lot released"
        );
        publish(
            &self.event_sender,
            Event::LotReleased {
                lot_id,
                to_location_id: transition.event.to_location_id,
                quantity: transition.quantity,
            },
        )
        .await;
        Ok(transition)
    }

    #[instrument(skip(self, ctx))]
    pub async fn lot_state(&self, ctx: &OperationContext, lot_id: i64) -> Result<LotState, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            stock_lot::Entity::find_by_id(lot_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Lot", lot_id))?;
            lot_state_in(db, lot_id).await
        })
        .await
    }

    /// Quarantine events of a lot, oldest first.
    #[instrument(skip(self, ctx))]
    pub async fn history(
        &self,
        ctx: &OperationContext,
        lot_id: i64,
    ) -> Result<Vec<quarantine_event::Model>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, history_in(db, lot_id)).await
    }
}
