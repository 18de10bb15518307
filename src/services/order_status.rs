use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{lock_for_update, with_deadline, UnitOfWork},
    entities::order::{self, Entity as OrderEntity, Model as OrderModel},
    errors::ServiceError,
    events::{publish, Event, EventSender},
};

/// Workflow code persisted for cancelled orders.
pub const CANCELLED_WORKFLOW_CODE: i32 = 255;

/// The one authoritative order status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum OrderStatus {
    Open,
    InProgress,
    ReadyToShip,
    Shipped,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn from_workflow_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(OrderStatus::Open),
            1 => Some(OrderStatus::InProgress),
            2 => Some(OrderStatus::ReadyToShip),
            3 => Some(OrderStatus::Shipped),
            4 => Some(OrderStatus::Completed),
            CANCELLED_WORKFLOW_CODE => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn workflow_code(self) -> i32 {
        match self {
            OrderStatus::Open => 0,
            OrderStatus::InProgress => 1,
            OrderStatus::ReadyToShip => 2,
            OrderStatus::Shipped => 3,
            OrderStatus::Completed => 4,
            OrderStatus::Cancelled => CANCELLED_WORKFLOW_CODE,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Whether the workflow may move from `self` to `next`.
    ///
    /// The workflow only moves forward; it may skip steps. Cancellation is
    /// possible until the order ships.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (from, to) if from == to => true,
            (OrderStatus::Completed, _) | (OrderStatus::Cancelled, _) => false,
            (from, OrderStatus::Cancelled) => matches!(
                from,
                OrderStatus::Open | OrderStatus::InProgress | OrderStatus::ReadyToShip
            ),
            (from, to) => to.workflow_code() > from.workflow_code(),
        }
    }
}

/// Resolves the order status from its independently stored fields.
///
/// Precedence: cancelled flag or cancelled code, then a recorded shipment,
/// then the workflow code, then `Open`.
// A recorded shipment overriding the workflow code is kept for
// compatibility with existing data; confirm with product before relying on it.
pub fn resolve_status(
    cancelled: bool,
    workflow_code: Option<i32>,
    shipped_at: Option<DateTime<Utc>>,
) -> OrderStatus {
    if cancelled || workflow_code == Some(CANCELLED_WORKFLOW_CODE) {
        return OrderStatus::Cancelled;
    }
    if shipped_at.is_some() {
        return OrderStatus::Shipped;
    }
    workflow_code
        .and_then(OrderStatus::from_workflow_code)
        .unwrap_or(OrderStatus::Open)
}

pub fn resolve_order_status(order: &OrderModel) -> OrderStatus {
    resolve_status(order.cancelled, order.workflow_status, order.shipped_at)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowTransition {
    pub order: OrderModel,
    pub from: OrderStatus,
    pub to: OrderStatus,
}

#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    event_sender: Option<EventSender>,
}

impl OrderStatusService {
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

    /// Gets the resolved status of an order
    #[instrument(skip(self, ctx))]
    pub async fn get_status(
        &self,
        ctx: &OperationContext,
        order_id: i64,
    ) -> Result<OrderStatus, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            let order = OrderEntity::find_by_id(order_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
            Ok(resolve_order_status(&order))
        })
        .await
    }

    /// Moves the workflow code forward. Cancellation goes through
    /// `OrderService::cancel_order`, which checks for existing documents.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn advance_workflow(
        &self,
        ctx: &OperationContext,
        order_id: i64,
        target: OrderStatus,
    ) -> Result<WorkflowTransition, ServiceError> {
        if target == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidState(
                "orders are cancelled through cancel_order".to_string(),
            ));
        }

        let transition = self
            .uow
            .run(ctx.deadline, |txn| {
                Box::pin(async move {
                    let order = lock_for_update(OrderEntity::find_by_id(order_id), txn)
                        .one(txn)
                        .await?
                        .ok_or_else(|| ServiceError::not_found("Order", order_id))?;

                    let from = resolve_order_status(&order);
                    if !from.can_transition_to(target) {
                        warn!(%from, to = %target, "Rejected workflow transition");
                        return Err(ServiceError::InvalidState(format!(
                            "cannot move order {} from {} to {}",
                            order.number, from, target
                        )));
                    }

                    let mut active: order::ActiveModel = order.into();
                    active.workflow_status = Set(Some(target.workflow_code()));
                    active.updated_at = Set(Utc::now());
                    let order = active.update(txn).await?;

                    Ok(WorkflowTransition {
                        order,
                        from,
                        to: target,
                    })
                })
            })
            .await?;

        info!(
            "Order {} workflow moved from {} to {}",
            transition.order.number, transition.from, transition.to
        );
        publish(
            &self.event_sender,
            Event::OrderWorkflowAdvanced {
                order_id,
                from: transition.from.to_string(),
                to: transition.to.to_string(),
            },
        )
        .await;

        Ok(transition)
    }
}
