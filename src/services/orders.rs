use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};
use serde::Serialize;
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{lock_for_update, with_deadline, UnitOfWork},
    entities::{
        customer::Entity as CustomerEntity,
        delivery_note::{self, Entity as DeliveryNoteEntity},
        invoice::{self, Entity as InvoiceEntity, InvoiceStatus},
        order::{self, DeliveryStatus, Entity as OrderEntity, InvoicingStatus, PaymentStatus},
        order_line::{self, Entity as OrderLineEntity},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        inventory::{ensure_positive, find_article},
        numbering::{format_document_number, next_value, DocumentType},
        order_status::{resolve_order_status, OrderStatus},
        order_summary::recalculate_in,
    },
};

/// Input for creating a sales order header.
#[derive(Debug, Clone, Validate)]
pub struct NewOrder {
    pub customer_id: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
    /// Taken from the order sequence when absent.
    #[validate(length(min = 1, max = 32))]
    pub number: Option<String>,
}

/// Input for adding a line. Price and tax rate default from the article.
#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub order_id: i64,
    pub article_id: i64,
    pub quantity: Decimal,
    pub unit_price: Option<Decimal>,
    pub discount_percent: Option<Decimal>,
    pub tax_rate: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub lines: Vec<order_line::Model>,
    pub status: OrderStatus,
}

pub(crate) async fn lock_order<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
) -> Result<order::Model, ServiceError> {
    lock_for_update(OrderEntity::find_by_id(order_id), conn)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Order", order_id))
}

async fn create_order_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    input: &NewOrder,
    actor: &str,
) -> Result<(order::Model, bool), ServiceError> {
    CustomerEntity::find_by_id(input.customer_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Customer", input.customer_id))?;

    let number = match &input.number {
        Some(number) => {
            let existing = OrderEntity::find()
                .filter(order::Column::Number.eq(number.as_str()))
                .one(conn)
                .await?;
            if let Some(existing) = existing {
                if existing.customer_id == input.customer_id {
                    return Ok((existing, true));
                }
                return Err(ServiceError::Conflict(format!(
                    "order number {} is taken by another customer",
                    number
                )));
            }
            number.clone()
        }
        None => format_document_number(
            &settings.order_prefix,
            next_value(conn, DocumentType::Order).await?,
        ),
    };

    let now = Utc::now();
    let order = order::ActiveModel {
        number: Set(number),
        customer_id: Set(input.customer_id),
        currency: Set(input.currency.to_uppercase()),
        workflow_status: Set(Some(OrderStatus::Open.workflow_code())),
        cancelled: Set(false),
        cancel_reason: Set(None),
        shipped_at: Set(None),
        paid_at: Set(None),
        net_total: Set(Decimal::ZERO),
        tax_total: Set(Decimal::ZERO),
        gross_total: Set(Decimal::ZERO),
        delivery_status: Set(DeliveryStatus::NotShipped),
        invoice_status: Set(InvoicingStatus::NotInvoiced),
        payment_status: Set(PaymentStatus::Unpaid),
        fully_delivered: Set(false),
        delivery_note_count: Set(0),
        open_line_count: Set(0),
        created_by: Set(actor.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    Ok((order, false))
}

async fn add_line_in<C: ConnectionTrait>(
    conn: &C,
    input: &NewOrderLine,
) -> Result<order_line::Model, ServiceError> {
    let order = lock_order(conn, input.order_id).await?;
    let status = resolve_order_status(&order);
    if matches!(
        status,
        OrderStatus::Cancelled | OrderStatus::Shipped | OrderStatus::Completed
    ) {
        return Err(ServiceError::InvalidState(format!(
            "cannot add lines to order {} in status {}",
            order.number, status
        )));
    }

    let article = find_article(conn, input.article_id).await?;
    let unit_price = input.unit_price.unwrap_or(article.unit_price);
    let discount_percent = input.discount_percent.unwrap_or(Decimal::ZERO);
    let tax_rate = input.tax_rate.unwrap_or(article.tax_rate);

    if unit_price < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "unit price must not be negative".to_string(),
        ));
    }
    if !(Decimal::ZERO..=dec!(100)).contains(&discount_percent) {
        return Err(ServiceError::ValidationError(format!(
            "discount must lie between 0 and 100 percent, got {}",
            discount_percent
        )));
    }
    if tax_rate < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "tax rate must not be negative".to_string(),
        ));
    }

    let last_position = OrderLineEntity::find()
        .filter(order_line::Column::OrderId.eq(order.id))
        .order_by_desc(order_line::Column::Position)
        .one(conn)
        .await?
        .map(|line| line.position)
        .unwrap_or(0);

    let line = order_line::ActiveModel {
        order_id: Set(order.id),
        position: Set(last_position + 1),
        article_id: Set(article.id),
        quantity: Set(input.quantity),
        unit_price: Set(unit_price),
        discount_percent: Set(discount_percent),
        tax_rate: Set(tax_rate),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    recalculate_in(conn, order.id).await?;
    Ok(line)
}

async fn cancel_order_in<C: ConnectionTrait>(
    conn: &C,
    order_id: i64,
    reason: &str,
) -> Result<(order::Model, bool), ServiceError> {
    let order = lock_order(conn, order_id).await?;
    if order.cancelled {
        return Ok((order, false));
    }

    let status = resolve_order_status(&order);
    if !status.can_transition_to(OrderStatus::Cancelled) {
        return Err(ServiceError::InvalidState(format!(
            "order {} in status {} cannot be cancelled",
            order.number, status
        )));
    }

    let notes = DeliveryNoteEntity::find()
        .filter(delivery_note::Column::OrderId.eq(order.id))
        .count(conn)
        .await?;
    if notes > 0 {
        return Err(ServiceError::InvalidState(format!(
            "order {} already has {} delivery note(s)",
            order.number, notes
        )));
    }

    let invoices = InvoiceEntity::find()
        .filter(invoice::Column::OrderId.eq(order.id))
        .filter(invoice::Column::Status.ne(InvoiceStatus::Cancelled))
        .count(conn)
        .await?;
    if invoices > 0 {
        return Err(ServiceError::InvalidState(format!(
            "order {} already has {} invoice(s)",
            order.number, invoices
        )));
    }

    let mut active: order::ActiveModel = order.into();
    active.cancelled = Set(true);
    active.cancel_reason = Set(Some(reason.to_string()));
    active.workflow_status = Set(Some(OrderStatus::Cancelled.workflow_code()));
    active.updated_at = Set(Utc::now());
    let order = active.update(conn).await?;

    recalculate_in(conn, order.id).await?;
    Ok((order, true))
}

/// Order intake: headers, lines and cancellation.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl OrderService {
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

    /// Creates an order. An existing order with the same number and
    /// customer is returned unchanged.
    #[instrument(skip(self, ctx, input), fields(actor = %ctx.actor, customer_id = input.customer_id))]
    pub async fn create_order(
        &self,
        ctx: &OperationContext,
        input: NewOrder,
    ) -> Result<order::Model, ServiceError> {
        input.validate()?;
        let actor = ctx.actor.clone();
        let settings = self.settings.clone();

        let (order, replayed) = self
            .uow
            .run(ctx.deadline, |txn| {
                let input = input.clone();
                let actor = actor.clone();
                let settings = settings.clone();
                Box::pin(async move { create_order_in(txn, &settings, &input, &actor).await })
            })
            .await?;

        if replayed {
            info!(order_id = order.id, "Order {} already exists", order.number);
            return Ok(order);
        }

        info!(order_id = order.id, "Order {} created", order.number);
        publish(
            &self.event_sender,
            Event::OrderCreated {
                order_id: order.id,
                number: order.number.clone(),
            },
        )
        .await;
        Ok(order)
    }

    /// Adds a line and refreshes the order summary.
    #[instrument(skip(self, ctx, input), fields(actor = %ctx.actor, order_id = input.order_id))]
    pub async fn add_line(
        &self,
        ctx: &OperationContext,
        input: NewOrderLine,
    ) -> Result<order_line::Model, ServiceError> {
        ensure_positive(input.quantity, "order quantity")?;

        let line = self
            .uow
            .run(ctx.deadline, |txn| {
                let input = input.clone();
                Box::pin(async move { add_line_in(txn, &input).await })
            })
            .await?;

        info!(order_line_id = line.id, "Order line added");
        publish(
            &self.event_sender,
            Event::OrderLineAdded {
                order_id: line.order_id,
                order_line_id: line.id,
            },
        )
        .await;
        Ok(line)
    }

    /// Cancels an order that has neither delivery notes nor live invoices.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn cancel_order(
        &self,
        ctx: &OperationContext,
        order_id: i64,
        reason: &str,
    ) -> Result<order::Model, ServiceError> {
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "a cancellation needs a reason".to_string(),
            ));
        }

        let (order, changed) = self
            .uow
            .run(ctx.deadline, |txn| {
                let reason = reason.clone();
                Box::pin(async move { cancel_order_in(txn, order_id, &reason).await })
            })
            .await
            .map_err(|e| {
                warn!(order_id, error = %e, "Order cancellation rejected");
                e
            })?;

        if changed {
            info!(order_id, "Order {} cancelled", order.number);
            publish(&self.event_sender, Event::OrderCancelled(order_id)).await;
        }
        Ok(order)
    }

    /// Order header, lines and resolved status.
    #[instrument(skip(self, ctx))]
    pub async fn get_order(
        &self,
        ctx: &OperationContext,
        order_id: i64,
    ) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            let order = OrderEntity::find_by_id(order_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
            let lines = OrderLineEntity::find()
                .filter(order_line::Column::OrderId.eq(order_id))
                .order_by_asc(order_line::Column::Position)
                .all(db)
                .await?;
            let status = resolve_order_status(&order);
            Ok(OrderDetails {
                order,
                lines,
                status,
            })
        })
        .await
    }
}
