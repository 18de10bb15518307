use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
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
        customer::{self, Entity as CustomerEntity},
        invoice::{self, Entity as InvoiceEntity, InvoiceKind, InvoiceMode, InvoiceStatus},
        invoice_line::{self, Entity as InvoiceLineEntity},
        order::{self, Model as OrderModel},
        order_line,
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        numbering::{format_document_number, next_value, DocumentType},
        order_status::{resolve_order_status, OrderStatus},
        order_summary::{line_progress, load_snapshot, recalculate_in, OrderSnapshot, OrderSummary},
        orders::lock_order,
        pricing::{line_amounts, LineAmounts},
    },
};

/// An invoice or credit note with its lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceDocument {
    pub header: invoice::Model,
    pub lines: Vec<invoice_line::Model>,
    /// Set when an existing document was returned instead of a new one.
    #[serde(skip)]
    pub replayed: bool,
}

/// Invoice line before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DraftLine {
    pub article_id: Option<i64>,
    pub order_line_id: Option<i64>,
    pub delivery_note_line_id: Option<i64>,
    pub description: Option<String>,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub tax_rate: Decimal,
    pub amounts: LineAmounts,
}

impl DraftLine {
    fn from_order_line(
        line: &order_line::Model,
        quantity: Decimal,
        delivery_note_line_id: Option<i64>,
        charges_tax: bool,
    ) -> Self {
        let tax_rate = if charges_tax { line.tax_rate } else { Decimal::ZERO };
        Self {
            article_id: Some(line.article_id),
            order_line_id: Some(line.id),
            delivery_note_line_id,
            description: None,
            quantity,
            unit_price: line.unit_price,
            discount_percent: line.discount_percent,
            tax_rate,
            amounts: line_amounts(quantity, line.unit_price, line.discount_percent, tax_rate),
        }
    }
}

/// Customer data frozen onto a document at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CustomerSnapshot {
    pub customer_id: i64,
    pub name: String,
    pub payment_terms_days: i32,
    pub tax_handling: customer::TaxHandling,
}

impl CustomerSnapshot {
    fn of(customer: &customer::Model, default_terms_days: i32) -> Self {
        let payment_terms_days = if customer.payment_terms_days < 0 {
            warn!(
                customer_id = customer.id,
                "Customer has negative payment terms, using default"
            );
            default_terms_days
        } else {
            customer.payment_terms_days
        };
        Self {
            customer_id: customer.id,
            name: customer.name.clone(),
            payment_terms_days,
            tax_handling: customer.tax_handling,
        }
    }

    pub fn due_on(&self, issued_on: NaiveDate) -> NaiveDate {
        issued_on + Duration::days(i64::from(self.payment_terms_days))
    }
}

pub(crate) async fn load_document<C: ConnectionTrait>(
    conn: &C,
    header: invoice::Model,
) -> Result<InvoiceDocument, ServiceError> {
    let lines = InvoiceLineEntity::find()
        .filter(invoice_line::Column::InvoiceId.eq(header.id))
        .order_by_asc(invoice_line::Column::Position)
        .all(conn)
        .await?;
    Ok(InvoiceDocument {
        header,
        lines,
        replayed: false,
    })
}

pub(crate) async fn find_by_key<C: ConnectionTrait>(
    conn: &C,
    idempotency_key: Option<&str>,
) -> Result<Option<invoice::Model>, ServiceError> {
    match idempotency_key {
        Some(key) => Ok(InvoiceEntity::find()
            .filter(invoice::Column::IdempotencyKey.eq(key))
            .one(conn)
            .await?),
        None => Ok(None),
    }
}

fn is_live_invoice(invoice: &invoice::Model) -> bool {
    invoice.kind == InvoiceKind::Invoice && !invoice.is_cancelled()
}

/// Quantities already invoiced per delivery-note line by live invoices.
fn invoiced_per_delivery_line(snapshot: &OrderSnapshot) -> HashMap<i64, (Decimal, i64)> {
    let live: HashMap<i64, &invoice::Model> = snapshot
        .invoices
        .iter()
        .filter(|invoice| is_live_invoice(invoice))
        .map(|invoice| (invoice.id, invoice))
        .collect();

    let mut invoiced: HashMap<i64, (Decimal, i64)> = HashMap::new();
    for line in &snapshot.invoice_lines {
        if let (Some(delivery_line_id), true) =
            (line.delivery_note_line_id, live.contains_key(&line.invoice_id))
        {
            let entry = invoiced
                .entry(delivery_line_id)
                .or_insert((Decimal::ZERO, line.invoice_id));
            entry.0 += line.quantity;
            entry.1 = entry.1.max(line.invoice_id);
        }
    }
    invoiced
}

/// What the next invoice of an order contains, or the existing invoice it
/// would duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InvoicePlan {
    New(Vec<DraftLine>),
    Existing(i64),
}

pub(crate) fn plan_from_delivery(
    order_id: i64,
    snapshot: &OrderSnapshot,
    charges_tax: bool,
) -> Result<InvoicePlan, ServiceError> {
    if snapshot.delivery_notes.is_empty() {
        return Err(ServiceError::NoDeliveryNote(order_id));
    }

    let order_lines: HashMap<i64, &order_line::Model> =
        snapshot.lines.iter().map(|line| (line.id, line)).collect();
    let invoiced = invoiced_per_delivery_line(snapshot);
    let mut pending_per_order_line: HashMap<i64, Decimal> = HashMap::new();
    let mut drafts = Vec::new();

    for delivery_line in &snapshot.delivery_lines {
        let done = invoiced
            .get(&delivery_line.id)
            .map(|(quantity, _)| *quantity)
            .unwrap_or_default();
        let pending = delivery_line.quantity - done;
        if pending <= Decimal::ZERO {
            continue;
        }
        let order_line = order_lines.get(&delivery_line.order_line_id).ok_or_else(|| {
            ServiceError::InternalError(format!(
                "delivery line {} references order line {} outside order {}",
                delivery_line.id, delivery_line.order_line_id, order_id
            ))
        })?;
        *pending_per_order_line.entry(order_line.id).or_default() += pending;
        drafts.push(DraftLine::from_order_line(
            order_line,
            pending,
            Some(delivery_line.id),
            charges_tax,
        ));
    }

    if drafts.is_empty() {
        let latest = snapshot
            .delivery_lines
            .iter()
            .map(|line| line.id)
            .max()
            .and_then(|id| invoiced.get(&id))
            .map(|(_, invoice_id)| *invoice_id);
        return match latest {
            Some(invoice_id) => Ok(InvoicePlan::Existing(invoice_id)),
            None => Err(ServiceError::OverInvoice(format!(
                "order {} has nothing left to invoice",
                order_id
            ))),
        };
    }

    for progress in line_progress(snapshot) {
        let pending = pending_per_order_line
            .get(&progress.order_line_id)
            .copied()
            .unwrap_or_default();
        if progress.invoiced + pending > progress.ordered {
            return Err(ServiceError::OverInvoice(format!(
                "order line {} would be invoiced {} of {} ordered",
                progress.order_line_id,
                progress.invoiced + pending,
                progress.ordered
            )));
        }
    }

    Ok(InvoicePlan::New(drafts))
}

pub(crate) fn plan_direct(
    order_id: i64,
    snapshot: &OrderSnapshot,
    charges_tax: bool,
) -> Result<InvoicePlan, ServiceError> {
    let existing = snapshot
        .invoices
        .iter()
        .find(|invoice| is_live_invoice(invoice) && invoice.mode == Some(InvoiceMode::Direct));
    if let Some(existing) = existing {
        return Ok(InvoicePlan::Existing(existing.id));
    }

    if snapshot.lines.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "order {} has no lines to invoice",
            order_id
        )));
    }
    if let Some(progress) = line_progress(snapshot)
        .into_iter()
        .find(|progress| progress.invoiced > Decimal::ZERO)
    {
        return Err(ServiceError::OverInvoice(format!(
            "order line {} is already invoiced",
            progress.order_line_id
        )));
    }

    Ok(InvoicePlan::New(
        snapshot
            .lines
            .iter()
            .map(|line| DraftLine::from_order_line(line, line.quantity, None, charges_tax))
            .collect(),
    ))
}

pub(crate) struct NewDocument<'a> {
    pub kind: InvoiceKind,
    pub doc_type: DocumentType,
    pub prefix: &'a str,
    pub order_id: Option<i64>,
    pub original_invoice_id: Option<i64>,
    pub mode: Option<InvoiceMode>,
    pub status: InvoiceStatus,
    pub currency: &'a str,
    pub customer: &'a CustomerSnapshot,
    pub reason: Option<String>,
    pub due_on: NaiveDate,
    pub paid_on: Option<NaiveDate>,
    pub idempotency_key: Option<String>,
    pub actor: &'a str,
}

/// Numbers and inserts a document header with its lines.
pub(crate) async fn insert_document<C: ConnectionTrait>(
    conn: &C,
    document: NewDocument<'_>,
    drafts: &[DraftLine],
) -> Result<InvoiceDocument, ServiceError> {
    let totals = drafts
        .iter()
        .fold(LineAmounts::default(), |acc, draft| acc + draft.amounts);
    let number = format_document_number(document.prefix, next_value(conn, document.doc_type).await?);

    let header = invoice::ActiveModel {
        kind: Set(document.kind),
        number: Set(number),
        order_id: Set(document.order_id),
        customer_id: Set(document.customer.customer_id),
        original_invoice_id: Set(document.original_invoice_id),
        mode: Set(document.mode),
        status: Set(document.status),
        currency: Set(document.currency.to_string()),
        customer_name: Set(document.customer.name.clone()),
        payment_terms_days: Set(document.customer.payment_terms_days),
        tax_handling: Set(document.customer.tax_handling),
        net_total: Set(totals.net),
        tax_total: Set(totals.tax),
        gross_total: Set(totals.gross),
        reason: Set(document.reason),
        due_on: Set(document.due_on),
        paid_on: Set(document.paid_on),
        cancelled_at: Set(None),
        cancelled_by: Set(None),
        cancellation_note: Set(None),
        idempotency_key: Set(document.idempotency_key),
        created_by: Set(document.actor.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    let mut lines = Vec::with_capacity(drafts.len());
    for (index, draft) in drafts.iter().enumerate() {
        let line = invoice_line::ActiveModel {
            invoice_id: Set(header.id),
            position: Set(i32::try_from(index + 1).unwrap_or(i32::MAX)),
            article_id: Set(draft.article_id),
            order_line_id: Set(draft.order_line_id),
            delivery_note_line_id: Set(draft.delivery_note_line_id),
            description: Set(draft.description.clone()),
            quantity: Set(draft.quantity),
            unit_price: Set(draft.unit_price),
            discount_percent: Set(draft.discount_percent),
            tax_rate: Set(draft.tax_rate),
            net_amount: Set(draft.amounts.net),
            tax_amount: Set(draft.amounts.tax),
            gross_amount: Set(draft.amounts.gross),
            ..Default::default()
        }
        .insert(conn)
        .await?;
        lines.push(line);
    }

    Ok(InvoiceDocument {
        header,
        lines,
        replayed: false,
    })
}

async fn customer_snapshot<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    order: &OrderModel,
) -> Result<CustomerSnapshot, ServiceError> {
    let customer = CustomerEntity::find_by_id(order.customer_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Customer", order.customer_id))?;
    Ok(CustomerSnapshot::of(
        &customer,
        settings.default_payment_terms_days,
    ))
}

pub(crate) async fn create_invoice_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    order_id: i64,
    mode: InvoiceMode,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<(InvoiceDocument, OrderSummary), ServiceError> {
    if let Some(existing) = find_by_key(conn, idempotency_key.as_deref()).await? {
        if existing.order_id != Some(order_id) {
            return Err(ServiceError::Conflict(format!(
                "idempotency key was used for invoice {}",
                existing.number
            )));
        }
        let summary = recalculate_in(conn, order_id).await?;
        let mut document = load_document(conn, existing).await?;
        document.replayed = true;
        return Ok((document, summary));
    }

    let order = lock_order(conn, order_id).await?;
    if order.cancelled {
        return Err(ServiceError::InvalidState(format!(
            "order {} is cancelled",
            order.number
        )));
    }

    let customer = customer_snapshot(conn, settings, &order).await?;
    let charges_tax = customer.tax_handling.charges_tax();
    let snapshot = load_snapshot(conn, order.id).await?;

    let plan = match mode {
        InvoiceMode::FromDelivery => plan_from_delivery(order.id, &snapshot, charges_tax)?,
        InvoiceMode::Direct => plan_direct(order.id, &snapshot, charges_tax)?,
    };

    let drafts = match plan {
        InvoicePlan::Existing(invoice_id) => {
            let header = InvoiceEntity::find_by_id(invoice_id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
            let summary = recalculate_in(conn, order.id).await?;
            let mut document = load_document(conn, header).await?;
            document.replayed = true;
            return Ok((document, summary));
        }
        InvoicePlan::New(drafts) => drafts,
    };

    let issued_on = Utc::now().date_naive();
    let document = insert_document(
        conn,
        NewDocument {
            kind: InvoiceKind::Invoice,
            doc_type: DocumentType::Invoice,
            prefix: &settings.invoice_prefix,
            order_id: Some(order.id),
            original_invoice_id: None,
            mode: Some(mode),
            status: InvoiceStatus::Open,
            currency: &order.currency,
            customer: &customer,
            reason: None,
            due_on: customer.due_on(issued_on),
            paid_on: None,
            idempotency_key,
            actor,
        },
        &drafts,
    )
    .await?;

    if mode == InvoiceMode::Direct && resolve_order_status(&order) == OrderStatus::Open {
        order::ActiveModel {
            id: Set(order.id),
            workflow_status: Set(Some(OrderStatus::InProgress.workflow_code())),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(conn)
        .await?;
    }

    let summary = recalculate_in(conn, order.id).await?;
    Ok((document, summary))
}

/// Builds invoices from delivery notes or directly from order lines.
#[derive(Clone)]
pub struct InvoiceService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl InvoiceService {
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

    /// Creates the next invoice of an order. Returns the existing invoice
    /// when the call would only duplicate it.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn create_invoice(
        &self,
        ctx: &OperationContext,
        order_id: i64,
        mode: InvoiceMode,
    ) -> Result<InvoiceDocument, ServiceError> {
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let (document, summary) = self
            .uow
            .run(ctx.deadline, |txn| {
                let actor = actor.clone();
                let key = key.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    create_invoice_in(txn, &settings, order_id, mode, &actor, key).await
                })
            })
            .await
            .map_err(|e| {
                warn!(order_id, %mode, error = %e, "Invoice rejected");
                e
            })?;

        if document.replayed {
            info!(invoice_id = document.header.id, "Invoice {} replayed", document.header.number);
            return Ok(document);
        }

        info!(
            invoice_id = document.header.id,
            lines = document.lines.len(),
            gross = %document.header.gross_total,
            invoicing = %summary.invoice_status,
            "Invoice {} created",
            document.header.number
        );
        publish(
            &self.event_sender,
            Event::InvoiceCreated {
                invoice_id: document.header.id,
                order_id,
                number: document.header.number.clone(),
                gross_total: document.header.gross_total,
            },
        )
        .await;
        publish(&self.event_sender, Event::OrderSummaryRecalculated(order_id)).await;
        Ok(document)
    }

    #[instrument(skip(self, ctx))]
    pub async fn get_invoice(
        &self,
        ctx: &OperationContext,
        invoice_id: i64,
    ) -> Result<InvoiceDocument, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            let header = InvoiceEntity::find_by_id(invoice_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
            load_document(db, header).await
        })
        .await
    }

    /// Invoices and credit notes of an order, oldest first.
    #[instrument(skip(self, ctx))]
    pub async fn list_for_order(
        &self,
        ctx: &OperationContext,
        order_id: i64,
    ) -> Result<Vec<invoice::Model>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            Ok(InvoiceEntity::find()
                .filter(invoice::Column::OrderId.eq(order_id))
                .order_by_asc(invoice::Column::Id)
                .all(db)
                .await?)
        })
        .await
    }
}
