use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{
    config::LedgerSettings,
    context::OperationContext,
    db::{lock_for_update, with_deadline, UnitOfWork},
    entities::{
        invoice::{self, Entity as InvoiceEntity, InvoiceKind, InvoiceStatus},
        invoice_line::{self, Entity as InvoiceLineEntity},
        payment::{self, Entity as PaymentEntity},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        inventory::ensure_positive,
        invoicing::{
            find_by_key, insert_document, load_document, CustomerSnapshot, DraftLine,
            InvoiceDocument, NewDocument,
        },
        numbering::DocumentType,
        order_summary::recalculate_in,
        pricing::{round_money, split_gross, LineAmounts},
    },
};

/// `gross − paid − credited`.
pub fn open_balance(gross: Decimal, paid: Decimal, credited: Decimal) -> Decimal {
    gross - paid - credited
}

/// Status of a non-cancelled invoice given what settled it so far.
pub fn derive_invoice_status(gross: Decimal, paid: Decimal, credited: Decimal) -> InvoiceStatus {
    if open_balance(gross, paid, credited) <= Decimal::ZERO {
        InvoiceStatus::Paid
    } else if paid + credited > Decimal::ZERO {
        InvoiceStatus::PartiallyPaid
    } else {
        InvoiceStatus::Open
    }
}

/// Settlement read model of one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceBalance {
    pub invoice_id: i64,
    pub status: InvoiceStatus,
    pub gross_total: Decimal,
    pub paid: Decimal,
    pub credited: Decimal,
    pub open_balance: Decimal,
}

/// Outcome of `record_payment`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentReceipt {
    pub payment: payment::Model,
    pub invoice: invoice::Model,
    pub balance: InvoiceBalance,
    #[serde(skip)]
    pub replayed: bool,
}

async fn lock_invoice<C: ConnectionTrait>(
    conn: &C,
    invoice_id: i64,
) -> Result<invoice::Model, ServiceError> {
    lock_for_update(InvoiceEntity::find_by_id(invoice_id), conn)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))
}

async fn credit_notes_of<C: ConnectionTrait>(
    conn: &C,
    invoice_id: i64,
) -> Result<Vec<invoice::Model>, ServiceError> {
    Ok(InvoiceEntity::find()
        .filter(invoice::Column::OriginalInvoiceId.eq(invoice_id))
        .filter(invoice::Column::Kind.eq(InvoiceKind::CreditNote))
        .filter(invoice::Column::Status.ne(InvoiceStatus::Cancelled))
        .all(conn)
        .await?)
}

pub(crate) async fn invoice_balance_in<C: ConnectionTrait>(
    conn: &C,
    invoice: &invoice::Model,
) -> Result<InvoiceBalance, ServiceError> {
    let paid: Decimal = PaymentEntity::find()
        .filter(payment::Column::InvoiceId.eq(invoice.id))
        .all(conn)
        .await?
        .iter()
        .map(|payment| payment.amount)
        .sum();
    let credited: Decimal = credit_notes_of(conn, invoice.id)
        .await?
        .iter()
        .map(|note| note.gross_total.abs())
        .sum();

    Ok(InvoiceBalance {
        invoice_id: invoice.id,
        status: invoice.status,
        gross_total: invoice.gross_total,
        paid,
        credited,
        open_balance: open_balance(invoice.gross_total, paid, credited),
    })
}

/// Re-derives the status of a live invoice from its payments and credits.
async fn settle_in<C: ConnectionTrait>(
    conn: &C,
    invoice: invoice::Model,
    paid_on: NaiveDate,
) -> Result<(invoice::Model, InvoiceBalance), ServiceError> {
    let balance = invoice_balance_in(conn, &invoice).await?;
    let status = derive_invoice_status(balance.gross_total, balance.paid, balance.credited);
    let paid_on = match status {
        InvoiceStatus::Paid => Some(invoice.paid_on.unwrap_or(paid_on)),
        _ => None,
    };

    let invoice = if invoice.status != status || invoice.paid_on != paid_on {
        let mut active: invoice::ActiveModel = invoice.into();
        active.status = Set(status);
        active.paid_on = Set(paid_on);
        active.update(conn).await?
    } else {
        invoice
    };

    Ok((
        invoice,
        InvoiceBalance {
            status,
            ..balance
        },
    ))
}

pub(crate) async fn record_payment_in<C: ConnectionTrait>(
    conn: &C,
    invoice_id: i64,
    amount: Decimal,
    paid_on: NaiveDate,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<PaymentReceipt, ServiceError> {
    if let Some(key) = idempotency_key.as_deref() {
        let existing = PaymentEntity::find()
            .filter(payment::Column::IdempotencyKey.eq(key))
            .one(conn)
            .await?;
        if let Some(payment) = existing {
            if payment.invoice_id != invoice_id {
                return Err(ServiceError::Conflict(format!(
                    "idempotency key {} was used for invoice {}",
                    key, payment.invoice_id
                )));
            }
            let invoice = InvoiceEntity::find_by_id(invoice_id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
            let balance = invoice_balance_in(conn, &invoice).await?;
            return Ok(PaymentReceipt {
                payment,
                invoice,
                balance,
                replayed: true,
            });
        }
    }

    let invoice = lock_invoice(conn, invoice_id).await?;
    if invoice.is_cancelled() {
        return Err(ServiceError::InvalidState(format!(
            "invoice {} is cancelled",
            invoice.number
        )));
    }
    if invoice.is_credit_note() {
        return Err(ServiceError::InvalidState(format!(
            "{} is a credit note and takes no payments",
            invoice.number
        )));
    }

    let before = invoice_balance_in(conn, &invoice).await?;
    if amount > before.open_balance {
        return Err(ServiceError::Overpayment(format!(
            "invoice {} has {} open, {} paid",
            invoice.number, before.open_balance, amount
        )));
    }

    let payment = payment::ActiveModel {
        invoice_id: Set(invoice.id),
        amount: Set(amount),
        paid_on: Set(paid_on),
        idempotency_key: Set(idempotency_key),
        recorded_by: Set(actor.to_string()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    let (invoice, balance) = settle_in(conn, invoice, paid_on).await?;
    if let Some(order_id) = invoice.order_id {
        recalculate_in(conn, order_id).await?;
    }

    Ok(PaymentReceipt {
        payment,
        invoice,
        balance,
        replayed: false,
    })
}

pub(crate) async fn cancel_invoice_in<C: ConnectionTrait>(
    conn: &C,
    invoice_id: i64,
    note: &str,
    actor: &str,
) -> Result<(invoice::Model, bool), ServiceError> {
    let invoice = lock_invoice(conn, invoice_id).await?;
    if invoice.is_cancelled() {
        return Ok((invoice, false));
    }

    if !invoice.is_credit_note() {
        let payments = PaymentEntity::find()
            .filter(payment::Column::InvoiceId.eq(invoice.id))
            .count(conn)
            .await?;
        if payments > 0 {
            return Err(ServiceError::InvalidState(format!(
                "invoice {} already has {} payment(s)",
                invoice.number, payments
            )));
        }
        let credits = credit_notes_of(conn, invoice.id).await?;
        if !credits.is_empty() {
            return Err(ServiceError::InvalidState(format!(
                "invoice {} already has {} credit note(s)",
                invoice.number,
                credits.len()
            )));
        }
    }

    let original_invoice_id = invoice.original_invoice_id;
    let mut active: invoice::ActiveModel = invoice.into();
    active.status = Set(InvoiceStatus::Cancelled);
    active.cancelled_at = Set(Some(Utc::now()));
    active.cancelled_by = Set(Some(actor.to_string()));
    active.cancellation_note = Set(Some(note.to_string()));
    let invoice = active.update(conn).await?;

    if let Some(original_id) = original_invoice_id {
        let original = lock_invoice(conn, original_id).await?;
        if !original.is_cancelled() {
            settle_in(conn, original, Utc::now().date_naive()).await?;
        }
    }
    if let Some(order_id) = invoice.order_id {
        recalculate_in(conn, order_id).await?;
    }

    Ok((invoice, true))
}

pub(crate) async fn create_credit_note_in<C: ConnectionTrait>(
    conn: &C,
    settings: &LedgerSettings,
    invoice_id: i64,
    amount: Decimal,
    reason: &str,
    actor: &str,
    idempotency_key: Option<String>,
) -> Result<InvoiceDocument, ServiceError> {
    if let Some(existing) = find_by_key(conn, idempotency_key.as_deref()).await? {
        if existing.original_invoice_id != Some(invoice_id) {
            return Err(ServiceError::Conflict(format!(
                "idempotency key was used for {}",
                existing.number
            )));
        }
        let mut document = load_document(conn, existing).await?;
        document.replayed = true;
        return Ok(document);
    }

    let original = lock_invoice(conn, invoice_id).await?;
    if original.is_cancelled() || original.is_credit_note() {
        return Err(ServiceError::InvalidState(format!(
            "{} cannot be credited",
            original.number
        )));
    }

    let credited: Decimal = credit_notes_of(conn, original.id)
        .await?
        .iter()
        .map(|note| note.gross_total.abs())
        .sum();
    let creditable = original.gross_total - credited;
    if amount > creditable {
        return Err(ServiceError::OverInvoice(format!(
            "invoice {} has {} left to credit, {} requested",
            original.number, creditable, amount
        )));
    }

    // Mixed-rate invoices are credited at the rate of their first line.
    let tax_rate = InvoiceLineEntity::find()
        .filter(invoice_line::Column::InvoiceId.eq(original.id))
        .order_by_asc(invoice_line::Column::Position)
        .one(conn)
        .await?
        .map(|line| line.tax_rate)
        .unwrap_or(Decimal::ZERO);
    let split = split_gross(amount, tax_rate);
    let negative = LineAmounts {
        net: -split.net,
        tax: -split.tax,
        gross: -split.gross,
    };

    let draft = DraftLine {
        article_id: None,
        order_line_id: None,
        delivery_note_line_id: None,
        description: Some(format!("Credit for {}: {}", original.number, reason)),
        quantity: Decimal::ONE,
        unit_price: negative.net,
        discount_percent: Decimal::ZERO,
        tax_rate,
        amounts: negative,
    };

    let customer = CustomerSnapshot {
        customer_id: original.customer_id,
        name: original.customer_name.clone(),
        payment_terms_days: original.payment_terms_days,
        tax_handling: original.tax_handling,
    };
    let today = Utc::now().date_naive();
    let document = insert_document(
        conn,
        NewDocument {
            kind: InvoiceKind::CreditNote,
            doc_type: DocumentType::CreditNote,
            prefix: &settings.credit_note_prefix,
            order_id: original.order_id,
            original_invoice_id: Some(original.id),
            mode: None,
            status: InvoiceStatus::Paid,
            currency: &original.currency,
            customer: &customer,
            reason: Some(reason.to_string()),
            due_on: today,
            paid_on: Some(today),
            idempotency_key,
            actor,
        },
        &[draft],
    )
    .await?;

    settle_in(conn, original, today).await?;
    if let Some(order_id) = document.header.order_id {
        recalculate_in(conn, order_id).await?;
    }

    Ok(document)
}

/// Applies payments and credit notes against invoices.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    uow: UnitOfWork,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl PaymentService {
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

    /// Records a payment. Amounts above the open balance are rejected.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn record_payment(
        &self,
        ctx: &OperationContext,
        invoice_id: i64,
        amount: Decimal,
        paid_on: NaiveDate,
    ) -> Result<PaymentReceipt, ServiceError> {
        let amount = round_money(amount);
        ensure_positive(amount, "payment amount")?;
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();

        let receipt = self
            .uow
            .run(ctx.deadline, |txn| {
                let actor = actor.clone();
                let key = key.clone();
                Box::pin(async move {
                    record_payment_in(txn, invoice_id, amount, paid_on, &actor, key).await
                })
            })
            .await
            .map_err(|e| {
                warn!(invoice_id, %amount, error = %e, "Payment rejected");
                e
            })?;

        if receipt.replayed {
            info!(payment_id = receipt.payment.id, "Payment replayed");
            return Ok(receipt);
        }

        info!(
            payment_id = receipt.payment.id,
            open = %receipt.balance.open_balance,
            status = %receipt.invoice.status,
            "Payment recorded on invoice {}",
            receipt.invoice.number
        );
        publish(
            &self.event_sender,
            Event::PaymentRecorded {
                payment_id: receipt.payment.id,
                invoice_id,
                amount,
            },
        )
        .await;
        if let Some(order_id) = receipt.invoice.order_id {
            publish(&self.event_sender, Event::OrderSummaryRecalculated(order_id)).await;
        }
        Ok(receipt)
    }

    /// Soft-cancels an invoice or credit note. Stock is never touched.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn cancel_invoice(
        &self,
        ctx: &OperationContext,
        invoice_id: i64,
        note: &str,
    ) -> Result<invoice::Model, ServiceError> {
        let note = note.trim().to_string();
        if note.is_empty() {
            return Err(ServiceError::ValidationError(
                "a cancellation needs an audit note".to_string(),
            ));
        }
        let actor = ctx.actor.clone();

        let (invoice, changed) = self
            .uow
            .run(ctx.deadline, |txn| {
                let note = note.clone();
                let actor = actor.clone();
                Box::pin(async move { cancel_invoice_in(txn, invoice_id, &note, &actor).await })
            })
            .await?;

        if changed {
            info!(invoice_id, "Invoice {} cancelled", invoice.number);
            publish(&self.event_sender, Event::InvoiceCancelled(invoice_id)).await;
            if let Some(order_id) = invoice.order_id {
                publish(&self.event_sender, Event::OrderSummaryRecalculated(order_id)).await;
            }
        }
        Ok(invoice)
    }

    /// Issues a credit note over a gross `amount` against an invoice.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn create_credit_note(
        &self,
        ctx: &OperationContext,
        invoice_id: i64,
        amount: Decimal,
        reason: &str,
    ) -> Result<InvoiceDocument, ServiceError> {
        let amount = round_money(amount);
        ensure_positive(amount, "credit amount")?;
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "a credit note needs a reason".to_string(),
            ));
        }
        let actor = ctx.actor.clone();
        let key = ctx.idempotency_key.clone();
        let settings = self.settings.clone();

        let document = self
            .uow
            .run(ctx.deadline, |txn| {
                let reason = reason.clone();
                let actor = actor.clone();
                let key = key.clone();
                let settings = settings.clone();
                Box::pin(async move {
                    create_credit_note_in(txn, &settings, invoice_id, amount, &reason, &actor, key)
                        .await
                })
            })
            .await?;

        if document.replayed {
            return Ok(document);
        }

        info!(
            credit_note_id = document.header.id,
            gross = %document.header.gross_total,
            "Credit note {} created",
            document.header.number
        );
        publish(
            &self.event_sender,
            Event::CreditNoteCreated {
                credit_note_id: document.header.id,
                invoice_id,
                amount,
            },
        )
        .await;
        if let Some(order_id) = document.header.order_id {
            publish(&self.event_sender, Event::OrderSummaryRecalculated(order_id)).await;
        }
        Ok(document)
    }

    #[instrument(skip(self, ctx))]
    pub async fn invoice_balance(
        &self,
        ctx: &OperationContext,
        invoice_id: i64,
    ) -> Result<InvoiceBalance, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            let invoice = InvoiceEntity::find_by_id(invoice_id)
                .one(db)
                .await?
                .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
            invoice_balance_in(db, &invoice).await
        })
        .await
    }

    /// Payments of an invoice, oldest first.
    #[instrument(skip(self, ctx))]
    pub async fn payments(
        &self,
        ctx: &OperationContext,
        invoice_id: i64,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let db = &*self.db;
        with_deadline(ctx.deadline, async {
            Ok(PaymentEntity::find()
                .filter(payment::Column::InvoiceId.eq(invoice_id))
                .order_by_asc(payment::Column::Id)
                .all(db)
                .await?)
        })
        .await
    }
}
