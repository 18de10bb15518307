use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::customer::TaxHandling;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum InvoiceKind {
    #[sea_orm(string_value = "Invoice")]
    Invoice,
    /// Negative-amount document referencing an original invoice.
    #[sea_orm(string_value = "CreditNote")]
    CreditNote,
}

/// How the lines of an invoice were derived.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum InvoiceMode {
    /// From delivered, not yet invoiced delivery note quantities.
    #[sea_orm(string_value = "FromDelivery")]
    FromDelivery,
    /// From full ordered quantities, without a shipment.
    #[sea_orm(string_value = "Direct")]
    Direct,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum InvoiceStatus {
    #[sea_orm(string_value = "Open")]
    Open,
    #[sea_orm(string_value = "PartiallyPaid")]
    PartiallyPaid,
    #[sea_orm(string_value = "Paid")]
    Paid,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
}

/// Invoice or credit note header.
///
/// Customer name, payment terms and tax handling are copied from the
/// customer at creation and never follow later master data changes.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "invoices")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub kind: InvoiceKind,
    #[sea_orm(unique)]
    pub number: String,
    pub order_id: Option<i64>,
    pub customer_id: i64,
    pub original_invoice_id: Option<i64>,
    pub mode: Option<InvoiceMode>,
    pub status: InvoiceStatus,
    pub currency: String,
    pub customer_name: String,
    pub payment_terms_days: i32,
    pub tax_handling: TaxHandling,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub net_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub gross_total: Decimal,
    pub reason: Option<String>,
    pub due_on: NaiveDate,
    pub paid_on: Option<NaiveDate>,
    pub cancelled_at: Option<DateTimeUtc>,
    pub cancelled_by: Option<String>,
    pub cancellation_note: Option<String>,
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,
    pub created_by: String,
    pub created_at: DateTimeUtc,
}

impl Model {
    pub fn is_cancelled(&self) -> bool {
        self.status == InvoiceStatus::Cancelled
    }

    pub fn is_credit_note(&self) -> bool {
        self.kind == InvoiceKind::CreditNote
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::invoice_line::Entity")]
    Lines,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::invoice_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
