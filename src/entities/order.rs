use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Aggregate delivery progress of an order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum DeliveryStatus {
    #[sea_orm(string_value = "NotShipped")]
    NotShipped,
    #[sea_orm(string_value = "PartiallyShipped")]
    PartiallyShipped,
    #[sea_orm(string_value = "Shipped")]
    Shipped,
}

/// Aggregate invoicing progress of an order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum InvoicingStatus {
    #[sea_orm(string_value = "NotInvoiced")]
    NotInvoiced,
    #[sea_orm(string_value = "PartiallyInvoiced")]
    PartiallyInvoiced,
    #[sea_orm(string_value = "Invoiced")]
    Invoiced,
}

/// Aggregate settlement progress of an order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "Unpaid")]
    Unpaid,
    #[sea_orm(string_value = "PartiallyPaid")]
    PartiallyPaid,
    #[sea_orm(string_value = "Paid")]
    Paid,
}

/// Sales order header.
///
/// The money totals and the three aggregate statuses are a cached summary
/// written only by the order summary recalculation.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub number: String,
    pub customer_id: i64,
    pub currency: String,
    /// Workflow code: 0 open, 1 in progress, 2 ready to ship, 3 shipped,
    /// 4 completed, 255 cancelled.
    pub workflow_status: Option<i32>,
    pub cancelled: bool,
    pub cancel_reason: Option<String>,
    pub shipped_at: Option<DateTimeUtc>,
    pub paid_at: Option<NaiveDate>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub net_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub tax_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub gross_total: Decimal,
    pub delivery_status: DeliveryStatus,
    pub invoice_status: InvoicingStatus,
    pub payment_status: PaymentStatus,
    pub fully_delivered: bool,
    pub delivery_note_count: i32,
    pub open_line_count: i32,
    pub created_by: String,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    OrderLines,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
