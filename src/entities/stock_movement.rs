use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum MovementReason {
    #[sea_orm(string_value = "Receipt")]
    Receipt,
    #[sea_orm(string_value = "Sale")]
    Sale,
    #[sea_orm(string_value = "StockCount")]
    StockCount,
    #[sea_orm(string_value = "Shrinkage")]
    Shrinkage,
    #[sea_orm(string_value = "Return")]
    Return,
    #[sea_orm(string_value = "Transfer")]
    Transfer,
    #[sea_orm(string_value = "Correction")]
    Correction,
    #[sea_orm(string_value = "Quarantine")]
    Quarantine,
    #[sea_orm(string_value = "Release")]
    Release,
}

/// Immutable ledger row. A receipt has only `to_location_id`, an issue only
/// `from_location_id`, a transfer both.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub article_id: i64,
    pub lot_id: Option<i64>,
    pub from_location_id: Option<i64>,
    pub to_location_id: Option<i64>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity: Decimal,
    pub reason: MovementReason,
    pub reference_document_id: Option<i64>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub unit_cost: Option<Decimal>,
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,
    pub actor: String,
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Signed effect of this movement on the stock at `location`.
    pub fn delta_at(&self, location: i64) -> Decimal {
        let mut delta = Decimal::ZERO;
        if self.to_location_id == Some(location) {
            delta += self.quantity;
        }
        if self.from_location_id == Some(location) {
            delta -= self.quantity;
        }
        delta
    }

    /// Signed effect on total stock on hand; transfers net to zero.
    pub fn net_delta(&self) -> Decimal {
        match (self.from_location_id, self.to_location_id) {
            (None, Some(_)) => self.quantity,
            (Some(_), None) => -self.quantity,
            _ => Decimal::ZERO,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
