use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A batch of one article. Unique per `(article_id, batch_number)`.
///
/// `location_id` is the lot's current home; the quantity is never stored
/// and always replayed from the movement ledger.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_lots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub article_id: i64,
    pub location_id: i64,
    pub batch_number: String,
    pub expiry_date: Option<NaiveDate>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub unit_cost: Option<Decimal>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::quarantine_event::Entity")]
    QuarantineEvents,
}

impl Related<super::quarantine_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::QuarantineEvents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
