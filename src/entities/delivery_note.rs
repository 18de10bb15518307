use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Shipment document. Numbered `<order number>-<sequence>` per order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "delivery_notes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub order_id: i64,
    #[sea_orm(unique)]
    pub number: String,
    pub sequence: i32,
    pub ship_from_location_id: Option<i64>,
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,
    pub created_by: String,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::delivery_note_line::Entity")]
    Lines,
}

impl Related<super::delivery_note_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
