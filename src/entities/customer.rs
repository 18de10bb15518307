use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// How tax is applied to a customer's invoices.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum TaxHandling {
    #[sea_orm(string_value = "Standard")]
    Standard,
    /// Intra-community supply, tax owed by the recipient.
    #[sea_orm(string_value = "ReverseCharge")]
    ReverseCharge,
    #[sea_orm(string_value = "Export")]
    Export,
}

impl TaxHandling {
    /// Whether invoice lines carry the article's tax rate.
    pub fn charges_tax(self) -> bool {
        matches!(self, TaxHandling::Standard)
    }
}

/// Customer master record (read-only). Snapshotted onto invoices.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "customers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub payment_terms_days: i32,
    pub tax_handling: TaxHandling,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
