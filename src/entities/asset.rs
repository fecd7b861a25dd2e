//! SeaORM Entity for on-chain assets

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "asset")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// policy id hex followed by asset name hex, or "lovelace"
    #[sea_orm(unique)]
    pub unit: String,
    pub policy: String,
    /// Decoded asset name, null bytes stripped
    pub native_name: String,
    pub decimals: Option<i32>,
    pub metadata_fetched: Option<bool>,
    /// Last observed price in the quote asset
    pub price: Option<f64>,
    /// Last observed price against ADA
    pub ada_price: Option<f64>,
    /// Epoch seconds of the swap behind `price`
    pub last_price_update: Option<i64>,
    pub pricing_provider: Option<i32>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
