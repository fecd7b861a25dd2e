//! SeaORM Entity for per-swap price observations
//!
//! Rows are identified by (time, tx_id, tx_swap_idx). Only `outlier` changes after insert.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "price")]
pub struct Model {
    /// Block time, epoch seconds
    #[sea_orm(primary_key, auto_increment = false)]
    pub time: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub tx_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub tx_swap_idx: i32,
    pub asset_id: i64,
    pub quote_asset_id: i64,
    /// Dex code of the pool that produced the swap
    pub provider: i32,
    #[sea_orm(column_type = "Float")]
    pub price: f32,
    #[sea_orm(column_type = "Decimal(Some((38, 0)))")]
    pub amount1: Decimal,
    #[sea_orm(column_type = "Decimal(Some((38, 0)))")]
    pub amount2: Decimal,
    pub operation: i32,
    pub outlier: Option<bool>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Identity triple of a price row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PriceKey {
    pub time: i64,
    pub tx_id: i64,
    pub tx_swap_idx: i32,
}

impl Model {
    pub fn key(&self) -> PriceKey {
        PriceKey {
            time: self.time,
            tx_id: self.tx_id,
            tx_swap_idx: self.tx_swap_idx,
        }
    }
}
