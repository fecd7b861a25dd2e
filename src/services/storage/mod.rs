//! Repository operations over the persisted indexer state
//!
//! Writers converge through natural keys (asset unit, price identity triple,
//! candle symbol and bucket) so concurrent or repeated writes upsert instead of
//! needing a global lock.

pub mod memory;
pub mod sea_orm_store;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::entities::{asset, price, price::PriceKey};
use crate::error::StoreError;
use crate::models::candle::{Candle, Resolution};

pub use memory::MemoryStore;
pub use sea_orm_store::SeaOrmStore;

/// Asset row to create
#[derive(Debug, Clone, PartialEq)]
pub struct NewAsset {
    pub unit: String,
    pub policy: String,
    pub native_name: String,
    pub decimals: Option<i32>,
    pub metadata_fetched: bool,
}

/// Current price snapshot for an asset
#[derive(Debug, Clone, PartialEq)]
pub struct LatestPriceUpdate {
    pub asset_id: i64,
    pub price: f64,
    /// Set only when the quote asset is ADA
    pub ada_price: Option<f64>,
    pub time: i64,
    pub provider: i32,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_assets_by_units(&self, units: &[String]) -> Result<Vec<asset::Model>, StoreError>;

    /// Inserts assets, skipping units that already exist
    async fn insert_assets(&self, assets: &[NewAsset]) -> Result<(), StoreError>;

    /// Assets whose metadata lookup has not succeeded yet
    async fn assets_pending_metadata(&self, limit: u64) -> Result<Vec<asset::Model>, StoreError>;

    async fn update_asset_metadata(&self, asset_id: i64, decimals: Option<i32>) -> Result<(), StoreError>;

    /// Applies snapshots that are not older than the stored one. Returns rows changed.
    async fn update_latest_prices(&self, updates: &[LatestPriceUpdate]) -> Result<u64, StoreError>;

    /// Id per transaction hash (hex), creating missing rows
    async fn resolve_tx_ids(&self, hashes: &[String]) -> Result<HashMap<String, i64>, StoreError>;

    async fn existing_price_keys(&self, keys: &[PriceKey]) -> Result<HashSet<PriceKey>, StoreError>;

    /// Inserts prices, overwriting everything but `outlier` on identity conflicts
    async fn upsert_prices(&self, prices: &[price::Model]) -> Result<(), StoreError>;

    /// Earliest of the per-symbol latest 15m candle times
    async fn candle_sync_point_time(&self) -> Result<Option<i64>, StoreError>;

    /// Pairs with unclassified prices since `from_time`
    async fn outlier_candidate_pairs(&self, from_time: i64) -> Result<Vec<(i64, i64)>, StoreError>;

    /// Unreviewed prices of a pair since `from_time`, oldest first
    async fn prices_for_pair(
        &self,
        asset_id: i64,
        quote_asset_id: i64,
        from_time: i64,
    ) -> Result<Vec<price::Model>, StoreError>;

    /// Mean of the non-outlier prices since `from_time`
    async fn average_price(
        &self,
        asset_id: i64,
        quote_asset_id: i64,
        from_time: i64,
    ) -> Result<Option<f64>, StoreError>;

    async fn mark_outliers(&self, keys: &[PriceKey]) -> Result<u64, StoreError>;

    async fn get_candle(
        &self,
        resolution: Resolution,
        symbol: &str,
        time: i64,
    ) -> Result<Option<Candle>, StoreError>;

    async fn upsert_candles(&self, resolution: Resolution, candles: &[Candle]) -> Result<(), StoreError>;

    async fn refresh_view(&self, name: &str) -> Result<(), StoreError>;
}

/// View names end up in SQL, only plain identifiers pass
pub fn validate_view_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidViewName(name.to_string()))
    }
}
