//! In-process store, used for dry runs and tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{LatestPriceUpdate, NewAsset, Store, validate_view_name};
use crate::entities::{asset, price, price::PriceKey};
use crate::error::StoreError;
use crate::models::candle::{Candle, Resolution};

#[derive(Default)]
struct Inner {
    assets: Vec<asset::Model>,
    txs: HashMap<String, i64>,
    prices: BTreeMap<PriceKey, price::Model>,
    candles: HashMap<(Resolution, String, i64), Candle>,
    refreshed_views: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assets(&self) -> Vec<asset::Model> {
        self.inner.lock().assets.clone()
    }

    /// Prices ordered by identity triple
    pub fn prices(&self) -> Vec<price::Model> {
        self.inner.lock().prices.values().cloned().collect()
    }

    /// Candles of one resolution ordered by (symbol, time)
    pub fn candles(&self, resolution: Resolution) -> Vec<Candle> {
        let inner = self.inner.lock();
        let mut candles: Vec<Candle> = inner
            .candles
            .iter()
            .filter(|((r, _, _), _)| *r == resolution)
            .map(|(_, c)| c.clone())
            .collect();
        candles.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.time.cmp(&b.time)));
        candles
    }

    pub fn refreshed_views(&self) -> Vec<String> {
        self.inner.lock().refreshed_views.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_assets_by_units(&self, units: &[String]) -> Result<Vec<asset::Model>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .assets
            .iter()
            .filter(|a| units.contains(&a.unit))
            .cloned()
            .collect())
    }

    async fn insert_assets(&self, assets: &[NewAsset]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for new in assets {
            if inner.assets.iter().any(|a| a.unit == new.unit) {
                continue;
            }
            let id = inner.assets.len() as i64 + 1;
            inner.assets.push(asset::Model {
                id,
                unit: new.unit.clone(),
                policy: new.policy.clone(),
                native_name: new.native_name.clone(),
                decimals: new.decimals,
                metadata_fetched: Some(new.metadata_fetched),
                price: None,
                ada_price: None,
                last_price_update: None,
                pricing_provider: None,
            });
        }
        Ok(())
    }

    async fn assets_pending_metadata(&self, limit: u64) -> Result<Vec<asset::Model>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .assets
            .iter()
            .filter(|a| a.metadata_fetched == Some(false))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn update_asset_metadata(&self, asset_id: i64, decimals: Option<i32>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(asset) = inner.assets.iter_mut().find(|a| a.id == asset_id) {
            asset.decimals = decimals;
            asset.metadata_fetched = Some(true);
        }
        Ok(())
    }

    async fn update_latest_prices(&self, updates: &[LatestPriceUpdate]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for update in updates {
            let Some(asset) = inner.assets.iter_mut().find(|a| a.id == update.asset_id) else {
                continue;
            };
            if asset.last_price_update.is_some_and(|t| t > update.time) {
                continue;
            }
            asset.price = Some(update.price);
            if update.ada_price.is_some() {
                asset.ada_price = update.ada_price;
            }
            asset.last_price_update = Some(update.time);
            asset.pricing_provider = Some(update.provider);
            changed += 1;
        }
        Ok(changed)
    }

    async fn resolve_tx_ids(&self, hashes: &[String]) -> Result<HashMap<String, i64>, StoreError> {
        let mut inner = self.inner.lock();
        let mut ids = HashMap::new();
        for hash in hashes {
            let next = inner.txs.len() as i64 + 1;
            let id = *inner.txs.entry(hash.clone()).or_insert(next);
            ids.insert(hash.clone(), id);
        }
        Ok(ids)
    }

    async fn existing_price_keys(&self, keys: &[PriceKey]) -> Result<HashSet<PriceKey>, StoreError> {
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .filter(|k| inner.prices.contains_key(k))
            .copied()
            .collect())
    }

    async fn upsert_prices(&self, prices: &[price::Model]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for p in prices {
            let outlier = inner.prices.get(&p.key()).and_then(|existing| existing.outlier);
            let mut row = p.clone();
            if outlier.is_some() {
                row.outlier = outlier;
            }
            inner.prices.insert(p.key(), row);
        }
        Ok(())
    }

    async fn candle_sync_point_time(&self) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock();
        let mut latest: HashMap<&str, i64> = HashMap::new();
        for ((resolution, symbol, time), _) in inner.candles.iter() {
            if *resolution != Resolution::FifteenMinutes {
                continue;
            }
            let entry = latest.entry(symbol.as_str()).or_insert(*time);
            *entry = (*entry).max(*time);
        }
        Ok(latest.values().min().copied())
    }

    async fn outlier_candidate_pairs(&self, from_time: i64) -> Result<Vec<(i64, i64)>, StoreError> {
        let inner = self.inner.lock();
        let mut pairs: Vec<(i64, i64)> = inner
            .prices
            .values()
            .filter(|p| p.time >= from_time && p.outlier.is_none())
            .map(|p| (p.asset_id, p.quote_asset_id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        pairs.sort();
        Ok(pairs)
    }

    async fn prices_for_pair(
        &self,
        asset_id: i64,
        quote_asset_id: i64,
        from_time: i64,
    ) -> Result<Vec<price::Model>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .prices
            .values()
            .filter(|p| {
                p.asset_id == asset_id
                    && p.quote_asset_id == quote_asset_id
                    && p.time >= from_time
                    && p.outlier.is_none()
            })
            .cloned()
            .collect())
    }

    async fn average_price(
        &self,
        asset_id: i64,
        quote_asset_id: i64,
        from_time: i64,
    ) -> Result<Option<f64>, StoreError> {
        let values: Vec<f64> = self
            .inner
            .lock()
            .prices
            .values()
            .filter(|p| {
                p.asset_id == asset_id
                    && p.quote_asset_id == quote_asset_id
                    && p.time >= from_time
                    && p.outlier != Some(true)
            })
            .map(|p| p.price as f64)
            .collect();
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }

    async fn mark_outliers(&self, keys: &[PriceKey]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let mut marked = 0;
        for key in keys {
            if let Some(p) = inner.prices.get_mut(key) {
                p.outlier = Some(true);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn get_candle(
        &self,
        resolution: Resolution,
        symbol: &str,
        time: i64,
    ) -> Result<Option<Candle>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .candles
            .get(&(resolution, symbol.to_string(), time))
            .cloned())
    }

    async fn upsert_candles(&self, resolution: Resolution, candles: &[Candle]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for candle in candles {
            inner
                .candles
                .insert((resolution, candle.symbol.clone(), candle.time), candle.clone());
        }
        Ok(())
    }

    async fn refresh_view(&self, name: &str) -> Result<(), StoreError> {
        validate_view_name(name)?;
        self.inner.lock().refreshed_views.push(name.to_string());
        Ok(())
    }
}
