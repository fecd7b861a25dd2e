//! Turns swaps into persisted price observations
//!
//! Resolves asset units and transaction hashes to stable row ids (creating them on
//! first sight) and computes the decimal-normalised price of every swap. The
//! identity of each produced row depends only on the swap and its block, so
//! reprocessing a block yields the same rows.

use moka::future::Cache;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entities::price;
use crate::error::PipelineError;
use crate::models::chain::{LOVELACE, LOVELACE_DECIMALS, split_unit};
use crate::models::swap::Swap;
use crate::services::slot_time::SlotClock;
use crate::services::storage::{NewAsset, Store};
use crate::services::token_metadata::TokenMetadata;

const ASSET_CACHE_CAPACITY: u64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct AssetRef {
    id: i64,
    decimals: Option<i32>,
}

/// Price of asset2 in units of asset1
pub fn calculate_price(amount1: u64, decimals1: i32, amount2: u64, decimals2: i32) -> f64 {
    let normalised1 = amount1 as f64 / 10f64.powi(decimals1);
    let normalised2 = amount2 as f64 / 10f64.powi(decimals2);
    normalised1 / normalised2
}

pub struct PriceProcessor {
    store: Arc<dyn Store>,
    metadata: Arc<dyn TokenMetadata>,
    clock: SlotClock,
    /// unit -> asset row
    asset_cache: Cache<String, AssetRef>,
}

impl PriceProcessor {
    pub fn new(store: Arc<dyn Store>, metadata: Arc<dyn TokenMetadata>, clock: SlotClock) -> Self {
        Self {
            store,
            metadata,
            clock,
            asset_cache: Cache::new(ASSET_CACHE_CAPACITY),
        }
    }

    /// One price per swap, in swap order
    pub async fn process_swaps(
        &self,
        swaps: &[Swap],
        block_slot: u64,
    ) -> Result<Vec<price::Model>, PipelineError> {
        if swaps.is_empty() {
            return Ok(vec![]);
        }

        let mut units: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for swap in swaps {
            for unit in [&swap.asset1_unit, &swap.asset2_unit] {
                if seen.insert(unit.as_str()) {
                    units.push(unit.clone());
                }
            }
        }
        let assets = self.resolve_assets(&units).await?;

        let mut hashes: Vec<String> = swaps.iter().map(|s| s.tx_hash.clone()).collect();
        hashes.dedup();
        let tx_ids = self.store.resolve_tx_ids(&hashes).await?;

        let time = self.clock.slot_to_time(block_slot);
        let mut swap_idx: HashMap<&str, i32> = HashMap::new();
        let mut prices = Vec::with_capacity(swaps.len());

        for swap in swaps {
            let idx = swap_idx.entry(swap.tx_hash.as_str()).or_insert(0);
            let tx_swap_idx = *idx;
            *idx += 1;

            let (Some(asset1), Some(asset2), Some(tx_id)) = (
                assets.get(&swap.asset1_unit),
                assets.get(&swap.asset2_unit),
                tx_ids.get(&swap.tx_hash),
            ) else {
                warn!(tx = %swap.tx_hash, "Swap references an unresolved asset or transaction, skipping");
                continue;
            };
            if swap.amount2 == 0 {
                warn!(tx = %swap.tx_hash, "Swap with zero amount2, skipping");
                continue;
            }

            let value = calculate_price(
                swap.amount1,
                asset1.decimals.unwrap_or(0),
                swap.amount2,
                asset2.decimals.unwrap_or(0),
            );

            prices.push(price::Model {
                time,
                tx_id: *tx_id,
                tx_swap_idx,
                asset_id: asset2.id,
                quote_asset_id: asset1.id,
                provider: swap.dex,
                price: value as f32,
                amount1: Decimal::from(swap.amount1),
                amount2: Decimal::from(swap.amount2),
                operation: swap.operation,
                outlier: None,
            });
        }

        debug!(swaps = swaps.len(), prices = prices.len(), slot = block_slot, "Calculated prices");
        Ok(prices)
    }

    async fn resolve_assets(&self, units: &[String]) -> Result<HashMap<String, AssetRef>, PipelineError> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();
        for unit in units {
            match self.asset_cache.get(unit).await {
                Some(asset) => {
                    resolved.insert(unit.clone(), asset);
                }
                None => missing.push(unit.clone()),
            }
        }
        if missing.is_empty() {
            return Ok(resolved);
        }

        self.load_assets(&missing, &mut resolved).await?;
        let unknown: Vec<String> = missing
            .into_iter()
            .filter(|u| !resolved.contains_key(u))
            .collect();
        if unknown.is_empty() {
            return Ok(resolved);
        }

        self.create_assets(&unknown).await?;
        self.load_assets(&unknown, &mut resolved).await?;
        Ok(resolved)
    }

    async fn load_assets(
        &self,
        units: &[String],
        resolved: &mut HashMap<String, AssetRef>,
    ) -> Result<(), PipelineError> {
        for asset in self.store.find_assets_by_units(units).await? {
            let asset_ref = AssetRef {
                id: asset.id,
                decimals: asset.decimals,
            };
            self.asset_cache.insert(asset.unit.clone(), asset_ref).await;
            resolved.insert(asset.unit, asset_ref);
        }
        Ok(())
    }

    async fn create_assets(&self, units: &[String]) -> Result<(), PipelineError> {
        let tokens: Vec<String> = units.iter().filter(|u| *u != LOVELACE).cloned().collect();
        let (decimals, lookup_ok) = if tokens.is_empty() {
            (HashMap::new(), true)
        } else {
            match self.metadata.get_decimals(&tokens).await {
                Ok(found) => (found, true),
                Err(e) => {
                    warn!(error = %e, units = tokens.len(), "Token metadata lookup failed, creating assets without decimals");
                    (HashMap::new(), false)
                }
            }
        };

        let new_assets: Vec<NewAsset> = units
            .iter()
            .map(|unit| {
                let (policy, native_name) = split_unit(unit);
                if unit == LOVELACE {
                    return NewAsset {
                        unit: unit.clone(),
                        policy,
                        native_name,
                        decimals: Some(LOVELACE_DECIMALS),
                        metadata_fetched: true,
                    };
                }
                let known = decimals.get(unit).copied();
                NewAsset {
                    unit: unit.clone(),
                    policy,
                    native_name,
                    decimals: known,
                    metadata_fetched: lookup_ok && known.is_some(),
                }
            })
            .collect();

        self.store.insert_assets(&new_assets).await?;
        info!(count = new_assets.len(), "Created new assets");
        Ok(())
    }

    /// Drops cached asset rows, e.g. after their decimals changed
    pub fn invalidate_assets(&self) {
        self.asset_cache.invalidate_all();
    }
}
