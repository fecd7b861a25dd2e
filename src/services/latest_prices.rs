//! Current price snapshots per asset
//!
//! The pipeline records every computed price into [`LatestPriceBuffer`]; the
//! batcher job periodically folds the buffer into the asset rows and retries
//! token metadata for assets created while the registry had no answer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::entities::price;
use crate::error::PipelineError;
use crate::models::chain::LOVELACE;
use crate::services::price_processor::PriceProcessor;
use crate::services::storage::{LatestPriceUpdate, Store};
use crate::services::token_metadata::TokenMetadata;

/// Assets retried for metadata per flush
const METADATA_RETRY_BATCH: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestPriceSignal {
    pub asset_id: i64,
    pub quote_asset_id: i64,
    pub price: f64,
    pub time: i64,
    pub provider: i32,
}

impl From<&price::Model> for LatestPriceSignal {
    fn from(p: &price::Model) -> Self {
        Self {
            asset_id: p.asset_id,
            quote_asset_id: p.quote_asset_id,
            price: p.price as f64,
            time: p.time,
            provider: p.provider,
        }
    }
}

/// Newest signal per asset, last write wins on equal times
#[derive(Default)]
pub struct LatestPriceBuffer {
    signals: Mutex<HashMap<i64, LatestPriceSignal>>,
}

impl LatestPriceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, signal: LatestPriceSignal) {
        let mut signals = self.signals.lock();
        match signals.get(&signal.asset_id) {
            Some(current) if current.time > signal.time => {}
            _ => {
                signals.insert(signal.asset_id, signal);
            }
        }
    }

    pub fn record_prices(&self, prices: &[price::Model]) {
        for p in prices {
            self.record(LatestPriceSignal::from(p));
        }
    }

    pub fn drain(&self) -> Vec<LatestPriceSignal> {
        let mut signals: Vec<LatestPriceSignal> =
            self.signals.lock().drain().map(|(_, s)| s).collect();
        signals.sort_by_key(|s| s.asset_id);
        signals
    }

    /// Puts back signals whose flush failed, keeping anything newer recorded since
    pub fn restore(&self, signals: Vec<LatestPriceSignal>) {
        for signal in signals {
            self.record_if_absent_or_newer(signal);
        }
    }

    fn record_if_absent_or_newer(&self, signal: LatestPriceSignal) {
        let mut signals = self.signals.lock();
        match signals.get(&signal.asset_id) {
            Some(current) if current.time >= signal.time => {}
            _ => {
                signals.insert(signal.asset_id, signal);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.signals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushStats {
    pub prices_updated: u64,
    pub metadata_resolved: usize,
}

pub struct LatestPriceService {
    store: Arc<dyn Store>,
    metadata: Arc<dyn TokenMetadata>,
    price_processor: Arc<PriceProcessor>,
    buffer: Arc<LatestPriceBuffer>,
}

impl LatestPriceService {
    pub fn new(
        store: Arc<dyn Store>,
        metadata: Arc<dyn TokenMetadata>,
        price_processor: Arc<PriceProcessor>,
        buffer: Arc<LatestPriceBuffer>,
    ) -> Self {
        Self {
            store,
            metadata,
            price_processor,
            buffer,
        }
    }

    pub fn buffer(&self) -> Arc<LatestPriceBuffer> {
        Arc::clone(&self.buffer)
    }

    pub async fn flush(&self) -> Result<FlushStats, PipelineError> {
        let mut stats = FlushStats::default();

        let signals = self.buffer.drain();
        if !signals.is_empty() {
            match self.apply_signals(&signals).await {
                Ok(updated) => stats.prices_updated = updated,
                Err(e) => {
                    self.buffer.restore(signals);
                    return Err(e);
                }
            }
        }

        stats.metadata_resolved = self.retry_metadata().await?;

        if stats.prices_updated > 0 || stats.metadata_resolved > 0 {
            info!(
                prices_updated = stats.prices_updated,
                metadata_resolved = stats.metadata_resolved,
                "Flushed latest prices"
            );
        }
        Ok(stats)
    }

    async fn apply_signals(&self, signals: &[LatestPriceSignal]) -> Result<u64, PipelineError> {
        let ada_id = self
            .store
            .find_assets_by_units(&[LOVELACE.to_string()])
            .await?
            .first()
            .map(|a| a.id);

        let updates: Vec<LatestPriceUpdate> = signals
            .iter()
            .map(|s| LatestPriceUpdate {
                asset_id: s.asset_id,
                price: s.price,
                ada_price: (Some(s.quote_asset_id) == ada_id).then_some(s.price),
                time: s.time,
                provider: s.provider,
            })
            .collect();
        Ok(self.store.update_latest_prices(&updates).await?)
    }

    /// Returns how many assets gained decimals
    async fn retry_metadata(&self) -> Result<usize, PipelineError> {
        let pending = self.store.assets_pending_metadata(METADATA_RETRY_BATCH).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let units: Vec<String> = pending.iter().map(|a| a.unit.clone()).collect();
        let decimals = self.metadata.get_decimals(&units).await?;

        let mut resolved = 0;
        for asset in &pending {
            let found = decimals.get(&asset.unit).copied();
            if found.is_some() {
                resolved += 1;
            }
            self.store.update_asset_metadata(asset.id, found).await?;
        }
        debug!(pending = pending.len(), resolved = resolved, "Retried token metadata");

        if resolved > 0 {
            self.price_processor.invalidate_assets();
        }
        Ok(resolved)
    }
}
