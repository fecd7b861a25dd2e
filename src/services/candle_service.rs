//! Incremental OHLCV aggregation of prices into the four candle resolutions

use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::entities::price;
use crate::error::StoreError;
use crate::models::candle::{Candle, Resolution, candle_symbol};
use crate::services::slot_time::SlotClock;
use crate::services::storage::Store;

pub struct CandleService {
    store: Arc<dyn Store>,
    clock: SlotClock,
}

impl CandleService {
    pub fn new(store: Arc<dyn Store>, clock: SlotClock) -> Self {
        Self { store, clock }
    }

    /// Folds `prices` into their buckets for every resolution.
    ///
    /// Prices must arrive in chronological order, close is last-write.
    /// Returns the number of candles written.
    pub async fn apply_prices(&self, prices: &[price::Model]) -> Result<usize, StoreError> {
        if prices.is_empty() {
            return Ok(0);
        }
        let mut written = 0;

        for resolution in Resolution::ALL {
            let mut touched: HashMap<(String, i64), Candle> = HashMap::new();
            let mut order: Vec<(String, i64)> = Vec::new();

            for p in prices {
                let key = (
                    candle_symbol(p.asset_id, p.quote_asset_id),
                    self.clock.bucket_start(resolution, p.time),
                );
                let value = p.price as f64;
                let volume = p.amount1.to_f64().unwrap_or(0.0);

                if let Some(candle) = touched.get_mut(&key) {
                    candle.apply(value, volume);
                    continue;
                }
                let candle = match self.store.get_candle(resolution, &key.0, key.1).await? {
                    Some(mut existing) => {
                        existing.apply(value, volume);
                        existing
                    }
                    None => Candle::opened_at(key.0.clone(), key.1, value, volume),
                };
                order.push(key.clone());
                touched.insert(key, candle);
            }

            let candles: Vec<Candle> = order
                .into_iter()
                .filter_map(|key| touched.remove(&key))
                .collect();
            self.store.upsert_candles(resolution, &candles).await?;
            written += candles.len();
            debug!(resolution = resolution.label(), candles = candles.len(), "Updated candles");
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::MemoryStore;

    fn price_at(time: i64, tx_id: i64, value: f32, amount1: u64) -> price::Model {
        price::Model {
            time,
            tx_id,
            tx_swap_idx: 0,
            asset_id: 2,
            quote_asset_id: 1,
            provider: 2,
            price: value,
            amount1: amount1.into(),
            amount2: 1.into(),
            operation: 0,
            outlier: None,
        }
    }

    #[tokio::test]
    async fn test_fifteen_minute_bucket_alignment() {
        let store = Arc::new(MemoryStore::new());
        let service = CandleService::new(store.clone(), SlotClock::mainnet());
        let t = 1_700_000_123;

        service.apply_prices(&[price_at(t, 1, 2.0, 10)]).await.unwrap();

        let candles = store.candles(Resolution::FifteenMinutes);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].time, t - t % 900);
        assert_eq!(candles[0].symbol, "2:1");
        assert_eq!(store.candles(Resolution::Week).len(), 1);
    }

    #[tokio::test]
    async fn test_updates_existing_bucket_across_calls() {
        let store = Arc::new(MemoryStore::new());
        let service = CandleService::new(store.clone(), SlotClock::mainnet());
        let t = 1_700_000_100;

        service
            .apply_prices(&[price_at(t, 1, 2.0, 10), price_at(t + 5, 2, 3.0, 5)])
            .await
            .unwrap();
        service.apply_prices(&[price_at(t + 60, 3, 1.0, 1)]).await.unwrap();

        let candle = &store.candles(Resolution::Hour)[0];
        assert_eq!(candle.open, 2.0);
        assert_eq!(candle.high, 3.0);
        assert_eq!(candle.low, 1.0);
        assert_eq!(candle.close, 1.0);
        assert_eq!(candle.volume, 16.0);
    }
}
