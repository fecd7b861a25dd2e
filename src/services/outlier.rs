//! Grubbs' test based outlier flagging of recent prices
//!
//! For each asset pair with unclassified prices in the trailing window the detector
//! anchors the sample with a few synthetic points at the recent average, so a
//! genuine market move is not mistaken for noise, and then repeatedly removes the
//! most extreme value while Grubbs' test still finds it significant. Real prices
//! removed this way are flagged, never deleted.

use parking_lot::Mutex;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::sync::Arc;
use tracing::{debug, info};

use crate::entities::price::{self, PriceKey};
use crate::error::StoreError;
use crate::services::slot_time::SlotClock;
use crate::services::storage::Store;

/// Chain seconds between runs
pub const DETECTION_INTERVAL_SECS: u64 = 3600;

/// Trailing window scanned per run
pub const DETECTION_WINDOW_SECS: i64 = 24 * 3600;

/// Minimum real points for the test to be meaningful
pub const MIN_SAMPLE_SIZE: usize = 3;

/// Synthetic points added at the anchor price
pub const ANCHOR_POINTS: usize = 3;

pub const DEFAULT_SIGNIFICANCE_LEVEL: f64 = 0.85;

/// Most extreme value of `values` if Grubbs' test rejects it at `alpha`
pub fn grubbs_outlier(values: &[f64], alpha: f64) -> Option<usize> {
    let n = values.len();
    if n < MIN_SAMPLE_SIZE {
        return None;
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
    let std_dev = variance.sqrt();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return None;
    }

    let (idx, max_dev) = values
        .iter()
        .map(|v| (v - mean).abs())
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let statistic = max_dev / std_dev;

    let t_dist = StudentsT::new(0.0, 1.0, nf - 2.0).ok()?;
    let t = t_dist.inverse_cdf((1.0 - alpha) / (2.0 * nf));
    let t2 = t * t;
    let critical = ((nf - 1.0) / nf.sqrt()) * (t2 / (nf - 2.0 + t2)).sqrt();

    (statistic > critical).then_some(idx)
}

/// Keys of the prices in `prices` that fail the anchored Grubbs' test
pub fn detect_outliers(prices: &[price::Model], anchor: f64, alpha: f64) -> Vec<PriceKey> {
    if prices.len() < MIN_SAMPLE_SIZE {
        return vec![];
    }

    // (value, real price index); synthetic points carry no index
    let mut sample: Vec<(f64, Option<usize>)> = prices
        .iter()
        .enumerate()
        .map(|(i, p)| (p.price as f64, Some(i)))
        .collect();
    sample.extend(std::iter::repeat_n((anchor, None), ANCHOR_POINTS));

    let mut flagged = Vec::new();
    loop {
        let values: Vec<f64> = sample.iter().map(|(v, _)| *v).collect();
        let Some(idx) = grubbs_outlier(&values, alpha) else {
            break;
        };
        if let (_, Some(real)) = sample.remove(idx) {
            flagged.push(prices[real].key());
        }
    }
    flagged.sort();
    flagged
}

/// Outcome of one detection run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DetectionStats {
    pub pairs_scanned: usize,
    pub pairs_skipped: usize,
    pub outliers_flagged: u64,
}

pub struct OutlierDetector {
    store: Arc<dyn Store>,
    clock: SlotClock,
    alpha: f64,
    last_run_slot: Mutex<Option<u64>>,
}

impl OutlierDetector {
    pub fn new(store: Arc<dyn Store>, clock: SlotClock) -> Self {
        Self {
            store,
            clock,
            alpha: DEFAULT_SIGNIFICANCE_LEVEL,
            last_run_slot: Mutex::new(None),
        }
    }

    /// Arms the next run once an hour of chain time has passed since the last one
    pub fn should_run(&self, slot: u64) -> bool {
        let mut last = self.last_run_slot.lock();
        match *last {
            Some(prev) if slot < prev + DETECTION_INTERVAL_SECS => false,
            _ => {
                *last = Some(slot);
                true
            }
        }
    }

    pub async fn run(&self, slot: u64) -> Result<DetectionStats, StoreError> {
        let from_time = self.clock.slot_to_time(slot) - DETECTION_WINDOW_SECS;
        let pairs = self.store.outlier_candidate_pairs(from_time).await?;
        let mut stats = DetectionStats::default();

        for (asset_id, quote_asset_id) in pairs {
            let prices = self
                .store
                .prices_for_pair(asset_id, quote_asset_id, from_time)
                .await?;
            if prices.len() < MIN_SAMPLE_SIZE {
                stats.pairs_skipped += 1;
                continue;
            }
            let Some(anchor) = self
                .store
                .average_price(asset_id, quote_asset_id, from_time)
                .await?
            else {
                stats.pairs_skipped += 1;
                continue;
            };

            stats.pairs_scanned += 1;
            let outliers = detect_outliers(&prices, anchor, self.alpha);
            if outliers.is_empty() {
                continue;
            }
            debug!(
                asset_id = asset_id,
                quote_asset_id = quote_asset_id,
                outliers = outliers.len(),
                "Flagging outlier prices"
            );
            stats.outliers_flagged += self.store.mark_outliers(&outliers).await?;
        }

        info!(
            slot = slot,
            pairs_scanned = stats.pairs_scanned,
            pairs_skipped = stats.pairs_skipped,
            outliers_flagged = stats.outliers_flagged,
            "Outlier detection completed"
        );
        Ok(stats)
    }
}
