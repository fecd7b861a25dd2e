//! Counters and gauges for the indexer. Best effort, never on the correctness path.
//!
//! Values are recorded through the `metrics` facade into a Prometheus recorder
//! owned by [`PrometheusMetrics`]. The scrape endpoint is optional.

use metrics::{Unit, counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::net::SocketAddr;
use tracing::{error, info};

/// Prefix of every exported metric name
const METRIC_PREFIX: &str = "prise_indexer";

pub mod labels {
    pub const BLOCKS_PROCESSED: &str = "blocks_processed";
    pub const SWAPS_COMPUTED: &str = "swaps_computed";
    pub const PRICES_PERSISTED: &str = "prices_persisted";
    pub const EVENT_PROCESSING_FAILED: &str = "event_processing_failed";
    pub const PRICE_PUBLISH_FAILED: &str = "price_publish_failed";
    pub const ROLLBACKS: &str = "rollbacks";
    pub const SYNC_RESTARTS: &str = "sync_restarts";
    pub const CHAIN_SYNC_LAG_SECONDS: &str = "chain_sync_lag_seconds";
    pub const LAST_BLOCK_SLOT: &str = "last_block_slot";
    pub const CAUGHT_UP: &str = "caught_up";
}

const COUNTERS: [(&str, &str); 7] = [
    (labels::BLOCKS_PROCESSED, "Blocks acknowledged by the pipeline"),
    (labels::SWAPS_COMPUTED, "Swaps classified from blocks"),
    (labels::PRICES_PERSISTED, "Price rows written"),
    (labels::EVENT_PROCESSING_FAILED, "Pipeline events that failed"),
    (labels::PRICE_PUBLISH_FAILED, "Price events that could not be published"),
    (labels::ROLLBACKS, "Rollbacks applied to the store"),
    (labels::SYNC_RESTARTS, "Block delivery restarts"),
];

pub trait Metrics: Send + Sync {
    fn increment_counter(&self, label: &str) {
        self.add_to_counter(label, 1);
    }

    fn add_to_counter(&self, label: &str, value: u64);

    fn set_gauge(&self, label: &str, value: f64);
}

fn metric_name(label: &str) -> String {
    format!("{}_{}", METRIC_PREFIX, label)
}

/// Metrics backed by a Prometheus recorder
pub struct PrometheusMetrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusMetrics {
    /// Recorder without a scrape endpoint
    pub fn new() -> Self {
        Self::with_recorder(PrometheusBuilder::new().build_recorder())
    }

    /// Recorder plus an HTTP scrape endpoint on `addr`. Must be called inside
    /// the runtime, the exporter runs as a task on it.
    pub fn serve(addr: SocketAddr) -> Result<Self, BuildError> {
        let (recorder, exporter) = PrometheusBuilder::new().with_http_listener(addr).build()?;
        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                error!(error = ?e, "Metrics exporter stopped");
            }
        });
        info!(addr = %addr, "Serving metrics");
        Ok(Self::with_recorder(recorder))
    }

    fn with_recorder(recorder: PrometheusRecorder) -> Self {
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            for (label, help) in COUNTERS {
                describe_counter!(metric_name(label), help);
            }
            describe_gauge!(
                metric_name(labels::CHAIN_SYNC_LAG_SECONDS),
                Unit::Seconds,
                "Age of the last delivered block"
            );
            describe_gauge!(metric_name(labels::LAST_BLOCK_SLOT), "Slot of the last processed block");
            describe_gauge!(metric_name(labels::CAUGHT_UP), "1 while the sync is caught up");
        });
        Self { recorder, handle }
    }

    /// Prometheus text exposition of the current values
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Current value of a counter, 0 if never touched
    pub fn counter(&self, label: &str) -> u64 {
        self.sample(label).map(|v| v as u64).unwrap_or(0)
    }

    pub fn gauge(&self, label: &str) -> Option<f64> {
        self.sample(label)
    }

    fn sample(&self, label: &str) -> Option<f64> {
        let name = metric_name(label);
        self.render()
            .lines()
            .filter(|line| !line.starts_with('#'))
            .find_map(|line| {
                let (metric, value) = line.split_once(' ')?;
                (metric == name).then(|| value.trim().parse().ok()).flatten()
            })
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics for PrometheusMetrics {
    fn add_to_counter(&self, label: &str, value: u64) {
        metrics::with_local_recorder(&self.recorder, || {
            counter!(metric_name(label)).increment(value);
        });
    }

    fn set_gauge(&self, label: &str, value: f64) {
        metrics::with_local_recorder(&self.recorder, || {
            gauge!(metric_name(label)).set(value);
        });
    }
}
