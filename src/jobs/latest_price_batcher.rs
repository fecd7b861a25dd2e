//! Latest Price Batcher Job
//!
//! Folds the buffered latest price signals into the asset rows on a fixed
//! interval. Consecutive failures are tolerated up to a limit, after which the
//! job ends with an error the process treats as fatal.

use std::env;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::BatcherError;
use crate::services::latest_prices::LatestPriceService;

/// Default flush interval in seconds
const DEFAULT_INTERVAL_SECS: u64 = 15;

/// Consecutive failures before the job gives up
const MAX_ERRORS: u32 = 10;

/// Pause after a failed flush
const ERROR_PAUSE_SECS: u64 = 15;

const ENV_INTERVAL: &str = "LATEST_PRICES_INTERVAL_SECS";

/// Start the latest price batcher job
///
/// # Environment Variables
///
/// * `LATEST_PRICES_INTERVAL_SECS` - Flush interval in seconds (default: 15)
pub async fn start_latest_price_batcher_job(
    service: Arc<LatestPriceService>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), BatcherError>> {
    let interval_secs: u64 = env::var(ENV_INTERVAL)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS);

    tokio::spawn(async move {
        info!(interval_secs = interval_secs, "Latest price batcher job started");

        let mut ticker = interval(Duration::from_secs(interval_secs));
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match service.flush().await {
                        Ok(_) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            if failures >= MAX_ERRORS {
                                error!(failures = failures, error = %e, "Latest price batcher giving up");
                                return Err(BatcherError::TooManyFailures {
                                    failures,
                                    last: e.to_string(),
                                });
                            }
                            warn!(failures = failures, error = %e, "Latest price flush failed, pausing");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = sleep(Duration::from_secs(ERROR_PAUSE_SECS)) => {}
                            }
                        }
                    }
                }
            }
        }

        // Last flush so buffered prices are not lost on shutdown
        if let Err(e) = service.flush().await {
            warn!(error = %e, "Final latest price flush failed");
        }
        info!("Latest price batcher job stopped");
        Ok(())
    })
}
