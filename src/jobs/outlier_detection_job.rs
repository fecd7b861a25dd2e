//! Outlier Detection Job
//!
//! Follows the slots the pipeline has processed and runs the outlier detector
//! whenever an hour of chain time has passed since its previous run.

use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::services::outlier::OutlierDetector;

const ENV_ENABLED: &str = "OUTLIER_DETECTION_ENABLED";

pub fn outlier_detection_enabled() -> bool {
    env::var(ENV_ENABLED)
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(true)
}

/// Start the outlier detection job
///
/// # Environment Variables
///
/// * `OUTLIER_DETECTION_ENABLED` - Set to "false" to disable (default: true)
pub async fn start_outlier_detection_job(
    detector: Arc<OutlierDetector>,
    mut slots: watch::Receiver<u64>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Outlier detection job started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = slots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let slot = *slots.borrow_and_update();
                    if slot == 0 || !detector.should_run(slot) {
                        continue;
                    }
                    if let Err(e) = detector.run(slot).await {
                        error!(slot = slot, error = %e, "Outlier detection failed");
                    }
                }
            }
        }
        info!("Outlier detection job stopped");
    })
}
