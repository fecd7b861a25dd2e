//! Materialized View Refresh Job
//!
//! Refreshes each configured materialized view on a cron schedule. Every view
//! has two schedules: a tight one used once the indexer is caught up with the
//! chain and a loose one used while it is still bootstrapping.

use chrono::Utc;
use cron::Schedule;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::services::storage::Store;

/// View holding the latest 15m candle per symbol
pub const LATEST_CANDLE_VIEW: &str = "latest_candle";

/// Every minute once caught up
const DEFAULT_CRON: &str = "0 * * * * *";

/// Hourly while bootstrapping
const DEFAULT_BOOTSTRAP_CRON: &str = "0 0 * * * *";

/// Delay after a failed refresh
const ERROR_DELAY_SECS: u64 = 60;

const ENV_CRON: &str = "VIEW_REFRESH_CRON";
const ENV_BOOTSTRAP_CRON: &str = "VIEW_REFRESH_BOOTSTRAP_CRON";

#[derive(Debug, thiserror::Error)]
pub enum ViewScheduleError {
    #[error("Invalid cron expression for view {view}: {expression} ({message})")]
    InvalidCron {
        view: String,
        expression: String,
        message: String,
    },
}

/// A view and its two refresh schedules
#[derive(Debug, Clone)]
pub struct RefreshableView {
    pub name: String,
    pub schedule: Schedule,
    pub bootstrap_schedule: Schedule,
}

impl RefreshableView {
    pub fn new(name: &str, cron: &str, bootstrap_cron: &str) -> Result<Self, ViewScheduleError> {
        let parse = |expression: &str| {
            Schedule::from_str(expression).map_err(|e| ViewScheduleError::InvalidCron {
                view: name.to_string(),
                expression: expression.to_string(),
                message: e.to_string(),
            })
        };
        Ok(Self {
            name: name.to_string(),
            schedule: parse(cron)?,
            bootstrap_schedule: parse(bootstrap_cron)?,
        })
    }

    /// The `latest_candle` view with schedules from the environment
    pub fn latest_candle_from_env() -> Result<Self, ViewScheduleError> {
        let cron = env::var(ENV_CRON).unwrap_or_else(|_| DEFAULT_CRON.to_string());
        let bootstrap = env::var(ENV_BOOTSTRAP_CRON).unwrap_or_else(|_| DEFAULT_BOOTSTRAP_CRON.to_string());
        Self::new(LATEST_CANDLE_VIEW, &cron, &bootstrap)
    }

    /// Time until the next refresh under the given sync state
    pub fn next_delay(&self, caught_up: bool) -> Option<Duration> {
        let schedule = if caught_up {
            &self.schedule
        } else {
            &self.bootstrap_schedule
        };
        let next = schedule.upcoming(Utc).next()?;
        (next - Utc::now()).to_std().ok().or(Some(Duration::ZERO))
    }
}

/// Start the materialized view refresh job, one loop per view. `caught_up`
/// follows the chain sync state and picks the schedule.
pub async fn start_view_refresh_job(
    store: Arc<dyn Store>,
    views: Vec<RefreshableView>,
    caught_up: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    views
        .into_iter()
        .map(|view| {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            let mut caught_up = caught_up.clone();
            tokio::spawn(async move {
                info!(view = %view.name, "View refresh job started");
                let mut watching = true;
                loop {
                    let delay = next_refresh(&view, *caught_up.borrow_and_update());
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = caught_up.changed(), if watching => {
                            // Sync state flipped, reschedule under the other cron
                            if changed.is_err() {
                                watching = false;
                            }
                            continue;
                        }
                        _ = sleep(delay) => {}
                    }

                    let started = std::time::Instant::now();
                    match store.refresh_view(&view.name).await {
                        Ok(()) => info!(
                            view = %view.name,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Refreshed materialized view"
                        ),
                        Err(e) => {
                            error!(view = %view.name, error = %e, "Materialized view refresh failed");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = sleep(Duration::from_secs(ERROR_DELAY_SECS)) => {}
                            }
                        }
                    }
                }
                info!(view = %view.name, "View refresh job stopped");
            })
        })
        .collect()
}

fn next_refresh(view: &RefreshableView, caught_up: bool) -> Duration {
    let delay = view
        .next_delay(caught_up)
        .unwrap_or(Duration::from_secs(ERROR_DELAY_SECS));
    debug!(
        view = %view.name,
        caught_up = caught_up,
        delay_secs = delay.as_secs(),
        "Scheduled next view refresh"
    );
    delay
}
