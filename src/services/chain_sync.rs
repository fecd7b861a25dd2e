//! Chain sync controller
//!
//! Owns the node session. Blocks delivered by the node are published on the
//! event bus one at a time and the delivery callback does not return before
//! the pipeline acknowledges them. Rollbacks stop delivery, drain through the
//! pipeline and restart delivery from a freshly computed initialisation point.
//! Two background tasks keep the session honest: a keep-alive pinger and a
//! monitor that tracks lag and restarts delivery when it stalls.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::error::{NodeError, SyncError};
use crate::models::candle::Resolution;
use crate::models::chain::{Block, ChainPoint};
use crate::models::event::IndexerEvent;
use crate::services::chain_db::ChainDatabase;
use crate::services::monitoring::{Metrics, labels};
use crate::services::node_client::{BlockListener, NodeClient};
use crate::services::pipeline::EventBus;
use crate::services::slot_time::{DEX_LAUNCH_TIME, SlotClock};
use crate::services::storage::Store;

/// Keep-alive nonces are drawn below this bound
const KEEP_ALIVE_NONCE_BOUND: u32 = 60_000;

/// Blocks between progress log lines
const PROGRESS_LOG_EVERY: u64 = 10;

/// A oneshot run is done once the last acknowledged block is this close to now
pub const ONESHOT_SYNC_GAP: Duration = Duration::from_secs(100);

/// Time to resume from: the earlier of the base time and a rollback target.
/// Without a base the DEX launch time is used.
pub fn initialisation_time(base: Option<i64>, rollback_time: Option<i64>) -> i64 {
    let base = base.unwrap_or(DEX_LAUNCH_TIME);
    match rollback_time {
        Some(rollback) => base.min(rollback),
        None => base,
    }
}

/// Resolves once an acknowledged block lies within `gap` of the wall clock.
/// Returns false if the progress sender went away first.
pub async fn wait_until_synced(mut progress: watch::Receiver<u64>, clock: SlotClock, gap: Duration) -> bool {
    loop {
        let slot = *progress.borrow_and_update();
        if slot > 0 {
            let behind = clock.now() - clock.slot_to_time(slot);
            if behind < gap.as_secs() as i64 {
                info!(slot = slot, behind_secs = behind, "Reached the chain tip");
                return true;
            }
        }
        if progress.changed().await.is_err() {
            return false;
        }
    }
}

/// Why a delivery session ended
#[derive(Debug, Clone, PartialEq)]
enum Restart {
    Rollback(ChainPoint),
    IntersectNotFound(ChainPoint),
    Stalled,
    SessionEnded,
    SessionFailed,
}

/// Live session state shared between the callback and the monitor
#[derive(Debug)]
pub struct SyncStatus {
    initialised: AtomicBool,
    caught_up: watch::Sender<bool>,
    last_block_slot: AtomicU64,
    stalled_restarts: AtomicU32,
    last_activity: Mutex<Instant>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            initialised: AtomicBool::new(false),
            caught_up: watch::channel(false).0,
            last_block_slot: AtomicU64::new(0),
            stalled_restarts: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }
}

impl SyncStatus {
    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Acquire)
    }

    pub fn is_caught_up(&self) -> bool {
        *self.caught_up.borrow()
    }

    /// Follows the caught-up state as the monitor reclassifies the session
    pub fn subscribe_caught_up(&self) -> watch::Receiver<bool> {
        self.caught_up.subscribe()
    }

    /// Returns true when the state flipped
    fn set_caught_up(&self, caught_up: bool) -> bool {
        self.caught_up.send_if_modified(|current| {
            let changed = *current != caught_up;
            *current = caught_up;
            changed
        })
    }

    pub fn last_block_slot(&self) -> Option<u64> {
        match self.last_block_slot.load(Ordering::Acquire) {
            0 => None,
            slot => Some(slot),
        }
    }

    fn record_block(&self, slot: u64) {
        self.last_block_slot.store(slot, Ordering::Release);
        self.stalled_restarts.store(0, Ordering::Release);
        self.touch();
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Node callbacks of one controller, shared across delivery sessions
struct SyncListener {
    bus: EventBus,
    client: Arc<dyn NodeClient>,
    status: Arc<SyncStatus>,
    restart_tx: mpsc::UnboundedSender<Restart>,
    progress: watch::Sender<u64>,
    rollback_ack_timeout: Duration,
    cancel: CancellationToken,
}

#[async_trait]
impl BlockListener for SyncListener {
    async fn on_block(&self, block: Block) {
        let slot = block.slot();
        let height = block.height;
        self.status.record_block(slot);

        tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.bus.publish(IndexerEvent::BlockReceived(block)) => {
                if let Err(e) = result {
                    error!(slot = slot, error = %e, "Block was not handed to the pipeline");
                    return;
                }
            }
        }

        self.progress.send_replace(slot);
        if height % PROGRESS_LOG_EVERY == 0 {
            info!(slot = slot, height = height, "Processed blocks");
        }
    }

    async fn on_rollback(&self, point: ChainPoint) {
        if !self.status.initialised.swap(true, Ordering::AcqRel) {
            info!(point = %point, "Session initialised");
            return;
        }
        if point.is_origin() {
            info!("Ignoring rollback without a point");
            return;
        }

        warn!(point = %point, "Rollback received, stopping delivery");
        self.client.stop().await;

        match self.bus.send(IndexerEvent::Rollback(point.clone())).await {
            Ok(done) => {
                if timeout(self.rollback_ack_timeout, done).await.is_err() {
                    error!(
                        point = %point,
                        timeout_secs = self.rollback_ack_timeout.as_secs(),
                        "Rollback not acknowledged in time, continuing"
                    );
                }
            }
            Err(e) => error!(point = %point, error = %e, "Rollback was not handed to the pipeline"),
        }

        let _ = self.restart_tx.send(Restart::Rollback(point));
    }

    async fn on_intersect_not_found(&self, tip: ChainPoint) {
        warn!(tip = %tip, "Start point not on the node's chain");
        self.client.stop().await;
        let _ = self.restart_tx.send(Restart::IntersectNotFound(tip));
    }
}

pub struct ChainSyncController {
    client: Arc<dyn NodeClient>,
    chain_db: Arc<dyn ChainDatabase>,
    store: Arc<dyn Store>,
    bus: EventBus,
    clock: SlotClock,
    settings: SyncSettings,
    start_time: Option<i64>,
    metrics: Arc<dyn Metrics>,
    status: Arc<SyncStatus>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl ChainSyncController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn NodeClient>,
        chain_db: Arc<dyn ChainDatabase>,
        store: Arc<dyn Store>,
        bus: EventBus,
        clock: SlotClock,
        settings: SyncSettings,
        start_time: Option<i64>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            client,
            chain_db,
            store,
            bus,
            clock,
            settings,
            start_time,
            metrics,
            status: Arc::new(SyncStatus::default()),
            cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Arc<SyncStatus> {
        Arc::clone(&self.status)
    }

    /// Runs the sync session until [`stop_sync`](Self::stop_sync) is called or a
    /// fatal condition ends it. `progress` receives the slot of every block the
    /// pipeline has acknowledged.
    pub async fn start_sync(&self, progress: watch::Sender<u64>) -> Result<(), SyncError> {
        self.connect_with_retry().await?;

        let sync_point = self.store.candle_sync_point_time().await?;
        let first_time = initialisation_time(self.start_time.or(sync_point), None);
        info!(
            start_time = ?self.start_time,
            sync_point = ?sync_point,
            initialisation_time = first_time,
            "Determined initialisation time"
        );
        let mut from = self.initialisation_point(first_time).await?;

        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn BlockListener> = Arc::new(SyncListener {
            bus: self.bus.clone(),
            client: Arc::clone(&self.client),
            status: Arc::clone(&self.status),
            restart_tx: restart_tx.clone(),
            progress,
            rollback_ack_timeout: self.settings.rollback_ack_timeout,
            cancel: self.cancel.clone(),
        });

        let tasks = vec![
            self.spawn_keep_alive(fatal_tx.clone()),
            self.spawn_monitor(restart_tx, fatal_tx),
        ];

        let outcome = loop {
            self.status.touch();
            let restart = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                Some(err) = fatal_rx.recv() => break Err(err),
                Some(restart) = restart_rx.recv() => restart,
                result = self.client.start_block_delivery(from.clone(), Arc::clone(&listener)) => {
                    match result {
                        Ok(()) => restart_rx.try_recv().unwrap_or(Restart::SessionEnded),
                        Err(e) => {
                            warn!(error = %e, "Block delivery failed");
                            Restart::SessionFailed
                        }
                    }
                }
            };
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            self.client.stop().await;
            self.status.initialised.store(false, Ordering::Release);
            self.metrics.increment_counter(labels::SYNC_RESTARTS);
            info!(reason = ?restart, "Restarting block delivery");

            if restart == Restart::SessionFailed {
                if let Err(e) = self.connect_with_retry().await {
                    break Err(e);
                }
            }
            match self.restart_point(&restart).await {
                Ok(point) => from = point,
                Err(e) => break Err(e),
            }
        };

        self.cancel.cancel();
        self.client.stop().await;
        self.join_tasks(tasks).await;
        if let Err(e) = &outcome {
            error!(error = %e, "Chain sync ended with a fatal error");
        }
        outcome
    }

    /// Idempotent. Cancels the session and its background tasks.
    pub async fn stop_sync(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping chain sync");
        self.cancel.cancel();
        self.client.stop().await;
    }

    async fn connect_with_retry(&self) -> Result<(), SyncError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error: Option<NodeError> = None;
        for attempt in 1..=attempts {
            match self.client.connect().await {
                Ok(()) => {
                    info!(attempt = attempt, "Connected to node");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt, max_attempts = attempts, error = %e, "Node connection failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        sleep(self.settings.connect_backoff).await;
                    }
                }
            }
        }
        Err(SyncError::Connect {
            attempts,
            source: last_error.unwrap_or(NodeError::NotConnected),
        })
    }

    async fn restart_point(&self, restart: &Restart) -> Result<ChainPoint, SyncError> {
        let sync_point = self.store.candle_sync_point_time().await?;
        let base = sync_point.or(self.start_time);
        let rollback_time = match restart {
            Restart::Rollback(point) | Restart::IntersectNotFound(point) if !point.is_origin() => {
                Some(self.clock.slot_to_time(point.slot))
            }
            _ => None,
        };
        let time = initialisation_time(base, rollback_time);
        debug!(sync_point = ?sync_point, rollback_time = ?rollback_time, time = time, "Re-initialising");
        self.initialisation_point(time).await
    }

    /// First block at or after the 15m bucket containing `time`
    async fn initialisation_point(&self, time: i64) -> Result<ChainPoint, SyncError> {
        let aligned = self.clock.bucket_start(Resolution::smallest(), time);
        let slot = self.clock.time_to_slot(aligned);
        let point = self
            .chain_db
            .get_block_nearest_to_slot(slot)
            .await?
            .ok_or(SyncError::NoInitialisationPoint(slot))?;
        info!(time = aligned, slot = slot, point = %point, "Initialisation point");
        Ok(point)
    }

    fn spawn_keep_alive(&self, fatal_tx: mpsc::UnboundedSender<SyncError>) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let cancel = self.cancel.clone();
        let period = self.settings.keep_alive_interval;
        let max_failures = self.settings.keep_alive_max_failures;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let nonce = rand::thread_rng().gen_range(0..KEEP_ALIVE_NONCE_BOUND);
                        match client.send_keep_alive(nonce).await {
                            Ok(()) => failures = 0,
                            Err(e) => {
                                failures += 1;
                                warn!(failures = failures, error = %e, "Keep-alive failed");
                                if failures >= max_failures {
                                    let _ = fatal_tx.send(SyncError::KeepAlive(failures));
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_monitor(
        &self,
        restart_tx: mpsc::UnboundedSender<Restart>,
        fatal_tx: mpsc::UnboundedSender<SyncError>,
    ) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let metrics = Arc::clone(&self.metrics);
        let cancel = self.cancel.clone();
        let clock = self.clock;
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let mut ticker = interval(settings.monitor_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(slot) = status.last_block_slot() {
                            let lag = (clock.now() - clock.slot_to_time(slot)).max(0);
                            let caught_up = lag < settings.caught_up_lag.as_secs() as i64;
                            if status.set_caught_up(caught_up) {
                                info!(lag_secs = lag, caught_up = caught_up, "Sync state changed");
                            }
                            metrics.set_gauge(labels::CHAIN_SYNC_LAG_SECONDS, lag as f64);
                            metrics.set_gauge(labels::CAUGHT_UP, if caught_up { 1.0 } else { 0.0 });
                        }

                        let idle = status.idle_for();
                        if idle < settings.inactivity_timeout {
                            continue;
                        }
                        let restarts = status.stalled_restarts.fetch_add(1, Ordering::AcqRel);
                        if restarts >= settings.max_restarts {
                            error!(restarts = restarts, "Block delivery keeps stalling");
                            let _ = fatal_tx.send(SyncError::Stalled(restarts));
                            break;
                        }
                        warn!(idle_secs = idle.as_secs(), restart = restarts + 1, "No blocks delivered, restarting");
                        status.touch();
                        let _ = restart_tx.send(Restart::Stalled);
                    }
                }
            }
        })
    }

    async fn join_tasks(&self, tasks: Vec<JoinHandle<()>>) {
        for mut task in tasks {
            if timeout(self.settings.shutdown_grace, &mut task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
