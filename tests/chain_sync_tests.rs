mod common;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use prise_indexer::config::SyncSettings;
use prise_indexer::error::SyncError;
use prise_indexer::models::candle::{Candle, Resolution};
use prise_indexer::models::chain::ChainPoint;
use prise_indexer::models::event::IndexerEvent;
use prise_indexer::services::chain_sync::ChainSyncController;
use prise_indexer::services::monitoring::{PrometheusMetrics, labels};
use prise_indexer::services::pipeline::{Envelope, EventBus};
use prise_indexer::services::slot_time::{MAINNET_SLOT_TIME_OFFSET, SlotClock};
use prise_indexer::services::storage::{MemoryStore, Store};

use crate::common::*;

/// 15m aligned
const SYNC_POINT_TIME: i64 = 1_699_999_200;

fn slot_at(time: i64) -> u64 {
    (time - MAINNET_SLOT_TIME_OFFSET) as u64
}

fn nearest_block(slot: u64) -> ChainPoint {
    ChainPoint::new(slot, format!("block-{}", slot))
}

fn handshake() -> NodeStep {
    NodeStep::RollBackward(ChainPoint::new(0, ""))
}

fn settings() -> SyncSettings {
    SyncSettings {
        connect_backoff: Duration::from_millis(1),
        shutdown_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

struct Harness {
    controller: Arc<ChainSyncController>,
    node: Arc<ScriptedNode>,
    chain_db: Arc<MockChainDb>,
    pipeline_metrics: Arc<PrometheusMetrics>,
    sync_metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl Harness {
    fn new(node: ScriptedNode, chain_db: MockChainDb, store: Arc<MemoryStore>, start_time: Option<i64>) -> Self {
        Self::with_settings(node, chain_db, store, start_time, settings())
    }

    fn with_settings(
        node: ScriptedNode,
        chain_db: MockChainDb,
        store: Arc<MemoryStore>,
        start_time: Option<i64>,
        settings: SyncSettings,
    ) -> Self {
        let node = Arc::new(node);
        let chain_db = Arc::new(chain_db);
        let pipeline = test_pipeline(
            store.clone(),
            chain_db.clone(),
            Arc::new(MockMetadata::default()),
        );
        let pipeline_metrics = pipeline.metrics.clone();
        let (bus, events) = EventBus::channel();
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(pipeline.dispatcher.run(events, cancel.clone()));

        let sync_metrics = Arc::new(PrometheusMetrics::new());
        let controller = Arc::new(ChainSyncController::new(
            node.clone(),
            chain_db.clone(),
            store,
            bus,
            SlotClock::mainnet(),
            settings,
            start_time,
            sync_metrics.clone(),
        ));
        Self {
            controller,
            node,
            chain_db,
            pipeline_metrics,
            sync_metrics,
            cancel,
            dispatcher,
        }
    }

    fn start(&self) -> (JoinHandle<Result<(), SyncError>>, watch::Receiver<u64>) {
        let (progress_tx, progress_rx) = watch::channel(0u64);
        let controller = self.controller.clone();
        let handle = tokio::spawn(async move { controller.start_sync(progress_tx).await });
        (handle, progress_rx)
    }

    async fn shutdown(self, sync: JoinHandle<Result<(), SyncError>>) -> Result<(), SyncError> {
        self.controller.stop_sync().await;
        let result = tokio::time::timeout(Duration::from_secs(5), sync)
            .await
            .expect("sync should stop")
            .unwrap();
        self.cancel.cancel();
        self.dispatcher.await.unwrap();
        result
    }
}

async fn wait_for_slot(progress: &mut watch::Receiver<u64>, slot: u64) {
    tokio::time::timeout(Duration::from_secs(5), progress.wait_for(|s| *s == slot))
        .await
        .expect("slot should be acknowledged")
        .unwrap();
}

async fn store_with_sync_point(time: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_candles(
            Resolution::FifteenMinutes,
            &[Candle::opened_at("2:1".to_string(), time, 1.0, 1.0)],
        )
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_blocks_flow_until_stopped() {
    let start_time = SYNC_POINT_TIME + 100;
    let first_slot = slot_at(SYNC_POINT_TIME);
    let node = ScriptedNode::new(vec![vec![
        handshake(),
        NodeStep::RollForward(block(first_slot + 20, 100, vec![])),
        NodeStep::RollForward(block(first_slot + 40, 101, vec![])),
    ]]);
    let harness = Harness::new(node, MockChainDb::new(), Arc::new(MemoryStore::new()), Some(start_time));
    let (sync, mut progress) = harness.start();

    wait_for_slot(&mut progress, first_slot + 40).await;

    // Start time is aligned down to its 15m bucket
    assert_eq!(harness.node.starts(), vec![nearest_block(first_slot)]);
    assert_eq!(harness.chain_db.nearest_requests(), vec![first_slot]);
    let status = harness.controller.status();
    assert!(status.is_initialised());
    assert_eq!(status.last_block_slot(), Some(first_slot + 40));
    assert_eq!(harness.pipeline_metrics.counter(labels::BLOCKS_PROCESSED), 2);
    assert_eq!(harness.sync_metrics.counter(labels::SYNC_RESTARTS), 0);

    let controller = harness.controller.clone();
    assert!(harness.shutdown(sync).await.is_ok());
    // Stopping twice is harmless
    controller.stop_sync().await;
}

#[tokio::test]
async fn test_rollback_restarts_from_the_earlier_time() {
    let store = store_with_sync_point(SYNC_POINT_TIME).await;
    let first_slot = slot_at(SYNC_POINT_TIME);

    // Rollback target two hours before the sync point, mid bucket
    let rollback_time = SYNC_POINT_TIME - 7_200 + 137;
    let restart_slot = slot_at(SYNC_POINT_TIME - 7_200);

    let node = ScriptedNode::new(vec![
        vec![
            handshake(),
            NodeStep::RollForward(block(first_slot + 20, 100, vec![])),
            NodeStep::RollBackward(ChainPoint::new(slot_at(rollback_time), "aa".repeat(32))),
            NodeStep::RollForward(block(first_slot + 40, 101, vec![])),
        ],
        vec![handshake(), NodeStep::RollForward(block(restart_slot + 5, 90, vec![]))],
    ]);
    let harness = Harness::new(node, MockChainDb::new(), store, None);
    let (sync, mut progress) = harness.start();

    wait_for_slot(&mut progress, restart_slot + 5).await;

    assert_eq!(
        harness.node.starts(),
        vec![nearest_block(first_slot), nearest_block(restart_slot)]
    );
    assert_eq!(harness.chain_db.nearest_requests(), vec![first_slot, restart_slot]);
    assert_eq!(harness.pipeline_metrics.counter(labels::ROLLBACKS), 1);
    // The block after the rollback in the old session is never delivered
    assert_eq!(harness.pipeline_metrics.counter(labels::BLOCKS_PROCESSED), 2);
    assert_eq!(harness.sync_metrics.counter(labels::SYNC_RESTARTS), 1);

    assert!(harness.shutdown(sync).await.is_ok());
}

#[tokio::test]
async fn test_rollback_after_sync_point_resumes_at_sync_point() {
    let store = store_with_sync_point(SYNC_POINT_TIME).await;
    let first_slot = slot_at(SYNC_POINT_TIME);
    let node = ScriptedNode::new(vec![
        vec![
            handshake(),
            NodeStep::RollBackward(ChainPoint::new(first_slot + 5_000, "bb".repeat(32))),
        ],
        vec![handshake(), NodeStep::RollForward(block(first_slot + 60, 100, vec![]))],
    ]);
    let harness = Harness::new(node, MockChainDb::new(), store, None);
    let (sync, mut progress) = harness.start();

    wait_for_slot(&mut progress, first_slot + 60).await;
    assert_eq!(
        harness.node.starts(),
        vec![nearest_block(first_slot), nearest_block(first_slot)]
    );

    assert!(harness.shutdown(sync).await.is_ok());
}

#[tokio::test]
async fn test_intersect_not_found_restarts_from_tip_time() {
    let start_time = SYNC_POINT_TIME;
    let tip_time = SYNC_POINT_TIME - 86_400;
    let node = ScriptedNode::new(vec![
        vec![NodeStep::IntersectNotFound(ChainPoint::new(slot_at(tip_time), "cc".repeat(32)))],
        vec![handshake(), NodeStep::RollForward(block(slot_at(tip_time) + 1, 50, vec![]))],
    ]);
    let harness = Harness::new(node, MockChainDb::new(), Arc::new(MemoryStore::new()), Some(start_time));
    let (sync, mut progress) = harness.start();

    wait_for_slot(&mut progress, slot_at(tip_time) + 1).await;
    assert_eq!(
        harness.node.starts(),
        vec![nearest_block(slot_at(start_time)), nearest_block(slot_at(tip_time))]
    );

    assert!(harness.shutdown(sync).await.is_ok());
}

#[tokio::test]
async fn test_unreachable_node_fails_after_retries() {
    let node = ScriptedNode::new(vec![]).failing_connects(10);
    let harness = Harness::new(node, MockChainDb::new(), Arc::new(MemoryStore::new()), None);
    let (sync, _progress) = harness.start();

    let result = tokio::time::timeout(Duration::from_secs(5), sync)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(SyncError::Connect { attempts: 3, .. })));
    assert_eq!(harness.node.connects(), 3);
    assert!(harness.node.starts().is_empty());
}

#[tokio::test]
async fn test_missing_initialisation_block_is_fatal() {
    let node = ScriptedNode::new(vec![]);
    let harness = Harness::new(
        node,
        MockChainDb::new().without_blocks(),
        Arc::new(MemoryStore::new()),
        Some(SYNC_POINT_TIME),
    );
    let (sync, _progress) = harness.start();

    let result = tokio::time::timeout(Duration::from_secs(5), sync)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(SyncError::NoInitialisationPoint(slot)) => assert_eq!(slot, slot_at(SYNC_POINT_TIME)),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

async fn sync_outcome(sync: JoinHandle<Result<(), SyncError>>) -> Result<(), SyncError> {
    tokio::time::timeout(Duration::from_secs(5), sync)
        .await
        .expect("sync should end on its own")
        .unwrap()
}

#[tokio::test]
async fn test_failing_keep_alives_are_fatal() {
    let node = ScriptedNode::new(vec![vec![handshake()]]).failing_keep_alives();
    let settings = SyncSettings {
        keep_alive_interval: Duration::from_millis(10),
        ..settings()
    };
    let harness = Harness::with_settings(
        node,
        MockChainDb::new(),
        Arc::new(MemoryStore::new()),
        Some(SYNC_POINT_TIME),
        settings,
    );
    let (sync, _progress) = harness.start();

    let result = sync_outcome(sync).await;
    assert!(matches!(result, Err(SyncError::KeepAlive(5))), "{:?}", result);
    assert_eq!(harness.node.keep_alives(), 5);
    assert_eq!(harness.sync_metrics.counter(labels::SYNC_RESTARTS), 0);
}

#[tokio::test]
async fn test_stalled_delivery_restarts_then_gives_up() {
    // Every session goes quiet after the handshake
    let node = ScriptedNode::new(vec![vec![handshake()], vec![handshake()], vec![handshake()]]);
    let settings = SyncSettings {
        monitor_interval: Duration::from_millis(10),
        inactivity_timeout: Duration::from_millis(60),
        max_restarts: 2,
        ..settings()
    };
    let harness = Harness::with_settings(
        node,
        MockChainDb::new(),
        Arc::new(MemoryStore::new()),
        Some(SYNC_POINT_TIME),
        settings,
    );
    let (sync, _progress) = harness.start();

    let result = sync_outcome(sync).await;
    assert!(matches!(result, Err(SyncError::Stalled(2))), "{:?}", result);
    assert_eq!(harness.sync_metrics.counter(labels::SYNC_RESTARTS), 2);
    let start = nearest_block(slot_at(SYNC_POINT_TIME));
    assert_eq!(harness.node.starts(), vec![start.clone(), start.clone(), start]);
}

#[tokio::test]
async fn test_unacknowledged_rollback_times_out_and_resumes() {
    let rollback_time = SYNC_POINT_TIME - 3_600;
    let node = Arc::new(ScriptedNode::new(vec![
        vec![
            handshake(),
            NodeStep::RollBackward(ChainPoint::new(slot_at(rollback_time), "dd".repeat(32))),
        ],
        vec![handshake()],
    ]));

    // Takes events but never acknowledges them
    let (bus, mut events) = EventBus::channel();
    let held: Arc<Mutex<Vec<Envelope>>> = Arc::default();
    let consumer = {
        let held = held.clone();
        tokio::spawn(async move {
            while let Some(envelope) = events.recv().await {
                held.lock().push(envelope);
            }
        })
    };

    let ack_timeout = Duration::from_millis(150);
    let controller = Arc::new(ChainSyncController::new(
        node.clone(),
        Arc::new(MockChainDb::new()),
        Arc::new(MemoryStore::new()),
        bus,
        SlotClock::mainnet(),
        SyncSettings {
            rollback_ack_timeout: ack_timeout,
            ..settings()
        },
        Some(SYNC_POINT_TIME),
        Arc::new(PrometheusMetrics::new()),
    ));
    let started = Instant::now();
    let (progress_tx, _progress) = watch::channel(0u64);
    let sync = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start_sync(progress_tx).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while node.starts().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("delivery should resume after the timeout");

    assert!(started.elapsed() >= ack_timeout);
    assert_eq!(
        node.starts(),
        vec![
            nearest_block(slot_at(SYNC_POINT_TIME)),
            nearest_block(slot_at(rollback_time))
        ]
    );
    {
        let held = held.lock();
        assert_eq!(held.len(), 1);
        assert!(matches!(&held[0].event, IndexerEvent::Rollback(p) if p.slot == slot_at(rollback_time)));
    }

    controller.stop_sync().await;
    assert!(sync_outcome(sync).await.is_ok());
    consumer.abort();
}
