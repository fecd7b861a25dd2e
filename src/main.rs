use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prise_indexer::config::{ChainDbProvider, IndexerConfig, RunMode};
use prise_indexer::jobs::latest_price_batcher::start_latest_price_batcher_job;
use prise_indexer::jobs::outlier_detection_job::{outlier_detection_enabled, start_outlier_detection_job};
use prise_indexer::jobs::view_refresh_job::{RefreshableView, start_view_refresh_job};
use prise_indexer::services::candle_service::CandleService;
use prise_indexer::error::ChainDbError;
use prise_indexer::services::chain_db::{BlockfrostClient, ChainDatabase, KoiosClient, YaciStoreClient};
use prise_indexer::services::chain_sync::{ChainSyncController, ONESHOT_SYNC_GAP, wait_until_synced};
use prise_indexer::services::classifier;
use prise_indexer::services::latest_prices::{LatestPriceBuffer, LatestPriceService};
use prise_indexer::services::monitoring::PrometheusMetrics;
use prise_indexer::services::ogmios::OgmiosClient;
use prise_indexer::services::outlier::OutlierDetector;
use prise_indexer::services::pipeline::{Dispatcher, EventBus};
use prise_indexer::services::price_processor::PriceProcessor;
use prise_indexer::services::publisher::RedisPricePublisher;
use prise_indexer::services::slot_time::SlotClock;
use prise_indexer::services::storage::{SeaOrmStore, Store};
use prise_indexer::services::swap_processor::SwapProcessor;
use prise_indexer::services::token_metadata::TokenRegistryClient;

/// Time given to each task to drain after shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prise_indexer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match IndexerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            process::exit(1);
        }
    };

    // Connect to database
    info!("Connecting to database...");
    let db = Database::connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    info!("Running migrations...");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let store: Arc<dyn Store> = Arc::new(SeaOrmStore::new(db));
    let clock = SlotClock::mainnet_with_tz_offset(config.candle_tz_offset_secs);
    let metrics = match config.metrics_addr {
        Some(addr) => match PrometheusMetrics::serve(addr) {
            Ok(metrics) => Arc::new(metrics),
            Err(e) => {
                error!(addr = %addr, error = %e, "Could not start the metrics server");
                process::exit(1);
            }
        },
        None => Arc::new(PrometheusMetrics::new()),
    };
    let chain_db = match build_chain_db(&config) {
        Ok(chain_db) => chain_db,
        Err(e) => {
            error!(provider = ?config.chain_db_provider, error = %e, "Failed to build chain database client");
            process::exit(1);
        }
    };
    info!(provider = ?config.chain_db_provider, run_mode = ?config.run_mode, "Chain database selected");
    let metadata = Arc::new(
        TokenRegistryClient::new(&config.token_registry_url).expect("Failed to build token registry client"),
    );
    let views = match RefreshableView::latest_candle_from_env() {
        Ok(view) => vec![view],
        Err(e) => {
            error!(error = %e, "Invalid view refresh schedule");
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    // Pipeline
    let price_processor = Arc::new(PriceProcessor::new(store.clone(), metadata.clone(), clock));
    let swap_processor = Arc::new(SwapProcessor::new(classifier::registry(), chain_db.clone()));
    let buffer = Arc::new(LatestPriceBuffer::new());
    let (bus, events) = EventBus::channel();
    let mut dispatcher = Dispatcher::new(
        store.clone(),
        swap_processor,
        price_processor.clone(),
        CandleService::new(store.clone(), clock),
        buffer.clone(),
        metrics.clone(),
    );
    if config.event_publishing_enabled {
        match RedisPricePublisher::connect(&config.redis_url, config.price_channel.clone()).await {
            Ok(publisher) => {
                info!(channel = publisher.channel(), "Price event publishing enabled");
                dispatcher = dispatcher.with_publisher(Arc::new(publisher));
            }
            Err(e) => {
                error!(error = %e, "Could not connect the price publisher");
                process::exit(1);
            }
        }
    }
    let dispatcher_task = tokio::spawn(dispatcher.run(events, shutdown.clone()));

    // Chain sync
    let (progress_tx, progress_rx) = watch::channel(0u64);
    let controller = Arc::new(ChainSyncController::new(
        Arc::new(OgmiosClient::new(&config.node_ws_url)),
        chain_db,
        store.clone(),
        bus,
        clock,
        config.sync.clone(),
        config.start_time,
        metrics,
    ));

    // Background jobs
    let latest_prices = Arc::new(LatestPriceService::new(
        store.clone(),
        metadata,
        price_processor,
        buffer,
    ));
    let mut batcher = start_latest_price_batcher_job(latest_prices, shutdown.clone()).await;
    let _view_jobs = start_view_refresh_job(
        store.clone(),
        views,
        controller.status().subscribe_caught_up(),
        shutdown.clone(),
    )
    .await;
    if outlier_detection_enabled() {
        let detector = Arc::new(OutlierDetector::new(store.clone(), clock));
        start_outlier_detection_job(detector, progress_rx.clone(), shutdown.clone()).await;
    }
    let mut sync = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start_sync(progress_tx).await })
    };

    let (exit_code, sync_done, batcher_done) = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping indexer gracefully");
            (0, false, false)
        }
        result = &mut sync => match result {
            Ok(Ok(())) => (0, true, false),
            Ok(Err(e)) => {
                error!(error = %e, "Chain sync failed");
                (1, true, false)
            }
            Err(e) => {
                error!(error = %e, "Chain sync task panicked");
                (1, true, false)
            }
        },
        true = wait_until_synced(progress_rx, clock, ONESHOT_SYNC_GAP), if config.run_mode == RunMode::Oneshot => {
            info!("Oneshot sync reached the tip, stopping indexer");
            (0, false, false)
        }
        result = &mut batcher => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Latest price batcher failed"),
                Ok(Ok(())) => error!("Latest price batcher stopped unexpectedly"),
                Err(e) => error!(error = %e, "Latest price batcher panicked"),
            }
            (1, false, true)
        }
    };

    controller.stop_sync().await;
    shutdown.cancel();
    if !sync_done && tokio::time::timeout(SHUTDOWN_GRACE, sync).await.is_err() {
        warn!("Chain sync did not stop in time");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, dispatcher_task).await.is_err() {
        warn!("Dispatcher did not stop in time");
    }
    // Lets the batcher write out what is still buffered
    if !batcher_done && tokio::time::timeout(SHUTDOWN_GRACE, batcher).await.is_err() {
        warn!("Latest price batcher did not stop in time");
    }

    info!(exit_code = exit_code, "Indexer stopped");
    if exit_code != 0 {
        process::exit(exit_code);
    }
}

fn build_chain_db(config: &IndexerConfig) -> Result<Arc<dyn ChainDatabase>, ChainDbError> {
    let blockfrost = || {
        BlockfrostClient::new(
            &config.blockfrost_url,
            config.blockfrost_project_id.as_deref().unwrap_or_default(),
        )
    };
    Ok(match config.chain_db_provider {
        ChainDbProvider::Koios => Arc::new(KoiosClient::new(&config.chain_db_url)?),
        ChainDbProvider::Blockfrost => Arc::new(blockfrost()?),
        ChainDbProvider::YaciStore => Arc::new(YaciStoreClient::new(
            &config.chain_db_url,
            config.yacistore_api_key.clone(),
            blockfrost()?,
        )?),
    })
}
