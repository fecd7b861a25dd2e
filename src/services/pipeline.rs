//! Ordered event pipeline between chain sync and persistence
//!
//! [`EventBus`] hands events to a single [`Dispatcher`] over a channel of
//! capacity one. Every envelope carries a oneshot acknowledgement that the
//! dispatcher releases once the event and everything it led to has been
//! handled, including when handling failed. A producer that awaits the
//! acknowledgement therefore never has more than one block in flight.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::entities::price;
use crate::error::PipelineError;
use crate::models::event::{IndexerEvent, PriceEvent};
use crate::services::candle_service::CandleService;
use crate::services::latest_prices::LatestPriceBuffer;
use crate::services::monitoring::{Metrics, labels};
use crate::services::price_processor::PriceProcessor;
use crate::services::publisher::PricePublisher;
use crate::services::storage::Store;
use crate::services::swap_processor::SwapProcessor;

/// An event and the latch to release once it is handled
pub struct Envelope {
    pub event: IndexerEvent,
    ack: oneshot::Sender<()>,
}

impl Envelope {
    pub fn ack(self) {
        // The producer may have given up waiting
        let _ = self.ack.send(());
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Envelope>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Enqueues `event` and returns the acknowledgement to wait on
    pub async fn send(&self, event: IndexerEvent) -> Result<oneshot::Receiver<()>, PipelineError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Envelope { event, ack })
            .await
            .map_err(|_| PipelineError::ConsumerGone)?;
        Ok(done)
    }

    /// Enqueues `event` and waits until the dispatcher has handled it
    pub async fn publish(&self, event: IndexerEvent) -> Result<(), PipelineError> {
        self.send(event)
            .await?
            .await
            .map_err(|_| PipelineError::ConsumerGone)
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    swaps: Arc<SwapProcessor>,
    prices: Arc<PriceProcessor>,
    candles: CandleService,
    latest: Arc<LatestPriceBuffer>,
    publisher: Option<Arc<dyn PricePublisher>>,
    metrics: Arc<dyn Metrics>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        swaps: Arc<SwapProcessor>,
        prices: Arc<PriceProcessor>,
        candles: CandleService,
        latest: Arc<LatestPriceBuffer>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            store,
            swaps,
            prices,
            candles,
            latest,
            publisher: None,
            metrics,
        }
    }

    /// Broadcasts every persisted price through `publisher`
    pub fn with_publisher(mut self, publisher: Arc<dyn PricePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Consumes envelopes until cancelled or every bus handle is dropped
    pub async fn run(self, mut rx: mpsc::Receiver<Envelope>, cancel: CancellationToken) {
        info!("Event dispatcher started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => break,
                },
            }
        }
        // Release anything still queued so no producer stays blocked
        rx.close();
        while let Ok(envelope) = rx.try_recv() {
            envelope.ack();
        }
        info!("Event dispatcher stopped");
    }

    pub async fn dispatch(&self, envelope: Envelope) {
        let Envelope { event, ack } = envelope;
        let name = event.name();
        let slot = event.slot();

        if let Err(e) = self.handle(event).await {
            error!(event = name, slot = slot, error = %e, "Event processing failed");
            self.metrics.increment_counter(labels::EVENT_PROCESSING_FAILED);
        }
        let _ = ack.send(());
    }

    /// Drives one event through the block state machine to its terminal step
    pub async fn handle(&self, event: IndexerEvent) -> Result<(), PipelineError> {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            next = self.step(event).await?;
        }
        Ok(())
    }

    async fn step(&self, event: IndexerEvent) -> Result<Option<IndexerEvent>, PipelineError> {
        match event {
            IndexerEvent::BlockReceived(block) => {
                let swaps = self.swaps.process_block(&block).await?;
                self.metrics.increment_counter(labels::BLOCKS_PROCESSED);
                self.metrics.set_gauge(labels::LAST_BLOCK_SLOT, block.slot() as f64);
                debug!(
                    slot = block.slot(),
                    height = block.height,
                    txs = block.transactions.len(),
                    swaps = swaps.len(),
                    "Block classified"
                );
                Ok(Some(IndexerEvent::SwapsComputed {
                    block_slot: block.slot(),
                    swaps,
                }))
            }
            IndexerEvent::SwapsComputed { block_slot, swaps } => {
                if swaps.is_empty() {
                    return Ok(None);
                }
                self.metrics.add_to_counter(labels::SWAPS_COMPUTED, swaps.len() as u64);
                let prices = self.prices.process_swaps(&swaps, block_slot).await?;
                Ok(Some(IndexerEvent::PricesCalculated { block_slot, prices }))
            }
            IndexerEvent::PricesCalculated { block_slot, prices } => {
                self.persist(block_slot, prices).await?;
                Ok(None)
            }
            IndexerEvent::Rollback(point) => {
                // Everything before the rollback is handled once this is reached
                info!(point = %point, "Rollback reached the pipeline");
                self.metrics.increment_counter(labels::ROLLBACKS);
                Ok(None)
            }
        }
    }

    async fn persist(&self, block_slot: u64, prices: Vec<price::Model>) -> Result<(), PipelineError> {
        if prices.is_empty() {
            return Ok(());
        }

        let keys: Vec<price::PriceKey> = prices.iter().map(|p| p.key()).collect();
        let existing = self.store.existing_price_keys(&keys).await?;
        self.store.upsert_prices(&prices).await?;
        self.metrics.add_to_counter(labels::PRICES_PERSISTED, prices.len() as u64);

        // Replayed prices are already folded into their candles
        let fresh: Vec<price::Model> = prices
            .iter()
            .filter(|p| !existing.contains(&p.key()))
            .cloned()
            .collect();
        let candles = self.candles.apply_prices(&fresh).await?;
        self.latest.record_prices(&prices);

        debug!(
            slot = block_slot,
            prices = prices.len(),
            replayed = prices.len() - fresh.len(),
            candles = candles,
            "Prices persisted"
        );

        if let Some(publisher) = &self.publisher {
            for p in &prices {
                if let Err(e) = publisher.publish(&PriceEvent::from(p)).await {
                    warn!(error = %e, tx_id = p.tx_id, "Failed to publish price");
                    self.metrics.increment_counter(labels::PRICE_PUBLISH_FAILED);
                }
            }
        }
        Ok(())
    }
}
