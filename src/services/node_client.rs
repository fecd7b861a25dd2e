//! Seams between the chain sync controller and the node protocol client

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::NodeError;
use crate::models::chain::{Block, ChainPoint};

/// Receives what the node delivers. Calls happen one at a time and the client
/// does not request the next block before `on_block` returns.
#[async_trait]
pub trait BlockListener: Send + Sync {
    async fn on_block(&self, block: Block);

    async fn on_rollback(&self, point: ChainPoint);

    /// The requested start point is not on the node's chain
    async fn on_intersect_not_found(&self, tip: ChainPoint);
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Checks that the node is reachable
    async fn connect(&self) -> Result<(), NodeError>;

    /// Delivers blocks from `from` to `listener` until stopped or the session fails.
    /// Returns `Ok(())` when stopped.
    async fn start_block_delivery(
        &self,
        from: ChainPoint,
        listener: Arc<dyn BlockListener>,
    ) -> Result<(), NodeError>;

    async fn send_keep_alive(&self, nonce: u32) -> Result<(), NodeError>;

    /// Ends the current delivery session, if any
    async fn stop(&self);
}
