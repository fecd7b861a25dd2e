//! Events flowing through the indexing pipeline

use serde::{Deserialize, Serialize};

use super::chain::{Block, ChainPoint};
use super::swap::Swap;
use crate::entities::price;

#[derive(Debug, Clone)]
pub enum IndexerEvent {
    BlockReceived(Block),
    SwapsComputed { block_slot: u64, swaps: Vec<Swap> },
    PricesCalculated { block_slot: u64, prices: Vec<price::Model> },
    Rollback(ChainPoint),
}

impl IndexerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            IndexerEvent::BlockReceived(_) => "block_received",
            IndexerEvent::SwapsComputed { .. } => "swaps_computed",
            IndexerEvent::PricesCalculated { .. } => "prices_calculated",
            IndexerEvent::Rollback(_) => "rollback",
        }
    }

    pub fn slot(&self) -> u64 {
        match self {
            IndexerEvent::BlockReceived(block) => block.slot(),
            IndexerEvent::SwapsComputed { block_slot, .. } => *block_slot,
            IndexerEvent::PricesCalculated { block_slot, .. } => *block_slot,
            IndexerEvent::Rollback(point) => point.slot,
        }
    }
}

/// Outbound price notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEvent {
    pub asset_id: i64,
    pub quote_asset_id: i64,
    pub provider: i32,
    pub time: i64,
    pub tx_id: i64,
    pub tx_swap_idx: i32,
    pub price: f32,
    pub amount1: String,
    pub amount2: String,
    pub operation: i32,
}

impl From<&price::Model> for PriceEvent {
    fn from(p: &price::Model) -> Self {
        Self {
            asset_id: p.asset_id,
            quote_asset_id: p.quote_asset_id,
            provider: p.provider,
            time: p.time,
            tx_id: p.tx_id,
            tx_swap_idx: p.tx_swap_idx,
            price: p.price,
            amount1: p.amount1.to_string(),
            amount2: p.amount2.to_string(),
            operation: p.operation,
        }
    }
}
