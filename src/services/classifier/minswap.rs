//! Minswap V1
//!
//! Pool datum: `Constr [asset_a, asset_b, total_liquidity, root_k_last, fee_sharing]`.
//! Order datum: `Constr [sender, receiver, receiver_datum_hash, step, batcher_fee, output_ada]`,
//! where step `0` is `SwapExactIn { desired_asset, minimum_receive }`.

use crate::models::swap::{Dex, QualifiedTransaction, Swap, SwapOperation};
use crate::services::datum::{DatumError, PlutusData};

use super::{
    DexClassifier, OrderIntent, OrderOverhead, PoolPair, Receiver, pool_datum, settle_orders,
};

pub const POOL_SCRIPT_HASHES: [&str; 2] = [
    "e1317b152faac13426e6a83e06ff88a4d62cce3c1634ab0a5ec13309",
    "57c8e718c201fba10a9da1748d675b54281d3b1b983c5d1687fc7317",
];

/// Batch order contract addresses
pub const ORDER_ADDRESSES: [&str; 3] = [
    "addr1wyx22z2s4kasd3w976pnjf9xdty88epjqfvgkmfnscpd0rg3z8y6v",
    "addr1wxn9efv2f6w82hagxqtn62ju4m293tqvw0uhmdl64ch8uwc0h43gt",
    "addr1zxn9efv2f6w82hagxqtn62ju4m293tqvw0uhmdl64ch8uw6j2c79gy9l76sdg0xwhd7r0c0kna0tycz4y5s6mlenh8pq6s3z70",
];

const RECEIVER_FIELD: usize = 1;
const STEP_FIELD: usize = 3;
const SWAP_EXACT_IN: u64 = 0;

/// 2 ADA batcher fee and 2 ADA deposit in, the deposit back out
const OVERHEAD: OrderOverhead = OrderOverhead {
    sell: 4_000_000,
    buy: 2_000_000,
    sell_refund_in_payout: false,
};

pub struct MinswapClassifier;

impl MinswapClassifier {
    fn read_order(datum: &PlutusData, pair: &PoolPair) -> Result<Option<OrderIntent>, DatumError> {
        let step = datum.field(STEP_FIELD)?;
        if step.constructor()? != SWAP_EXACT_IN {
            return Ok(None);
        }
        let desired = step.field(0)?.as_asset_unit()?;
        let operation = if desired == pair.asset_b {
            SwapOperation::Sell
        } else {
            SwapOperation::Buy
        };
        Ok(Some(OrderIntent {
            receiver: Receiver::from_address(datum.field(RECEIVER_FIELD)?)?,
            operation,
            overhead: OVERHEAD,
        }))
    }
}

impl DexClassifier for MinswapClassifier {
    fn dex(&self) -> Dex {
        Dex::Minswap
    }

    fn pool_script_hashes(&self) -> &'static [&'static str] {
        &POOL_SCRIPT_HASHES
    }

    fn compute_swaps(&self, tx: &QualifiedTransaction) -> Vec<Swap> {
        let Some(pool) = pool_datum(self, &tx.output_utxos, tx) else {
            return vec![];
        };
        let Ok(pair) = PoolPair::from_fields(&pool, 0, 1) else {
            return vec![];
        };
        let orders = tx
            .input_utxos
            .iter()
            .filter(|u| ORDER_ADDRESSES.contains(&u.address.as_str()));
        settle_orders(self, tx, &pair, orders, |datum| Self::read_order(datum, &pair))
    }
}
