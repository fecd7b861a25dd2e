//! WingRiders pools
//!
//! Pool datum: `Constr [request_hash, Constr [Constr [asset_a, asset_b], ...]]`.
//! Pool datums are referenced by hash, the preimage rides in the witness set.
//!
//! The pool's spend redeemer lists the input indexes of the requests it applies,
//! in the order their payouts follow the pool output. Request datum:
//! `Constr [metadata, action]` where action `0` is `Swap { direction, minimum }`
//! and direction `0` pays asset A in.

use tracing::debug;

use crate::models::chain::RedeemerPurpose;
use crate::models::swap::{Dex, QualifiedTransaction, Swap, SwapOperation};
use crate::services::datum::{self, DatumError, PlutusData};

use super::{
    DexClassifier, OrderFill, OrderOverhead, PoolPair, decode_datum, is_pool_utxo, swap_from_fill,
};

pub const POOL_SCRIPT_HASH: &str = "e6c90a5923713af5786963dee0fdffd830ca7e0c86a041d9e5833e91";

const PAIR_PATH: [usize; 2] = [1, 0];
const REQUEST_INDEXES_FIELD: usize = 2;
const ACTION_FIELD: usize = 1;
const SWAP_ACTION: u64 = 0;
const A_TO_B: u64 = 0;

/// 2 ADA agent fee and 2 ADA deposit in, the deposit back out
const OVERHEAD: OrderOverhead = OrderOverhead {
    sell: 4_000_000,
    buy: 2_000_000,
    sell_refund_in_payout: false,
};

pub struct WingridersClassifier;

impl WingridersClassifier {
    /// Input indexes of the requests applied by the pool spent at `pool_index`
    fn request_indexes(
        tx: &QualifiedTransaction,
        pool_index: usize,
    ) -> Result<Vec<usize>, DatumError> {
        let redeemer = tx
            .redeemers
            .iter()
            .find(|r| r.purpose == RedeemerPurpose::Spend && r.index as usize == pool_index)
            .ok_or_else(|| DatumError::Shape(format!("no spend redeemer for input {pool_index}")))?;
        datum::decode_hex(&redeemer.data)?
            .field(REQUEST_INDEXES_FIELD)?
            .as_list()?
            .iter()
            .map(|i| {
                let i = i.as_int()?;
                usize::try_from(i).map_err(|_| DatumError::Shape(format!("bad input index {i}")))
            })
            .collect()
    }

    fn read_operation(datum: &PlutusData) -> Result<Option<SwapOperation>, DatumError> {
        let action = datum.field(ACTION_FIELD)?;
        if action.constructor()? != SWAP_ACTION {
            return Ok(None);
        }
        Ok(Some(if action.field(0)?.constructor()? == A_TO_B {
            SwapOperation::Sell
        } else {
            SwapOperation::Buy
        }))
    }
}

impl DexClassifier for WingridersClassifier {
    fn dex(&self) -> Dex {
        Dex::Wingriders
    }

    fn pool_script_hashes(&self) -> &'static [&'static str] {
        &[POOL_SCRIPT_HASH]
    }

    fn compute_swaps(&self, tx: &QualifiedTransaction) -> Vec<Swap> {
        let Some(pool_index) = tx.input_utxos.iter().position(|u| is_pool_utxo(self, u)) else {
            return vec![];
        };
        let Some(pool) = decode_datum(self, &tx.input_utxos[pool_index], tx) else {
            return vec![];
        };
        let pair = match pool.at(&PAIR_PATH).and_then(|p| PoolPair::from_fields(p, 0, 1)) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(tx = %tx.tx_hash, error = %e, "Unexpected WingRiders pool datum");
                return vec![];
            }
        };
        let indexes = match Self::request_indexes(tx, pool_index) {
            Ok(indexes) => indexes,
            Err(e) => {
                debug!(tx = %tx.tx_hash, error = %e, "Unreadable WingRiders pool redeemer");
                return vec![];
            }
        };

        // Output 0 is the pool itself, payouts follow in request order
        let mut swaps = Vec::new();
        for (payout, index) in tx.output_utxos.iter().skip(1).zip(indexes) {
            let Some(order) = tx.input_utxos.get(index) else {
                continue;
            };
            let Some(order_datum) = decode_datum(self, order, tx) else {
                continue;
            };
            let operation = match Self::read_operation(&order_datum) {
                Ok(Some(op)) => op,
                Ok(None) => continue,
                Err(e) => {
                    debug!(
                        tx = %tx.tx_hash,
                        order = %order.reference(),
                        error = %e,
                        "Skipping request with unexpected datum"
                    );
                    continue;
                }
            };
            let fill = OrderFill {
                order,
                payout,
                operation,
            };
            if let Some(swap) = swap_from_fill(self.dex(), tx, &pair, &fill, OVERHEAD) {
                swaps.push(swap);
            }
        }
        swaps
    }
}
