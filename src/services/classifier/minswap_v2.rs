//! Minswap V2
//!
//! Pool datum: `Constr [stake_credential, asset_a, asset_b, total_liquidity,
//! reserve_a, reserve_b, base_fee_a, base_fee_b, ...]`.
//! Order datum: `Constr [canceller, refund_receiver, refund_datum, success_receiver,
//! success_datum, lp_asset, step, max_batcher_fee, expiry]`. Step `0` is
//! `SwapExactIn { a_to_b_direction, amount, minimum_receive, killable }`.
//! Zap-in deposits are liquidity provision and are not read as swaps.

use crate::models::swap::{Dex, QualifiedTransaction, Swap, SwapOperation};
use crate::services::datum::{DatumError, PlutusData};

use super::{
    DexClassifier, OrderIntent, OrderOverhead, PoolPair, Receiver, pool_datum, settle_orders,
};

pub const POOL_SCRIPT_HASHES: [&str; 1] = ["ea07b733d932129c378af627436e7cbc2ef0bf96e0036bb51b3bde6b"];

pub const ORDER_SCRIPT_HASH: &str = "c3e28c36c3447315ba5a56f33da6a6ddc1770a876a8d9f0cb3a97c4c";

const ASSET_A_FIELD: usize = 1;
const ASSET_B_FIELD: usize = 2;
const RECEIVER_FIELD: usize = 1;
const STEP_FIELD: usize = 6;
const BATCHER_FEE_FIELD: usize = 7;

const SWAP_EXACT_IN: u64 = 0;

/// Plutus `True`
const A_TO_B: u64 = 1;

/// Min ADA returned with a buy payout
const BUY_PAYOUT_DEPOSIT: u64 = 2_000_000;

pub struct MinswapV2Classifier;

impl MinswapV2Classifier {
    fn read_order(datum: &PlutusData) -> Result<Option<OrderIntent>, DatumError> {
        let step = datum.field(STEP_FIELD)?;
        if step.constructor()? != SWAP_EXACT_IN {
            return Ok(None);
        }
        let operation = if step.field(0)?.constructor()? == A_TO_B {
            SwapOperation::Sell
        } else {
            SwapOperation::Buy
        };
        let fee = u64::try_from(datum.field(BATCHER_FEE_FIELD)?.as_int()?)
            .map_err(|_| DatumError::Shape("negative batcher fee".to_string()))?;
        Ok(Some(OrderIntent {
            receiver: Receiver::from_address(datum.field(RECEIVER_FIELD)?)?,
            operation,
            overhead: OrderOverhead {
                sell: fee,
                buy: BUY_PAYOUT_DEPOSIT,
                sell_refund_in_payout: true,
            },
        }))
    }
}

impl DexClassifier for MinswapV2Classifier {
    fn dex(&self) -> Dex {
        Dex::MinswapV2
    }

    fn pool_script_hashes(&self) -> &'static [&'static str] {
        &POOL_SCRIPT_HASHES
    }

    fn compute_swaps(&self, tx: &QualifiedTransaction) -> Vec<Swap> {
        // The spent pool carries the pair the orders were placed against
        let Some(pool) = pool_datum(self, &tx.input_utxos, tx) else {
            return vec![];
        };
        let Ok(pair) = PoolPair::from_fields(&pool, ASSET_A_FIELD, ASSET_B_FIELD) else {
            return vec![];
        };
        let orders = tx
            .input_utxos
            .iter()
            .filter(|u| u.payment_credential().as_deref() == Some(ORDER_SCRIPT_HASH));
        settle_orders(self, tx, &pair, orders, Self::read_order)
    }
}
