//! SundaeSwap V1
//!
//! Pool datum: `Constr [Constr [asset_a, asset_b], pool_ident, circulating_lp, fees]`.
//! Order datum: `Constr [pool_ident, Constr [Constr [destination, datum_hash], alternate],
//! scooper_fee, action]`, where action `0` is `Swap { direction, amount, minimum }`
//! and direction `0` pays asset A in.

use crate::models::swap::{Dex, QualifiedTransaction, Swap, SwapOperation};
use crate::services::datum::{DatumError, PlutusData};

use super::{
    DexClassifier, OrderIntent, OrderOverhead, PoolPair, Receiver, pool_datum, settle_orders,
};

pub const POOL_SCRIPT_HASH: &str = "4020e7fc2de75a0729c3cc3af715b34d98381e0cdbcfa99c950bc3ac";

pub const REQUEST_SCRIPT_HASH: &str = "ba158766c1bae60e2117ee8987621441fac66a5e0fb9c7aca58cf20a";

const ACTION_FIELD: usize = 3;
const DESTINATION_PATH: [usize; 3] = [1, 0, 0];
const SWAP_ACTION: u64 = 0;
const A_TO_B: u64 = 0;

/// 2.5 ADA scooper fee and 2 ADA deposit in, the deposit back out
const OVERHEAD: OrderOverhead = OrderOverhead {
    sell: 4_500_000,
    buy: 2_000_000,
    sell_refund_in_payout: false,
};

pub struct SundaeswapClassifier;

impl SundaeswapClassifier {
    fn read_order(datum: &PlutusData) -> Result<Option<OrderIntent>, DatumError> {
        let action = datum.field(ACTION_FIELD)?;
        if action.constructor()? != SWAP_ACTION {
            return Ok(None);
        }
        let operation = if action.field(0)?.constructor()? == A_TO_B {
            SwapOperation::Sell
        } else {
            SwapOperation::Buy
        };
        Ok(Some(OrderIntent {
            receiver: Receiver::from_address(datum.at(&DESTINATION_PATH)?)?,
            operation,
            overhead: OVERHEAD,
        }))
    }
}

impl DexClassifier for SundaeswapClassifier {
    fn dex(&self) -> Dex {
        Dex::Sundaeswap
    }

    fn pool_script_hashes(&self) -> &'static [&'static str] {
        &[POOL_SCRIPT_HASH]
    }

    fn compute_swaps(&self, tx: &QualifiedTransaction) -> Vec<Swap> {
        let Some(pool) = pool_datum(self, &tx.output_utxos, tx) else {
            return vec![];
        };
        let Ok(pair) = pool.field(0).and_then(|coins| PoolPair::from_fields(coins, 0, 1)) else {
            return vec![];
        };
        let orders = tx
            .input_utxos
            .iter()
            .filter(|u| u.payment_credential().as_deref() == Some(REQUEST_SCRIPT_HASH));
        settle_orders(self, tx, &pair, orders, Self::read_order)
    }
}
