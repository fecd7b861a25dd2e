//! DEX swap classification
//!
//! Every supported DEX implements [`DexClassifier`]. Batchers settle many user
//! orders against a pool in a single transaction, so swaps are read per order:
//! each spent order output carries a datum with the trade direction and its
//! owner, and the output paying that owner holds what the order received.

pub mod minswap;
pub mod minswap_v2;
pub mod sundaeswap;
pub mod wingriders;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::models::chain::{LOVELACE, Utxo, address_credentials};
use crate::models::swap::{Dex, QualifiedTransaction, Swap, SwapOperation};
use crate::services::datum::{self, DatumError, PlutusData};

pub trait DexClassifier: Send + Sync {
    fn dex(&self) -> Dex;

    fn dex_code(&self) -> i32 {
        self.dex().code()
    }

    fn dex_name(&self) -> &'static str {
        self.dex().name()
    }

    /// Payment credentials of this DEX's pool addresses
    fn pool_script_hashes(&self) -> &'static [&'static str];

    /// One swap per settled order, in input order
    fn compute_swaps(&self, tx: &QualifiedTransaction) -> Vec<Swap>;
}

/// Asset pair of a pool, in datum order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolPair {
    pub asset_a: String,
    pub asset_b: String,
}

impl PoolPair {
    /// Reads two asset classes from the fields of `node`
    pub fn from_fields(node: &PlutusData, a: usize, b: usize) -> Result<Self, DatumError> {
        Ok(Self {
            asset_a: node.field(a)?.as_asset_unit()?,
            asset_b: node.field(b)?.as_asset_unit()?,
        })
    }
}

/// Lovelace an order moves besides the traded amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderOverhead {
    /// Batcher fee and deposit locked in a sell order
    pub sell: u64,
    /// Deposit returned with a buy payout
    pub buy: u64,
    /// Lovelace in a sell payout is the order's own deposit coming back
    pub sell_refund_in_payout: bool,
}

/// Owner of an order as recorded in its datum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receiver {
    payment: String,
    stake: Option<String>,
}

impl Receiver {
    /// Reads a Plutus address, `Constr [credential, Maybe staking]`
    pub fn from_address(address: &PlutusData) -> Result<Self, DatumError> {
        let payment = hex::encode(address.at(&[0, 0])?.as_bytes()?);
        let staking = address.field(1)?;
        let stake = match staking.constructor()? {
            0 => Some(hex::encode(staking.at(&[0, 0, 0])?.as_bytes()?)),
            _ => None,
        };
        Ok(Self { payment, stake })
    }

    pub fn owns(&self, utxo: &Utxo) -> bool {
        match address_credentials(&utxo.address) {
            Some((payment, stake)) => {
                payment == self.payment && (self.stake.is_none() || stake == self.stake)
            }
            None => false,
        }
    }
}

/// What an order datum asks for
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub receiver: Receiver,
    pub operation: SwapOperation,
    pub overhead: OrderOverhead,
}

/// An order matched with the output that paid it out
pub struct OrderFill<'a> {
    pub order: &'a Utxo,
    pub payout: &'a Utxo,
    pub operation: SwapOperation,
}

/// Outputs not yet claimed by an order. One owner may place several orders,
/// each must claim its own payout.
pub struct Payouts<'a> {
    remaining: Vec<&'a Utxo>,
}

impl<'a> Payouts<'a> {
    pub fn new(outputs: &'a [Utxo]) -> Self {
        Self {
            remaining: outputs.iter().collect(),
        }
    }

    pub fn claim(&mut self, receiver: &Receiver) -> Option<&'a Utxo> {
        let pos = self.remaining.iter().position(|u| receiver.owns(u))?;
        Some(self.remaining.remove(pos))
    }
}

pub fn is_pool_utxo<C: DexClassifier + ?Sized>(classifier: &C, utxo: &Utxo) -> bool {
    utxo.payment_credential()
        .map(|cred| classifier.pool_script_hashes().contains(&cred.as_str()))
        .unwrap_or(false)
}

/// Datum of `utxo`, logged and dropped when it cannot be decoded
pub fn decode_datum<C: DexClassifier + ?Sized>(
    classifier: &C,
    utxo: &Utxo,
    tx: &QualifiedTransaction,
) -> Option<PlutusData> {
    match datum::decode_utxo_datum(utxo, &tx.witness_datums) {
        Ok(d) => Some(d),
        Err(e) => {
            debug!(
                dex = classifier.dex_name(),
                tx = %tx.tx_hash,
                output = %utxo.reference(),
                error = %e,
                "Skipping output with undecodable datum"
            );
            None
        }
    }
}

/// Datum of the first pool output among `utxos`
pub fn pool_datum<C: DexClassifier + ?Sized>(
    classifier: &C,
    utxos: &[Utxo],
    tx: &QualifiedTransaction,
) -> Option<PlutusData> {
    let pool = utxos.iter().find(|u| is_pool_utxo(classifier, u))?;
    decode_datum(classifier, pool, tx)
}

/// Settles every order input against the first unclaimed output owned by its
/// receiver. Orders whose datum is not a swap are skipped.
pub fn settle_orders<'a, C, F>(
    classifier: &C,
    tx: &'a QualifiedTransaction,
    pair: &PoolPair,
    orders: impl IntoIterator<Item = &'a Utxo>,
    read_order: F,
) -> Vec<Swap>
where
    C: DexClassifier + ?Sized,
    F: Fn(&PlutusData) -> Result<Option<OrderIntent>, DatumError>,
{
    let mut payouts = Payouts::new(&tx.output_utxos);
    let mut swaps = Vec::new();
    for order in orders {
        let Some(datum) = decode_datum(classifier, order, tx) else {
            continue;
        };
        let intent = match read_order(&datum) {
            Ok(Some(intent)) => intent,
            Ok(None) => {
                trace!(tx = %tx.tx_hash, order = %order.reference(), "Order is not a swap");
                continue;
            }
            Err(e) => {
                debug!(
                    dex = classifier.dex_name(),
                    tx = %tx.tx_hash,
                    order = %order.reference(),
                    error = %e,
                    "Skipping order with unexpected datum"
                );
                continue;
            }
        };
        let Some(payout) = payouts.claim(&intent.receiver) else {
            trace!(tx = %tx.tx_hash, order = %order.reference(), "No payout for order");
            continue;
        };
        let fill = OrderFill {
            order,
            payout,
            operation: intent.operation,
        };
        if let Some(swap) = swap_from_fill(classifier.dex(), tx, pair, &fill, intent.overhead) {
            swaps.push(swap);
        }
    }
    swaps
}

/// A sell pays asset1 in and receives asset2, a buy the reverse. Lovelace
/// overheads are only deducted when the side is lovelace.
pub fn swap_from_fill(
    dex: Dex,
    tx: &QualifiedTransaction,
    pair: &PoolPair,
    fill: &OrderFill,
    overhead: OrderOverhead,
) -> Option<Swap> {
    let (amount1, amount2) = match fill.operation {
        SwapOperation::Sell => {
            let mut cost = overhead.sell as i128;
            if overhead.sell_refund_in_payout {
                cost += fill.payout.quantity_of(LOVELACE) as i128;
            }
            (
                net_quantity(fill.order, &pair.asset_a, cost),
                fill.payout.quantity_of(&pair.asset_b) as i128,
            )
        }
        SwapOperation::Buy => (
            net_quantity(fill.payout, &pair.asset_a, overhead.buy as i128),
            fill.order.quantity_of(&pair.asset_b) as i128,
        ),
    };

    if amount1 <= 0 || amount2 <= 0 {
        trace!(
            tx = %tx.tx_hash,
            order = %fill.order.reference(),
            amount1 = %amount1,
            amount2 = %amount2,
            "Order settled without a positive trade"
        );
        return None;
    }

    Some(Swap {
        tx_hash: tx.tx_hash.clone(),
        slot: tx.block_slot,
        dex: dex.code(),
        asset1_unit: pair.asset_a.clone(),
        asset2_unit: pair.asset_b.clone(),
        amount1: u64::try_from(amount1).ok()?,
        amount2: u64::try_from(amount2).ok()?,
        operation: fill.operation.code(),
    })
}

fn net_quantity(utxo: &Utxo, unit: &str, lovelace_overhead: i128) -> i128 {
    let held = utxo.quantity_of(unit) as i128;
    if unit == LOVELACE {
        held - lovelace_overhead
    } else {
        held
    }
}

/// The fixed set of supported classifiers
pub fn registry() -> Vec<Arc<dyn DexClassifier>> {
    vec![
        Arc::new(wingriders::WingridersClassifier),
        Arc::new(sundaeswap::SundaeswapClassifier),
        Arc::new(minswap::MinswapClassifier),
        Arc::new(minswap_v2::MinswapV2Classifier),
    ]
}

/// Pool script hash to classifier lookup
pub fn credential_index(
    classifiers: &[Arc<dyn DexClassifier>],
) -> HashMap<String, Arc<dyn DexClassifier>> {
    classifiers
        .iter()
        .flat_map(|c| {
            c.pool_script_hashes()
                .iter()
                .map(move |hash| (hash.to_string(), Arc::clone(c)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chain::AssetAmount;

    const TOKEN: &str = "aaaa";

    fn tx() -> QualifiedTransaction {
        QualifiedTransaction {
            tx_hash: "ab".repeat(32),
            dex_code: 2,
            dex_credential: String::new(),
            block_slot: 100,
            input_utxos: vec![],
            output_utxos: vec![],
            witness_datums: HashMap::new(),
            redeemers: vec![],
        }
    }

    fn pair() -> PoolPair {
        PoolPair {
            asset_a: LOVELACE.to_string(),
            asset_b: TOKEN.to_string(),
        }
    }

    fn utxo(lovelace: u64, tokens: u64) -> Utxo {
        Utxo {
            tx_hash: "cd".repeat(32),
            output_index: 0,
            address: String::new(),
            amounts: vec![
                AssetAmount::new(LOVELACE, lovelace),
                AssetAmount::new(TOKEN, tokens),
            ],
            datum_hash: None,
            inline_datum: None,
            script_ref: None,
        }
    }

    const OVERHEAD: OrderOverhead = OrderOverhead {
        sell: 4_000_000,
        buy: 2_000_000,
        sell_refund_in_payout: false,
    };

    #[test]
    fn test_sell_pays_lovelace_in() {
        let order = utxo(14_000_000, 0);
        let payout = utxo(2_000_000, 4_900);
        let fill = OrderFill {
            order: &order,
            payout: &payout,
            operation: SwapOperation::Sell,
        };
        let swap = swap_from_fill(Dex::Minswap, &tx(), &pair(), &fill, OVERHEAD).unwrap();
        assert_eq!(swap.amount1, 10_000_000);
        assert_eq!(swap.amount2, 4_900);
        assert_eq!(swap.operation, SwapOperation::Sell.code());
        assert_eq!(swap.slot, 100);
    }

    #[test]
    fn test_buy_receives_lovelace() {
        let order = utxo(4_000_000, 4_800);
        let payout = utxo(11_500_000, 0);
        let fill = OrderFill {
            order: &order,
            payout: &payout,
            operation: SwapOperation::Buy,
        };
        let swap = swap_from_fill(Dex::Minswap, &tx(), &pair(), &fill, OVERHEAD).unwrap();
        assert_eq!(swap.amount1, 9_500_000);
        assert_eq!(swap.amount2, 4_800);
        assert_eq!(swap.operation, SwapOperation::Buy.code());
    }

    #[test]
    fn test_refunded_deposit_is_not_traded() {
        let order = utxo(13_000_000, 0);
        let payout = utxo(2_000_000, 4_900);
        let fill = OrderFill {
            order: &order,
            payout: &payout,
            operation: SwapOperation::Sell,
        };
        let overhead = OrderOverhead {
            sell: 1_000_000,
            buy: 2_000_000,
            sell_refund_in_payout: true,
        };
        let swap = swap_from_fill(Dex::MinswapV2, &tx(), &pair(), &fill, overhead).unwrap();
        assert_eq!(swap.amount1, 10_000_000);
    }

    #[test]
    fn test_orders_without_a_positive_trade_are_dropped() {
        let order = utxo(3_000_000, 0);
        let payout = utxo(2_000_000, 10);
        let fill = OrderFill {
            order: &order,
            payout: &payout,
            operation: SwapOperation::Sell,
        };
        assert!(swap_from_fill(Dex::Minswap, &tx(), &pair(), &fill, OVERHEAD).is_none());
    }

    #[test]
    fn test_token_pairs_carry_no_lovelace_overhead() {
        let pair = PoolPair {
            asset_a: "bbbb".to_string(),
            asset_b: TOKEN.to_string(),
        };
        let mut order = utxo(4_000_000, 0);
        order.amounts.push(AssetAmount::new("bbbb", 300));
        let payout = utxo(2_000_000, 90);
        let fill = OrderFill {
            order: &order,
            payout: &payout,
            operation: SwapOperation::Sell,
        };
        let swap = swap_from_fill(Dex::Sundaeswap, &tx(), &pair, &fill, OVERHEAD).unwrap();
        assert_eq!((swap.amount1, swap.amount2), (300, 90));
    }

    #[test]
    fn test_registry_covers_every_dex() {
        let classifiers = registry();
        let codes: Vec<i32> = classifiers.iter().map(|c| c.dex_code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3]);

        let index = credential_index(&classifiers);
        assert_eq!(index.len(), 5);
        assert_eq!(
            index["ea07b733d932129c378af627436e7cbc2ef0bf96e0036bb51b3bde6b"].dex(),
            Dex::MinswapV2
        );
    }
}
