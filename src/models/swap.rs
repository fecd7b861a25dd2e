//! Swap events and the transactions they are computed from

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::chain::{Redeemer, Utxo};

/// Supported DEXes and their persisted provider codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dex {
    Wingriders,
    Sundaeswap,
    Minswap,
    MinswapV2,
}

impl Dex {
    pub fn code(&self) -> i32 {
        match self {
            Dex::Wingriders => 0,
            Dex::Sundaeswap => 1,
            Dex::Minswap => 2,
            Dex::MinswapV2 => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dex::Wingriders => "wingriders",
            Dex::Sundaeswap => "sundaeswap",
            Dex::Minswap => "minswap",
            Dex::MinswapV2 => "minswap_v2",
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Dex::Wingriders),
            1 => Some(Dex::Sundaeswap),
            2 => Some(Dex::Minswap),
            3 => Some(Dex::MinswapV2),
            _ => None,
        }
    }
}

impl fmt::Display for Dex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Direction of a swap relative to the pool's asset pair.
///
/// `Sell` means asset1 was paid into the pool and asset2 taken out,
/// `Buy` the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapOperation {
    Sell,
    Buy,
}

impl SwapOperation {
    pub fn code(&self) -> i32 {
        match self {
            SwapOperation::Sell => 0,
            SwapOperation::Buy => 1,
        }
    }
}

/// A single detected trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub tx_hash: String,
    pub slot: u64,
    pub dex: i32,
    pub asset1_unit: String,
    pub asset2_unit: String,
    pub amount1: u64,
    pub amount2: u64,
    pub operation: i32,
}

/// A transaction that pays to at least one known pool address
#[derive(Debug, Clone, PartialEq)]
pub struct QualifiedTransaction {
    pub tx_hash: String,
    pub dex_code: i32,
    /// Pool script hash that qualified the transaction
    pub dex_credential: String,
    pub block_slot: u64,
    /// Spent outputs in ledger input order
    pub input_utxos: Vec<Utxo>,
    pub output_utxos: Vec<Utxo>,
    pub witness_datums: HashMap<String, String>,
    pub redeemers: Vec<Redeemer>,
}
