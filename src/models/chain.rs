//! Chain data as delivered by the node client and the chain database

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unit of the native asset
pub const LOVELACE: &str = "lovelace";

/// Decimals of the native asset
pub const LOVELACE_DECIMALS: i32 = 6;

/// Length of a policy id in hex characters
pub const POLICY_ID_HEX_LEN: usize = 56;

/// A position on the chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainPoint {
    pub slot: u64,
    /// Block header hash, hex
    pub hash: String,
}

impl ChainPoint {
    pub fn new(slot: u64, hash: impl Into<String>) -> Self {
        Self {
            slot,
            hash: hash.into(),
        }
    }

    /// Points at slot 0 or without a hash carry no usable position
    pub fn is_origin(&self) -> bool {
        self.slot == 0 || self.hash.is_empty()
    }
}

impl fmt::Display for ChainPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.slot, self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub unit: String,
    pub quantity: u64,
}

impl AssetAmount {
    pub fn new(unit: impl Into<String>, quantity: u64) -> Self {
        Self {
            unit: unit.into(),
            quantity,
        }
    }
}

/// Reference to a spent output.
///
/// Ordering follows the ledger's input ordering, which redeemer indexes point into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxInRef {
    pub tx_hash: String,
    pub index: u32,
}

impl TxInRef {
    pub fn new(tx_hash: impl Into<String>, index: u32) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            index,
        }
    }
}

impl fmt::Display for TxInRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.index)
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Hash of the transaction that created the output
    pub tx_hash: String,
    pub output_index: u32,
    /// Bech32 address
    pub address: String,
    pub amounts: Vec<AssetAmount>,
    pub datum_hash: Option<String>,
    /// CBOR hex of an inline datum
    pub inline_datum: Option<String>,
    pub script_ref: Option<String>,
}

impl Utxo {
    /// Total quantity of `unit` held by the output
    pub fn quantity_of(&self, unit: &str) -> u64 {
        self.amounts
            .iter()
            .filter(|a| a.unit == unit)
            .map(|a| a.quantity)
            .sum()
    }

    pub fn payment_credential(&self) -> Option<String> {
        payment_credential(&self.address)
    }

    pub fn reference(&self) -> TxInRef {
        TxInRef::new(self.tx_hash.clone(), self.output_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemerPurpose {
    Spend,
    Mint,
    Other,
}

/// Redeemer from the witness set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redeemer {
    pub purpose: RedeemerPurpose,
    /// Position of the redeemed item, for `Spend` an index into the sorted inputs
    pub index: u32,
    /// CBOR hex of the redeemer data
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub inputs: Vec<TxInRef>,
    pub outputs: Vec<Utxo>,
    /// Datum hash to CBOR hex, from the witness set
    pub witness_datums: HashMap<String, String>,
    #[serde(default)]
    pub redeemers: Vec<Redeemer>,
    /// False for transactions that only consumed collateral
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub point: ChainPoint,
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn slot(&self) -> u64 {
        self.point.slot
    }
}

/// Payment credential hash (hex) of a Shelley address.
///
/// Byron and otherwise undecodable addresses yield `None`.
pub fn payment_credential(address: &str) -> Option<String> {
    let (_, data) = bech32::decode(address).ok()?;
    // header byte, then the 28 byte payment part
    if data.len() < 29 {
        return None;
    }
    Some(hex::encode(&data[1..29]))
}

/// Payment and, for base addresses, stake credential hashes (hex) of a Shelley address
pub fn address_credentials(address: &str) -> Option<(String, Option<String>)> {
    let (_, data) = bech32::decode(address).ok()?;
    if data.len() < 29 {
        return None;
    }
    let stake = (data.len() >= 57).then(|| hex::encode(&data[29..57]));
    Some((hex::encode(&data[1..29]), stake))
}

/// Splits a unit into (policy hex, decoded asset name)
pub fn split_unit(unit: &str) -> (String, String) {
    if unit == LOVELACE || unit.len() < POLICY_ID_HEX_LEN {
        return (String::new(), unit.to_string());
    }
    let (policy, name_hex) = unit.split_at(POLICY_ID_HEX_LEN);
    let name = hex::decode(name_hex)
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .chars()
                .filter(|c| *c != '\0')
                .collect::<String>()
        })
        .unwrap_or_else(|_| name_hex.to_string());
    (policy.to_string(), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_address(credential: &[u8; 28]) -> String {
        let mut data = vec![0x71u8];
        data.extend_from_slice(credential);
        bech32::encode::<bech32::Bech32>(bech32::Hrp::parse("addr").unwrap(), &data).unwrap()
    }

    #[test]
    fn test_payment_credential_from_script_address() {
        let credential = [0xabu8; 28];
        let address = script_address(&credential);
        assert_eq!(payment_credential(&address), Some("ab".repeat(28)));
    }

    #[test]
    fn test_base_address_credentials() {
        let mut data = vec![0x01u8];
        data.extend_from_slice(&[0x11; 28]);
        data.extend_from_slice(&[0x22; 28]);
        let base = bech32::encode::<bech32::Bech32>(bech32::Hrp::parse("addr").unwrap(), &data).unwrap();

        assert_eq!(
            address_credentials(&base),
            Some(("11".repeat(28), Some("22".repeat(28))))
        );
        assert_eq!(
            address_credentials(&script_address(&[0x33; 28])),
            Some(("33".repeat(28), None))
        );
    }

    #[test]
    fn test_inputs_sort_by_hash_then_index() {
        let mut refs = vec![TxInRef::new("bb", 0), TxInRef::new("aa", 2), TxInRef::new("aa", 1)];
        refs.sort();
        assert_eq!(
            refs,
            vec![TxInRef::new("aa", 1), TxInRef::new("aa", 2), TxInRef::new("bb", 0)]
        );
    }

    #[test]
    fn test_payment_credential_rejects_byron() {
        assert_eq!(
            payment_credential("DdzFFzCqrhsjcfsReoiHddbw5uE7ZKuBZpvbiLRjSHDdgcNGtqtRN6KJMaJ9Ar3Eh"),
            None
        );
    }

    #[test]
    fn test_split_unit() {
        let unit = format!("{}{}", "a".repeat(56), hex::encode("MIN\0"));
        let (policy, name) = split_unit(&unit);
        assert_eq!(policy, "a".repeat(56));
        assert_eq!(name, "MIN");

        let (policy, name) = split_unit(LOVELACE);
        assert_eq!(policy, "");
        assert_eq!(name, LOVELACE);
    }

    #[test]
    fn test_origin_point() {
        assert!(ChainPoint::new(0, "abcd").is_origin());
        assert!(ChainPoint::new(10, "").is_origin());
        assert!(!ChainPoint::new(10, "abcd").is_origin());
    }
}
