//! Plutus datum decoding
//!
//! Pool state on Cardano DEXes lives in Plutus data attached to the pool output,
//! either inline or as a hash whose preimage travels in the spending transaction's
//! witness set. This module resolves the bytes and decodes the CBOR into
//! [`PlutusData`].

use std::collections::HashMap;

use ciborium::value::Value;
use thiserror::Error;

use crate::models::chain::{LOVELACE, Utxo};

#[derive(Debug, Error)]
pub enum DatumError {
    #[error("Output carries no datum")]
    Missing,

    #[error("Datum hash {0} not present in the witness set")]
    UnresolvedHash(String),

    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Invalid CBOR: {0}")]
    Cbor(String),

    #[error("Unexpected datum shape: {0}")]
    Shape(String),
}

/// Decoded Plutus data
#[derive(Debug, Clone, PartialEq)]
pub enum PlutusData {
    Constr { tag: u64, fields: Vec<PlutusData> },
    Map(Vec<(PlutusData, PlutusData)>),
    List(Vec<PlutusData>),
    Int(i128),
    Bytes(Vec<u8>),
}

impl PlutusData {
    pub fn fields(&self) -> Result<&[PlutusData], DatumError> {
        match self {
            PlutusData::Constr { fields, .. } => Ok(fields),
            other => Err(DatumError::Shape(format!("expected constr, got {}", other.kind()))),
        }
    }

    /// Constructor index of a `Constr`
    pub fn constructor(&self) -> Result<u64, DatumError> {
        match self {
            PlutusData::Constr { tag, .. } => Ok(*tag),
            other => Err(DatumError::Shape(format!("expected constr, got {}", other.kind()))),
        }
    }

    pub fn field(&self, idx: usize) -> Result<&PlutusData, DatumError> {
        let fields = self.fields()?;
        fields.get(idx).ok_or_else(|| {
            DatumError::Shape(format!("constr has {} fields, wanted index {}", fields.len(), idx))
        })
    }

    /// Follows a path of constructor field indices
    pub fn at(&self, path: &[usize]) -> Result<&PlutusData, DatumError> {
        path.iter().try_fold(self, |node, idx| node.field(*idx))
    }

    pub fn as_bytes(&self) -> Result<&[u8], DatumError> {
        match self {
            PlutusData::Bytes(b) => Ok(b),
            other => Err(DatumError::Shape(format!("expected bytes, got {}", other.kind()))),
        }
    }

    pub fn as_list(&self) -> Result<&[PlutusData], DatumError> {
        match self {
            PlutusData::List(items) => Ok(items),
            other => Err(DatumError::Shape(format!("expected list, got {}", other.kind()))),
        }
    }

    pub fn as_int(&self) -> Result<i128, DatumError> {
        match self {
            PlutusData::Int(i) => Ok(*i),
            other => Err(DatumError::Shape(format!("expected int, got {}", other.kind()))),
        }
    }

    /// Reads an asset class `Constr [policy bytes, name bytes]` as a unit.
    /// An empty policy denotes lovelace.
    pub fn as_asset_unit(&self) -> Result<String, DatumError> {
        let policy = self.field(0)?.as_bytes()?;
        let name = self.field(1)?.as_bytes()?;
        if policy.is_empty() {
            return Ok(LOVELACE.to_string());
        }
        Ok(format!("{}{}", hex::encode(policy), hex::encode(name)))
    }

    fn kind(&self) -> &'static str {
        match self {
            PlutusData::Constr { .. } => "constr",
            PlutusData::Map(_) => "map",
            PlutusData::List(_) => "list",
            PlutusData::Int(_) => "int",
            PlutusData::Bytes(_) => "bytes",
        }
    }
}

/// Datum attached to `utxo`, resolved against the transaction witness datums
pub fn decode_utxo_datum(
    utxo: &Utxo,
    witness_datums: &HashMap<String, String>,
) -> Result<PlutusData, DatumError> {
    if let Some(inline) = &utxo.inline_datum {
        return decode_hex(inline);
    }
    let hash = utxo.datum_hash.as_ref().ok_or(DatumError::Missing)?;
    let cbor = witness_datums
        .get(hash)
        .ok_or_else(|| DatumError::UnresolvedHash(hash.clone()))?;
    decode_hex(cbor)
}

pub fn decode_hex(cbor_hex: &str) -> Result<PlutusData, DatumError> {
    decode(&hex::decode(cbor_hex)?)
}

pub fn decode(bytes: &[u8]) -> Result<PlutusData, DatumError> {
    let value: Value =
        ciborium::de::from_reader(bytes).map_err(|e| DatumError::Cbor(e.to_string()))?;
    from_value(value)
}

fn from_value(value: Value) -> Result<PlutusData, DatumError> {
    match value {
        Value::Integer(i) => Ok(PlutusData::Int(i128::from(i))),
        Value::Bytes(b) => Ok(PlutusData::Bytes(b)),
        Value::Array(items) => Ok(PlutusData::List(
            items.into_iter().map(from_value).collect::<Result<_, _>>()?,
        )),
        Value::Map(entries) => Ok(PlutusData::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((from_value(k)?, from_value(v)?)))
                .collect::<Result<_, DatumError>>()?,
        )),
        Value::Tag(tag, inner) => from_tagged(tag, *inner),
        other => Err(DatumError::Shape(format!("unsupported CBOR item {:?}", other))),
    }
}

fn from_tagged(tag: u64, inner: Value) -> Result<PlutusData, DatumError> {
    match tag {
        121..=127 => constr(tag - 121, inner),
        1280..=1400 => constr(tag - 1280 + 7, inner),
        102 => match inner {
            Value::Array(mut parts) if parts.len() == 2 => {
                let fields = parts.pop().unwrap_or(Value::Null);
                let alt = parts
                    .pop()
                    .and_then(|v| v.as_integer())
                    .and_then(|i| u64::try_from(i).ok())
                    .ok_or_else(|| DatumError::Shape("bad general constr tag".to_string()))?;
                constr(alt, fields)
            }
            _ => Err(DatumError::Shape("general constr must be a pair".to_string())),
        },
        2 | 3 => {
            let Value::Bytes(bytes) = inner else {
                return Err(DatumError::Shape("bignum must wrap bytes".to_string()));
            };
            if bytes.len() > 16 {
                return Err(DatumError::Shape("bignum exceeds 128 bits".to_string()));
            }
            let magnitude = bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128);
            let magnitude = i128::try_from(magnitude)
                .map_err(|_| DatumError::Shape("bignum exceeds 128 bits".to_string()))?;
            Ok(PlutusData::Int(if tag == 2 { magnitude } else { -1 - magnitude }))
        }
        other => Err(DatumError::Shape(format!("unsupported tag {}", other))),
    }
}

fn constr(tag: u64, inner: Value) -> Result<PlutusData, DatumError> {
    match inner {
        Value::Array(items) => Ok(PlutusData::Constr {
            tag,
            fields: items.into_iter().map(from_value).collect::<Result<_, _>>()?,
        }),
        _ => Err(DatumError::Shape("constr fields must be an array".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: Value) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(&value, &mut out).unwrap();
        out
    }

    fn asset(policy: &[u8], name: &[u8]) -> Value {
        Value::Tag(
            121,
            Box::new(Value::Array(vec![
                Value::Bytes(policy.to_vec()),
                Value::Bytes(name.to_vec()),
            ])),
        )
    }

    #[test]
    fn test_decode_nested_constr() {
        let datum = Value::Tag(
            122,
            Box::new(Value::Array(vec![
                asset(&[], &[]),
                asset(&[0xaa; 28], b"MIN"),
                Value::Integer(42.into()),
            ])),
        );
        let decoded = decode(&encode(datum)).unwrap();

        match &decoded {
            PlutusData::Constr { tag, fields } => {
                assert_eq!(*tag, 1);
                assert_eq!(fields.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decoded.field(0).unwrap().as_asset_unit().unwrap(), "lovelace");
        assert_eq!(
            decoded.field(1).unwrap().as_asset_unit().unwrap(),
            format!("{}{}", "aa".repeat(28), hex::encode("MIN"))
        );
        assert_eq!(decoded.field(2).unwrap().as_int().unwrap(), 42);
        assert_eq!(decoded.constructor().unwrap(), 1);
        assert!(decoded.field(2).unwrap().constructor().is_err());
    }

    #[test]
    fn test_decode_high_and_general_constr_tags() {
        let high = Value::Tag(1281, Box::new(Value::Array(vec![])));
        assert_eq!(
            decode(&encode(high)).unwrap(),
            PlutusData::Constr { tag: 8, fields: vec![] }
        );

        let general = Value::Tag(
            102,
            Box::new(Value::Array(vec![
                Value::Integer(300.into()),
                Value::Array(vec![Value::Integer(1.into())]),
            ])),
        );
        assert_eq!(
            decode(&encode(general)).unwrap(),
            PlutusData::Constr {
                tag: 300,
                fields: vec![PlutusData::Int(1)]
            }
        );
    }

    #[test]
    fn test_decode_list() {
        let list = Value::Array(vec![Value::Integer(3.into()), Value::Integer(5.into())]);
        let decoded = decode(&encode(list)).unwrap();
        let items: Vec<i128> = decoded
            .as_list()
            .unwrap()
            .iter()
            .map(|i| i.as_int().unwrap())
            .collect();
        assert_eq!(items, vec![3, 5]);
    }

    #[test]
    fn test_decode_bignum() {
        let big = Value::Tag(2, Box::new(Value::Bytes(vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])));
        assert_eq!(decode(&encode(big)).unwrap(), PlutusData::Int(1i128 << 64));
    }

    #[test]
    fn test_datum_resolution_from_witness_set() {
        let cbor = hex::encode(encode(asset(&[], &[])));
        let utxo = Utxo {
            tx_hash: "00".repeat(32),
            output_index: 0,
            address: String::new(),
            amounts: vec![],
            datum_hash: Some("dh".to_string()),
            inline_datum: None,
            script_ref: None,
        };

        let missing = decode_utxo_datum(&utxo, &HashMap::new());
        assert!(matches!(missing, Err(DatumError::UnresolvedHash(_))));

        let witness = HashMap::from([("dh".to_string(), cbor)]);
        let decoded = decode_utxo_datum(&utxo, &witness).unwrap();
        assert_eq!(decoded.as_asset_unit().unwrap(), "lovelace");
    }

    #[test]
    fn test_shape_errors_are_reported() {
        let decoded = decode(&encode(Value::Integer(7.into()))).unwrap();
        assert!(matches!(decoded.field(0), Err(DatumError::Shape(_))));
        assert!(matches!(decode(&[0xff, 0x00]), Err(DatumError::Cbor(_))));
        assert!(matches!(decode_hex("zz"), Err(DatumError::Hex(_))));
    }
}
