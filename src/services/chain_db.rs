//! Chain database lookups
//!
//! Used to find a concrete block to start syncing from and to resolve the
//! contents of outputs spent by a transaction. Every provider is a public or
//! self-hosted indexer which may trail the node by a few blocks, so a missing
//! block or output means "not yet" rather than an error.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ChainDbError;
use crate::models::chain::{AssetAmount, ChainPoint, LOVELACE, TxInRef, Utxo};

/// Max refs per utxo_info request
const UTXO_CHUNK_SIZE: usize = 100;

/// Slots walked forward by Blockfrost before giving up on a nearby block
const MAX_SLOT_LOOKUPS: u64 = 250;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ChainDatabase: Send + Sync {
    /// First block at or after `slot`
    async fn get_block_nearest_to_slot(&self, slot: u64) -> Result<Option<ChainPoint>, ChainDbError>;

    /// Outputs behind `refs`. Refs the database does not know yet are absent from the result.
    async fn get_input_utxos(&self, refs: &[TxInRef]) -> Result<Vec<Utxo>, ChainDbError>;
}

/// Koios REST client
#[derive(Clone)]
pub struct KoiosClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct KoiosBlock {
    hash: String,
    abs_slot: u64,
}

#[derive(Debug, Serialize)]
struct UtxoInfoRequest {
    #[serde(rename = "_utxo_refs")]
    utxo_refs: Vec<String>,
    #[serde(rename = "_extended")]
    extended: bool,
}

#[derive(Debug, Deserialize)]
struct KoiosUtxo {
    tx_hash: String,
    tx_index: u32,
    address: String,
    value: String,
    datum_hash: Option<String>,
    inline_datum: Option<KoiosInlineDatum>,
    reference_script: Option<KoiosReferenceScript>,
    #[serde(default)]
    asset_list: Option<Vec<KoiosAsset>>,
}

#[derive(Debug, Deserialize)]
struct KoiosInlineDatum {
    bytes: String,
}

#[derive(Debug, Deserialize)]
struct KoiosReferenceScript {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct KoiosAsset {
    policy_id: String,
    asset_name: Option<String>,
    quantity: String,
}

impl KoiosClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ChainDbError> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChainDatabase for KoiosClient {
    async fn get_block_nearest_to_slot(&self, slot: u64) -> Result<Option<ChainPoint>, ChainDbError> {
        let url = format!("{}/blocks", self.base_url);
        let blocks: Vec<KoiosBlock> = self
            .client
            .get(&url)
            .query(&[
                ("select", "hash,abs_slot".to_string()),
                ("abs_slot", format!("gte.{}", slot)),
                ("order", "abs_slot.asc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(blocks.into_iter().next().map(|b| ChainPoint::new(b.abs_slot, b.hash)))
    }

    async fn get_input_utxos(&self, refs: &[TxInRef]) -> Result<Vec<Utxo>, ChainDbError> {
        let url = format!("{}/utxo_info", self.base_url);
        let mut utxos = Vec::with_capacity(refs.len());

        for chunk in refs.chunks(UTXO_CHUNK_SIZE) {
            let request = UtxoInfoRequest {
                utxo_refs: chunk.iter().map(|r| r.to_string()).collect(),
                extended: true,
            };
            let rows: Vec<KoiosUtxo> = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            debug!(requested = chunk.len(), resolved = rows.len(), "Resolved input utxos");

            for row in rows {
                utxos.push(convert_utxo(row)?);
            }
        }
        Ok(utxos)
    }
}

fn convert_utxo(row: KoiosUtxo) -> Result<Utxo, ChainDbError> {
    let lovelace = parse_quantity(&row.value)?;
    let mut amounts = vec![AssetAmount::new(LOVELACE, lovelace)];
    for asset in row.asset_list.unwrap_or_default() {
        let unit = format!("{}{}", asset.policy_id, asset.asset_name.unwrap_or_default());
        amounts.push(AssetAmount::new(unit, parse_quantity(&asset.quantity)?));
    }

    Ok(Utxo {
        tx_hash: row.tx_hash,
        output_index: row.tx_index,
        address: row.address,
        amounts,
        datum_hash: row.datum_hash,
        inline_datum: row.inline_datum.map(|d| d.bytes),
        script_ref: row.reference_script.map(|s| s.hash),
    })
}

/// Blockfrost REST client, authenticated by project id
#[derive(Clone)]
pub struct BlockfrostClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct BlockfrostBlock {
    hash: String,
    slot: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BlockfrostTxUtxos {
    hash: String,
    outputs: Vec<BlockfrostOutput>,
}

#[derive(Debug, Deserialize)]
struct BlockfrostOutput {
    address: String,
    amount: Vec<ProviderAmount>,
    output_index: u32,
    data_hash: Option<String>,
    inline_datum: Option<String>,
    reference_script_hash: Option<String>,
}

/// `{unit, quantity}` pair shared by Blockfrost and YaciStore
#[derive(Debug, Deserialize)]
struct ProviderAmount {
    unit: String,
    quantity: Quantity,
}

/// Blockfrost sends quantities as strings, YaciStore as numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Text(String),
    Number(u64),
}

impl BlockfrostClient {
    pub fn new(base_url: impl Into<String>, project_id: &str) -> Result<Self, ChainDbError> {
        let mut headers = header::HeaderMap::new();
        let value = header::HeaderValue::from_str(project_id)
            .map_err(|_| ChainDbError::UnexpectedResponse("project id is not a valid header".to_string()))?;
        headers.insert("project_id", value);

        Ok(Self {
            client: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .default_headers(headers)
                .build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn block_in_slot(&self, slot: u64) -> Result<Option<ChainPoint>, ChainDbError> {
        let url = format!("{}/blocks/slot/{}", self.base_url, slot);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let block: BlockfrostBlock = response.error_for_status()?.json().await?;
        Ok(Some(ChainPoint::new(block.slot.unwrap_or(slot), block.hash)))
    }

    async fn tx_outputs(&self, tx_hash: &str) -> Result<Option<BlockfrostTxUtxos>, ChainDbError> {
        let url = format!("{}/txs/{}/utxos", self.base_url, tx_hash);
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}

#[async_trait]
impl ChainDatabase for BlockfrostClient {
    /// Most slots are empty, so this walks forward one slot at a time
    async fn get_block_nearest_to_slot(&self, slot: u64) -> Result<Option<ChainPoint>, ChainDbError> {
        for candidate in slot..slot + MAX_SLOT_LOOKUPS {
            if let Some(point) = self.block_in_slot(candidate).await? {
                debug!(requested = slot, found = point.slot, "Found block near slot");
                return Ok(Some(point));
            }
            trace!(slot = candidate, "No block in slot");
        }
        Ok(None)
    }

    async fn get_input_utxos(&self, refs: &[TxInRef]) -> Result<Vec<Utxo>, ChainDbError> {
        let mut by_tx: BTreeMap<&str, HashSet<u32>> = BTreeMap::new();
        for r in refs {
            by_tx.entry(r.tx_hash.as_str()).or_default().insert(r.index);
        }

        let mut utxos = Vec::with_capacity(refs.len());
        for (tx_hash, indexes) in by_tx {
            let Some(tx) = self.tx_outputs(tx_hash).await? else {
                debug!(tx_hash = tx_hash, "Transaction not indexed yet");
                continue;
            };
            for output in tx.outputs {
                if indexes.contains(&output.output_index) {
                    utxos.push(convert_blockfrost_output(&tx.hash, output)?);
                }
            }
        }
        Ok(utxos)
    }
}

fn convert_blockfrost_output(tx_hash: &str, output: BlockfrostOutput) -> Result<Utxo, ChainDbError> {
    Ok(Utxo {
        tx_hash: tx_hash.to_string(),
        output_index: output.output_index,
        address: output.address,
        amounts: convert_amounts(output.amount)?,
        datum_hash: output.data_hash,
        inline_datum: output.inline_datum,
        script_ref: output.reference_script_hash,
    })
}

/// YaciStore REST client. YaciStore has no slot lookup, block searches go to Blockfrost.
#[derive(Clone)]
pub struct YaciStoreClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    blocks: BlockfrostClient,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct YaciUtxoRequest<'a> {
    tx_hash: &'a str,
    output_index: u32,
}

#[derive(Debug, Deserialize)]
struct YaciUtxo {
    tx_hash: String,
    output_index: u32,
    owner_addr: String,
    #[serde(default)]
    amounts: Vec<ProviderAmount>,
    data_hash: Option<String>,
    inline_datum: Option<String>,
    reference_script_hash: Option<String>,
}

impl YaciStoreClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        blocks: BlockfrostClient,
    ) -> Result<Self, ChainDbError> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            blocks,
        })
    }
}

#[async_trait]
impl ChainDatabase for YaciStoreClient {
    async fn get_block_nearest_to_slot(&self, slot: u64) -> Result<Option<ChainPoint>, ChainDbError> {
        self.blocks.get_block_nearest_to_slot(slot).await
    }

    async fn get_input_utxos(&self, refs: &[TxInRef]) -> Result<Vec<Utxo>, ChainDbError> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/v1/utxos", self.base_url);
        let body: Vec<YaciUtxoRequest> = refs
            .iter()
            .map(|r| YaciUtxoRequest {
                tx_hash: &r.tx_hash,
                output_index: r.index,
            })
            .collect();

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let rows: Vec<YaciUtxo> = response.error_for_status()?.json().await?;
        debug!(requested = refs.len(), resolved = rows.len(), "Resolved input utxos");

        rows.into_iter().map(convert_yaci_utxo).collect()
    }
}

fn convert_yaci_utxo(row: YaciUtxo) -> Result<Utxo, ChainDbError> {
    Ok(Utxo {
        tx_hash: row.tx_hash,
        output_index: row.output_index,
        address: row.owner_addr,
        amounts: convert_amounts(row.amounts)?,
        datum_hash: row.data_hash,
        inline_datum: row.inline_datum,
        script_ref: row.reference_script_hash,
    })
}

fn convert_amounts(amounts: Vec<ProviderAmount>) -> Result<Vec<AssetAmount>, ChainDbError> {
    amounts
        .into_iter()
        .map(|a| {
            let quantity = match a.quantity {
                Quantity::Text(raw) => parse_quantity(&raw)?,
                Quantity::Number(n) => n,
            };
            Ok(AssetAmount::new(a.unit, quantity))
        })
        .collect()
}

fn parse_quantity(raw: &str) -> Result<u64, ChainDbError> {
    raw.parse()
        .map_err(|_| ChainDbError::UnexpectedResponse(format!("bad quantity {}", raw)))
}
