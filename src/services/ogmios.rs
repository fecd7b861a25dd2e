//! Ogmios v6 chain sync client
//!
//! Speaks JSON-RPC over a WebSocket. Each delivery session opens its own
//! connection, finds the intersection with the requested point and then asks
//! for one block at a time, so the node never runs ahead of the listener.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::NodeError;
use crate::models::chain::{
    AssetAmount, Block, ChainPoint, LOVELACE, Redeemer, RedeemerPurpose, Transaction, TxInRef, Utxo,
};
use crate::services::node_client::{BlockListener, NodeClient};

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// JSON-RPC error code for an unknown intersection
const INTERSECTION_NOT_FOUND: i64 = 1000;

pub struct OgmiosClient {
    url: String,
    writer: Arc<Mutex<Option<WsWriter>>>,
    session: parking_lot::Mutex<Option<CancellationToken>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    method: Option<String>,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OgmiosPoint {
    Origin(String),
    At { slot: u64, id: String },
}

impl From<OgmiosPoint> for ChainPoint {
    fn from(point: OgmiosPoint) -> Self {
        match point {
            OgmiosPoint::Origin(_) => ChainPoint::new(0, ""),
            OgmiosPoint::At { slot, id } => ChainPoint::new(slot, id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
enum NextBlock {
    Forward { block: OgmiosBlock },
    Backward { point: OgmiosPoint },
}

#[derive(Debug, Deserialize)]
struct OgmiosBlock {
    id: String,
    slot: Option<u64>,
    height: Option<u64>,
    #[serde(default)]
    transactions: Vec<OgmiosTx>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OgmiosTx {
    id: String,
    spends: Option<String>,
    #[serde(default)]
    inputs: Vec<OgmiosInput>,
    #[serde(default)]
    outputs: Vec<OgmiosOutput>,
    #[serde(default)]
    datums: HashMap<String, String>,
    #[serde(default)]
    redeemers: Vec<OgmiosRedeemer>,
}

#[derive(Debug, Deserialize)]
struct OgmiosRedeemer {
    validator: OgmiosValidator,
    redeemer: String,
}

#[derive(Debug, Deserialize)]
struct OgmiosValidator {
    purpose: String,
    index: u32,
}

#[derive(Debug, Deserialize)]
struct OgmiosInput {
    transaction: OgmiosTxId,
    index: u32,
}

#[derive(Debug, Deserialize)]
struct OgmiosTxId {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OgmiosOutput {
    address: String,
    value: HashMap<String, HashMap<String, Value>>,
    datum_hash: Option<String>,
    datum: Option<String>,
    script: Option<Value>,
}

impl OgmiosClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            writer: Arc::new(Mutex::new(None)),
            session: parking_lot::Mutex::new(None),
        }
    }

    async fn send(&self, payload: Value) -> Result<(), NodeError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NodeError::NotConnected)?;
        writer.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    async fn request_next_block(&self) -> Result<(), NodeError> {
        self.send(rpc("nextBlock", json!({}))).await
    }

    /// Acts on one response. Returns false once the session should end.
    async fn handle_response(
        &self,
        response: RpcResponse,
        listener: &Arc<dyn BlockListener>,
        token: &CancellationToken,
    ) -> Result<bool, NodeError> {
        if let Some(err) = response.error {
            if err.code == INTERSECTION_NOT_FOUND {
                let tip = err
                    .data
                    .and_then(|d| d.get("tip").cloned())
                    .and_then(|t| serde_json::from_value::<OgmiosPoint>(t).ok())
                    .map(ChainPoint::from)
                    .unwrap_or_else(|| ChainPoint::new(0, ""));
                warn!(tip = %tip, "Intersection not found");
                listener.on_intersect_not_found(tip).await;
                return Ok(false);
            }
            return Err(NodeError::Protocol(format!("{} ({})", err.message, err.code)));
        }

        let result = response.result.unwrap_or(Value::Null);
        match response.method.as_deref() {
            Some("findIntersection") => {
                let intersection = result
                    .get("intersection")
                    .cloned()
                    .and_then(|p| serde_json::from_value::<OgmiosPoint>(p).ok())
                    .map(ChainPoint::from);
                info!(intersection = ?intersection, "Intersection found, requesting blocks");
            }
            Some("nextBlock") => match serde_json::from_value::<NextBlock>(result)? {
                NextBlock::Forward { block } => {
                    let block = convert_block(block)?;
                    trace!(slot = block.slot(), height = block.height, "Block delivered");
                    listener.on_block(block).await;
                }
                NextBlock::Backward { point } => {
                    let point = ChainPoint::from(point);
                    debug!(point = %point, "Rollback delivered");
                    listener.on_rollback(point).await;
                }
            },
            other => {
                trace!(method = ?other, "Ignoring response");
                return Ok(true);
            }
        }

        if token.is_cancelled() {
            return Ok(false);
        }
        self.request_next_block().await?;
        Ok(true)
    }
}

fn rpc(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

fn point_json(point: &ChainPoint) -> Value {
    if point.is_origin() {
        json!("origin")
    } else {
        json!({ "slot": point.slot, "id": point.hash })
    }
}

fn convert_block(block: OgmiosBlock) -> Result<Block, NodeError> {
    let slot = block
        .slot
        .ok_or_else(|| NodeError::Protocol(format!("block {} has no slot", block.id)))?;
    let transactions = block.transactions.into_iter().map(convert_tx).collect();
    Ok(Block {
        point: ChainPoint::new(slot, block.id),
        height: block.height.unwrap_or(0),
        transactions,
    })
}

fn convert_tx(tx: OgmiosTx) -> Transaction {
    // Phase-2 failures only consume collateral
    let valid = tx.spends.as_deref() != Some("collateral");
    let outputs = tx
        .outputs
        .into_iter()
        .enumerate()
        .map(|(idx, out)| Utxo {
            tx_hash: tx.id.clone(),
            output_index: idx as u32,
            address: out.address,
            amounts: convert_value(out.value),
            datum_hash: out.datum_hash,
            inline_datum: out.datum,
            script_ref: out.script.map(|s| s.to_string()),
        })
        .collect();
    Transaction {
        inputs: tx
            .inputs
            .into_iter()
            .map(|i| TxInRef::new(i.transaction.id, i.index))
            .collect(),
        outputs,
        witness_datums: tx.datums,
        redeemers: tx.redeemers.into_iter().map(convert_redeemer).collect(),
        valid,
        hash: tx.id,
    }
}

fn convert_redeemer(redeemer: OgmiosRedeemer) -> Redeemer {
    let purpose = match redeemer.validator.purpose.as_str() {
        "spend" => RedeemerPurpose::Spend,
        "mint" => RedeemerPurpose::Mint,
        _ => RedeemerPurpose::Other,
    };
    Redeemer {
        purpose,
        index: redeemer.validator.index,
        data: redeemer.redeemer,
    }
}

fn convert_value(value: HashMap<String, HashMap<String, Value>>) -> Vec<AssetAmount> {
    let mut amounts = Vec::new();
    for (policy, assets) in value {
        for (name, quantity) in assets {
            let Some(quantity) = quantity.as_u64() else {
                warn!(policy = %policy, asset = %name, "Quantity out of range, ignoring");
                continue;
            };
            let unit = if policy == "ada" {
                LOVELACE.to_string()
            } else {
                format!("{}{}", policy, name)
            };
            amounts.push(AssetAmount::new(unit, quantity));
        }
    }
    amounts.sort_by(|a, b| a.unit.cmp(&b.unit));
    amounts
}

#[async_trait]
impl NodeClient for OgmiosClient {
    async fn connect(&self) -> Result<(), NodeError> {
        let (mut ws, _) = connect_async(&self.url).await?;
        ws.close(None).await?;
        debug!(url = %self.url, "Node reachable");
        Ok(())
    }

    async fn start_block_delivery(
        &self,
        from: ChainPoint,
        listener: Arc<dyn BlockListener>,
    ) -> Result<(), NodeError> {
        let token = CancellationToken::new();
        if let Some(previous) = self.session.lock().replace(token.clone()) {
            previous.cancel();
        }

        let (ws, _) = connect_async(&self.url).await?;
        let (write, mut read) = ws.split();
        *self.writer.lock().await = Some(write);

        info!(from = %from, "Starting block delivery");
        self.send(rpc(
            "findIntersection",
            json!({ "points": [point_json(&from)] }),
        ))
        .await?;

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let response: RpcResponse = match serde_json::from_str(&text) {
                            Ok(r) => r,
                            Err(e) => break Err(e.into()),
                        };
                        match self.handle_response(response, &listener, &token).await {
                            Ok(true) => {}
                            Ok(false) => break Ok(()),
                            Err(e) => break Err(e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Err(NodeError::Protocol("connection closed by node".to_string()));
                    }
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(_)) => {}
                },
            }
        };

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        outcome
    }

    async fn send_keep_alive(&self, nonce: u32) -> Result<(), NodeError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NodeError::NotConnected)?;
        writer.send(Message::Ping(nonce.to_be_bytes().to_vec())).await?;
        trace!(nonce = nonce, "Sent keep-alive");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(token) = self.session.lock().take() {
            token.cancel();
        }
    }
}
