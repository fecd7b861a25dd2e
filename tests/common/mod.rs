#![allow(dead_code)]

use async_trait::async_trait;
use ciborium::value::Value;
use parking_lot::Mutex;
use sea_orm::{Database, DatabaseConnection, DbErr};
use std::collections::{HashMap, VecDeque};
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use prise_indexer::error::{ChainDbError, MetadataError, NodeError, PublishError};
use prise_indexer::models::chain::{
    AssetAmount, Block, ChainPoint, Redeemer, RedeemerPurpose, Transaction, TxInRef, Utxo,
};
use prise_indexer::services::candle_service::CandleService;
use prise_indexer::services::chain_db::ChainDatabase;
use prise_indexer::services::classifier;
use prise_indexer::services::latest_prices::LatestPriceBuffer;
use prise_indexer::services::monitoring::PrometheusMetrics;
use prise_indexer::services::node_client::{BlockListener, NodeClient};
use prise_indexer::models::event::PriceEvent;
use prise_indexer::services::pipeline::Dispatcher;
use prise_indexer::services::publisher::{PricePublisher, encode_event};
use prise_indexer::services::price_processor::PriceProcessor;
use prise_indexer::services::slot_time::SlotClock;
use prise_indexer::services::storage::Store;
use prise_indexer::services::swap_processor::SwapProcessor;
use prise_indexer::services::token_metadata::TokenMetadata;

pub const MINSWAP_POOL: &str = "e1317b152faac13426e6a83e06ff88a4d62cce3c1634ab0a5ec13309";
pub const MINSWAP_V2_POOL: &str = "ea07b733d932129c378af627436e7cbc2ef0bf96e0036bb51b3bde6b";
pub const SUNDAESWAP_POOL: &str = "4020e7fc2de75a0729c3cc3af715b34d98381e0cdbcfa99c950bc3ac";
pub const WINGRIDERS_POOL: &str = "e6c90a5923713af5786963dee0fdffd830ca7e0c86a041d9e5833e91";

/// Policy of the test token
pub const TOKEN_POLICY: &str = "29d222ce763455e3d7a09a665ce554f00ac89d2e99a1a83d267170c6";
/// "MIN"
pub const TOKEN_NAME: &str = "4d494e";

/// Set up test database connection
/// Uses TEST_DATABASE_URL environment variable or falls back to default
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let database_url = env::var("TEST_DATABASE_URL").unwrap_or_else(|_| {
        "postgresql://prise_user@localhost:5432/prise_test".to_string()
    });

    Database::connect(&database_url).await
}

pub fn token_unit() -> String {
    format!("{}{}", TOKEN_POLICY, TOKEN_NAME)
}

/// Enterprise script address paying to `credential`
pub fn script_address(credential: &str) -> String {
    let mut data = vec![0x71u8];
    data.extend(hex::decode(credential).unwrap());
    bech32::encode::<bech32::Bech32>(bech32::Hrp::parse("addr").unwrap(), &data).unwrap()
}

pub fn wallet_address() -> String {
    script_address(&"11".repeat(28))
}

fn seed_hash(seed: u8) -> String {
    format!("{:02x}", seed).repeat(28)
}

/// Base address of the wallet keyed by `seed`, staked under `seed + 1`
pub fn owner_address(seed: u8) -> String {
    let mut data = vec![0x01u8];
    data.extend(hex::decode(seed_hash(seed)).unwrap());
    data.extend(hex::decode(seed_hash(seed.wrapping_add(1))).unwrap());
    bech32::encode::<bech32::Bech32>(bech32::Hrp::parse("addr").unwrap(), &data).unwrap()
}

/// Plutus data form of [`owner_address`]
pub fn owner_plutus_address(seed: u8) -> Value {
    constr(
        0,
        vec![
            constr(0, vec![bytes(&seed_hash(seed))]),
            constr(
                0,
                vec![constr(0, vec![constr(0, vec![bytes(&seed_hash(seed.wrapping_add(1)))])])],
            ),
        ],
    )
}

// Plutus data builders

pub fn constr(index: u64, fields: Vec<Value>) -> Value {
    Value::Tag(121 + index, Box::new(Value::Array(fields)))
}

pub fn bytes(hex_str: &str) -> Value {
    Value::Bytes(hex::decode(hex_str).unwrap())
}

pub fn int(n: i64) -> Value {
    Value::Integer(n.into())
}

/// Asset class of a unit, lovelace as empty policy and name
pub fn asset_class(unit: &str) -> Value {
    if unit == "lovelace" {
        return constr(0, vec![bytes(""), bytes("")]);
    }
    let (policy, name) = unit.split_at(56);
    constr(0, vec![bytes(policy), bytes(name)])
}

pub fn cbor_hex(value: &Value) -> String {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).unwrap();
    hex::encode(out)
}

pub fn minswap_datum(asset_a: &str, asset_b: &str) -> String {
    cbor_hex(&constr(
        0,
        vec![
            asset_class(asset_a),
            asset_class(asset_b),
            int(1_000_000),
            constr(1, vec![]),
            constr(1, vec![]),
        ],
    ))
}

pub fn minswap_v2_datum(asset_a: &str, asset_b: &str, reserve_a: i64, reserve_b: i64) -> String {
    cbor_hex(&constr(
        0,
        vec![
            constr(0, vec![bytes(&"22".repeat(28))]),
            asset_class(asset_a),
            asset_class(asset_b),
            int(1_000_000),
            int(reserve_a),
            int(reserve_b),
            int(30),
            int(30),
            constr(1, vec![]),
            constr(0, vec![]),
        ],
    ))
}

pub fn sundaeswap_datum(asset_a: &str, asset_b: &str) -> String {
    cbor_hex(&constr(
        0,
        vec![
            constr(0, vec![asset_class(asset_a), asset_class(asset_b)]),
            bytes("01"),
            int(1_000_000),
            constr(0, vec![int(3), int(1000)]),
        ],
    ))
}

pub fn wingriders_datum(asset_a: &str, asset_b: &str) -> String {
    cbor_hex(&constr(
        0,
        vec![
            bytes(&"33".repeat(28)),
            constr(
                0,
                vec![
                    constr(0, vec![asset_class(asset_a), asset_class(asset_b)]),
                    int(1_650_000_000_000),
                    int(0),
                    int(0),
                ],
            ),
        ],
    ))
}

/// Minswap V1 `SwapExactIn` order paid out to `owner`
pub fn minswap_order_datum(owner: u8, desired_unit: &str) -> String {
    cbor_hex(&constr(
        0,
        vec![
            owner_plutus_address(owner),
            owner_plutus_address(owner),
            constr(1, vec![]),
            constr(0, vec![asset_class(desired_unit), int(1)]),
            int(2_000_000),
            int(2_000_000),
        ],
    ))
}

/// Minswap V2 `SwapExactIn` order; `a_to_b` pays asset A in
pub fn minswap_v2_order_datum(owner: u8, a_to_b: bool, batcher_fee: i64) -> String {
    cbor_hex(&constr(
        0,
        vec![
            constr(0, vec![bytes(&seed_hash(owner))]),
            owner_plutus_address(owner),
            constr(0, vec![]),
            owner_plutus_address(owner),
            constr(0, vec![]),
            asset_class(&format!("{}{}", "44".repeat(28), "4c50")),
            constr(
                0,
                vec![
                    constr(u64::from(a_to_b), vec![]),
                    constr(0, vec![int(1)]),
                    int(1),
                    constr(0, vec![]),
                ],
            ),
            int(batcher_fee),
            constr(1, vec![]),
        ],
    ))
}

/// SundaeSwap swap request; `sell` pays asset A in
pub fn sundaeswap_order_datum(owner: u8, sell: bool) -> String {
    cbor_hex(&constr(
        0,
        vec![
            bytes("01"),
            constr(
                0,
                vec![
                    constr(0, vec![owner_plutus_address(owner), constr(1, vec![])]),
                    constr(1, vec![]),
                ],
            ),
            int(2_500_000),
            constr(
                0,
                vec![constr(u64::from(!sell), vec![]), int(1), constr(0, vec![int(1)])],
            ),
        ],
    ))
}

/// WingRiders swap request; `sell` pays asset A in
pub fn wingriders_request_datum(owner: u8, sell: bool, asset_a: &str, asset_b: &str) -> String {
    cbor_hex(&constr(
        0,
        vec![
            constr(
                0,
                vec![
                    owner_plutus_address(owner),
                    bytes(&seed_hash(owner)),
                    int(1_700_000_000_000),
                    asset_class(asset_a),
                    asset_class(asset_b),
                ],
            ),
            constr(0, vec![constr(u64::from(!sell), vec![]), int(1)]),
        ],
    ))
}

/// Spend redeemer of a WingRiders pool at `pool_index` applying the requests at `requests`
pub fn wingriders_pool_redeemer(pool_index: u32, requests: &[i64]) -> Redeemer {
    let data = constr(
        0,
        vec![
            int(0),
            int(0),
            Value::Array(requests.iter().map(|i| int(*i)).collect()),
        ],
    );
    Redeemer {
        purpose: RedeemerPurpose::Spend,
        index: pool_index,
        data: cbor_hex(&data),
    }
}

/// Output at `address` holding `lovelace` and `tokens` of the test token
pub fn order_utxo(
    tx_hash: &str,
    index: u32,
    address: &str,
    lovelace: u64,
    tokens: u64,
    datum_hex: &str,
) -> Utxo {
    let mut amounts = vec![AssetAmount::new("lovelace", lovelace)];
    if tokens > 0 {
        amounts.push(AssetAmount::new(token_unit(), tokens));
    }
    Utxo {
        tx_hash: tx_hash.to_string(),
        output_index: index,
        address: address.to_string(),
        amounts,
        datum_hash: None,
        inline_datum: Some(datum_hex.to_string()),
        script_ref: None,
    }
}

/// Payout to the wallet keyed by `owner`
pub fn payout_utxo(owner: u8, lovelace: u64, tokens: u64) -> Utxo {
    let mut utxo = order_utxo("", 0, &owner_address(owner), lovelace, tokens, "");
    utxo.inline_datum = None;
    utxo
}

/// Pool output holding `lovelace` and `tokens` of the test token
pub fn pool_utxo(
    tx_hash: &str,
    index: u32,
    credential: &str,
    lovelace: u64,
    tokens: u64,
    datum_hex: &str,
) -> Utxo {
    Utxo {
        tx_hash: tx_hash.to_string(),
        output_index: index,
        address: script_address(credential),
        amounts: vec![
            AssetAmount::new("lovelace", lovelace),
            AssetAmount::new(token_unit(), tokens),
        ],
        datum_hash: None,
        inline_datum: Some(datum_hex.to_string()),
        script_ref: None,
    }
}

pub fn wallet_utxo(tx_hash: &str, index: u32, lovelace: u64) -> Utxo {
    Utxo {
        tx_hash: tx_hash.to_string(),
        output_index: index,
        address: wallet_address(),
        amounts: vec![AssetAmount::new("lovelace", lovelace)],
        datum_hash: None,
        inline_datum: None,
        script_ref: None,
    }
}

/// Transaction spending `spent` and producing `produced`. Outputs are renumbered
/// under the transaction's own hash.
pub fn transaction(hash: &str, spent: &[&Utxo], produced: Vec<Utxo>) -> Transaction {
    Transaction {
        hash: hash.to_string(),
        inputs: spent.iter().map(|u| u.reference()).collect(),
        outputs: produced
            .into_iter()
            .enumerate()
            .map(|(i, mut u)| {
                u.tx_hash = hash.to_string();
                u.output_index = i as u32;
                u
            })
            .collect(),
        witness_datums: HashMap::new(),
        redeemers: vec![],
        valid: true,
    }
}

pub fn block(slot: u64, height: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        point: ChainPoint::new(slot, format!("{:064x}", slot)),
        height,
        transactions,
    }
}

/// Chain database over an in-memory utxo set. Nearest-block lookups answer
/// with the requested slot itself.
#[derive(Default)]
pub struct MockChainDb {
    utxos: Mutex<HashMap<TxInRef, Utxo>>,
    nearest_requests: Mutex<Vec<u64>>,
    lookups: Mutex<Vec<Vec<TxInRef>>>,
    no_blocks: std::sync::atomic::AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    lookup_delay: Mutex<Duration>,
}

impl MockChainDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, utxo: Utxo) {
        self.utxos.lock().insert(utxo.reference(), utxo);
    }

    pub fn without_blocks(self) -> Self {
        self.no_blocks.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_lookup_delay(self, delay: Duration) -> Self {
        *self.lookup_delay.lock() = delay;
        self
    }

    pub fn nearest_requests(&self) -> Vec<u64> {
        self.nearest_requests.lock().clone()
    }

    pub fn lookups(&self) -> Vec<Vec<TxInRef>> {
        self.lookups.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainDatabase for MockChainDb {
    async fn get_block_nearest_to_slot(&self, slot: u64) -> Result<Option<ChainPoint>, ChainDbError> {
        self.nearest_requests.lock().push(slot);
        if self.no_blocks.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(ChainPoint::new(slot, format!("block-{}", slot))))
    }

    async fn get_input_utxos(&self, refs: &[TxInRef]) -> Result<Vec<Utxo>, ChainDbError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.lookups.lock().push(refs.to_vec());

        let delay = *self.lookup_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let found = {
            let utxos = self.utxos.lock();
            refs.iter().filter_map(|r| utxos.get(r).cloned()).collect()
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(found)
    }
}

/// Registry stand-in with fixed decimals
#[derive(Default)]
pub struct MockMetadata {
    decimals: Mutex<HashMap<String, i32>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MockMetadata {
    pub fn with_decimals(entries: &[(&str, i32)]) -> Self {
        let metadata = Self::default();
        for (unit, decimals) in entries {
            metadata.decimals.lock().insert(unit.to_string(), *decimals);
        }
        metadata
    }

    pub fn set_decimals(&self, unit: &str, decimals: i32) {
        self.decimals.lock().insert(unit.to_string(), decimals);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenMetadata for MockMetadata {
    async fn get_decimals(&self, units: &[String]) -> Result<HashMap<String, i32>, MetadataError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MetadataError::RetriesExhausted {
                attempts: 3,
                message: "registry unavailable".to_string(),
            });
        }
        let decimals = self.decimals.lock();
        Ok(units
            .iter()
            .filter_map(|u| decimals.get(u).map(|d| (u.clone(), *d)))
            .collect())
    }
}

/// Publisher keeping the payload of every event it is handed
#[derive(Default)]
pub struct RecordingPublisher {
    payloads: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl PricePublisher for RecordingPublisher {
    async fn publish(&self, event: &PriceEvent) -> Result<(), PublishError> {
        self.payloads.lock().push(encode_event(event)?);
        Ok(())
    }
}

/// What a scripted node session delivers
#[derive(Debug, Clone)]
pub enum NodeStep {
    RollBackward(ChainPoint),
    RollForward(Block),
    IntersectNotFound(ChainPoint),
}

/// Node client replaying one script per delivery session. A session that runs
/// out of steps idles until stopped, like a node waiting for new blocks.
#[derive(Default)]
pub struct ScriptedNode {
    sessions: Mutex<VecDeque<Vec<NodeStep>>>,
    starts: Mutex<Vec<ChainPoint>>,
    session: Mutex<CancellationToken>,
    connect_failures: AtomicU32,
    connects: AtomicU32,
    keep_alives: AtomicU32,
    keep_alives_fail: AtomicBool,
}

impl ScriptedNode {
    pub fn new(sessions: Vec<Vec<NodeStep>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            ..Default::default()
        }
    }

    pub fn failing_connects(self, failures: u32) -> Self {
        self.connect_failures.store(failures, Ordering::SeqCst);
        self
    }

    /// Every keep-alive is rejected, like a half-open socket
    pub fn failing_keep_alives(self) -> Self {
        self.keep_alives_fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn keep_alives(&self) -> u32 {
        self.keep_alives.load(Ordering::SeqCst)
    }

    /// Start points of every delivery session so far
    pub fn starts(&self) -> Vec<ChainPoint> {
        self.starts.lock().clone()
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeClient for ScriptedNode {
    async fn connect(&self) -> Result<(), NodeError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(NodeError::NotConnected);
        }
        Ok(())
    }

    async fn start_block_delivery(
        &self,
        from: ChainPoint,
        listener: Arc<dyn BlockListener>,
    ) -> Result<(), NodeError> {
        let session = CancellationToken::new();
        *self.session.lock() = session.clone();
        self.starts.lock().push(from);
        let steps = self.sessions.lock().pop_front().unwrap_or_default();

        for step in steps {
            if session.is_cancelled() {
                return Ok(());
            }
            match step {
                NodeStep::RollBackward(point) => listener.on_rollback(point).await,
                NodeStep::RollForward(block) => listener.on_block(block).await,
                NodeStep::IntersectNotFound(tip) => listener.on_intersect_not_found(tip).await,
            }
        }
        session.cancelled().await;
        Ok(())
    }

    async fn send_keep_alive(&self, _nonce: u32) -> Result<(), NodeError> {
        self.keep_alives.fetch_add(1, Ordering::SeqCst);
        if self.keep_alives_fail.load(Ordering::SeqCst) {
            return Err(NodeError::NotConnected);
        }
        Ok(())
    }

    async fn stop(&self) {
        self.session.lock().cancel();
    }
}

/// Dispatcher wired to the given store and chain database
pub struct TestPipeline {
    pub dispatcher: Dispatcher,
    pub metrics: Arc<PrometheusMetrics>,
    pub buffer: Arc<LatestPriceBuffer>,
    pub prices: Arc<PriceProcessor>,
}

pub fn test_pipeline(
    store: Arc<dyn Store>,
    chain_db: Arc<dyn ChainDatabase>,
    metadata: Arc<dyn TokenMetadata>,
) -> TestPipeline {
    let clock = SlotClock::mainnet();
    let metrics = Arc::new(PrometheusMetrics::new());
    let buffer = Arc::new(LatestPriceBuffer::new());
    let prices = Arc::new(PriceProcessor::new(store.clone(), metadata, clock));
    let swaps = Arc::new(
        SwapProcessor::new(classifier::registry(), chain_db).with_retry_delay(Duration::from_millis(5)),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        swaps,
        prices.clone(),
        CandleService::new(store, clock),
        buffer.clone(),
        metrics.clone(),
    );
    TestPipeline {
        dispatcher,
        metrics,
        buffer,
        prices,
    }
}
