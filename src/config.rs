//! Process configuration loaded from the environment

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::services::publisher::DEFAULT_PRICE_CHANNEL;

const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_NODE_WS_URL: &str = "NODE_WS_URL";
const ENV_CHAIN_DB_URL: &str = "CHAIN_DB_URL";
const ENV_TOKEN_REGISTRY_URL: &str = "TOKEN_REGISTRY_URL";
const ENV_START_TIME: &str = "START_TIME";
const ENV_EVENT_PUBLISHING_ENABLED: &str = "EVENT_PUBLISHING_ENABLED";
const ENV_INACTIVITY_TIMEOUT: &str = "INACTIVITY_TIMEOUT_SECS";
const ENV_MAX_SYNC_RESTARTS: &str = "MAX_SYNC_RESTARTS";
const ENV_KEEP_ALIVE_INTERVAL: &str = "KEEP_ALIVE_INTERVAL_SECS";
const ENV_MONITOR_INTERVAL: &str = "MONITOR_INTERVAL_SECS";
const ENV_CANDLE_TZ_OFFSET: &str = "CANDLE_TZ_OFFSET_SECS";
const ENV_RUN_MODE: &str = "RUN_MODE";
const ENV_CHAIN_DB_PROVIDER: &str = "CHAIN_DB_PROVIDER";
const ENV_BLOCKFROST_URL: &str = "BLOCKFROST_URL";
const ENV_BLOCKFROST_PROJECT_ID: &str = "BLOCKFROST_PROJECT_ID";
const ENV_YACISTORE_API_KEY: &str = "YACISTORE_API_KEY";
const ENV_REDIS_URL: &str = "REDIS_URL";
const ENV_PRICE_CHANNEL: &str = "PRICE_CHANNEL";
const ENV_METRICS_ADDR: &str = "METRICS_ADDR";

const DEFAULT_NODE_WS_URL: &str = "ws://localhost:1337";
const DEFAULT_CHAIN_DB_URL: &str = "https://api.koios.rest/api/v1";
const DEFAULT_TOKEN_REGISTRY_URL: &str = "https://tokens.cardano.org";
const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 180;
const DEFAULT_MAX_SYNC_RESTARTS: u32 = 3;
const DEFAULT_KEEP_ALIVE_INTERVAL_SECS: u64 = 8;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;
const DEFAULT_BLOCKFROST_URL: &str = "https://cardano-mainnet.blockfrost.io/api/v0";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Whether the indexer follows the tip forever or stops once it reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Livesync,
    Oneshot,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "livesync" => Ok(Self::Livesync),
            "oneshot" => Ok(Self::Oneshot),
            other => Err(other.to_string()),
        }
    }
}

/// Source of block lookups and spent output contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainDbProvider {
    #[default]
    Koios,
    Blockfrost,
    /// YaciStore for outputs, Blockfrost for block lookups
    YaciStore,
}

impl FromStr for ChainDbProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "koios" => Ok(Self::Koios),
            "blockfrost" => Ok(Self::Blockfrost),
            "yacistore" => Ok(Self::YaciStore),
            other => Err(other.to_string()),
        }
    }
}

/// Indexer settings
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub database_url: String,
    /// Ogmios websocket endpoint
    pub node_ws_url: String,
    pub run_mode: RunMode,
    pub chain_db_provider: ChainDbProvider,
    /// Koios or YaciStore REST base url
    pub chain_db_url: String,
    pub blockfrost_url: String,
    pub blockfrost_project_id: Option<String>,
    pub yacistore_api_key: Option<String>,
    pub token_registry_url: String,
    /// Explicit sync start, epoch seconds
    pub start_time: Option<i64>,
    pub event_publishing_enabled: bool,
    pub redis_url: String,
    pub price_channel: String,
    /// Prometheus scrape endpoint, none when unset
    pub metrics_addr: Option<SocketAddr>,
    pub sync: SyncSettings,
    /// Offset from UTC used to align weekly candles
    pub candle_tz_offset_secs: i32,
}

/// Timing knobs of the chain sync controller
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_max_failures: u32,
    pub monitor_interval: Duration,
    pub inactivity_timeout: Duration,
    pub max_restarts: u32,
    pub rollback_ack_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Lag below which the controller reports itself caught up
    pub caught_up_lag: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(2),
            keep_alive_interval: Duration::from_secs(DEFAULT_KEEP_ALIVE_INTERVAL_SECS),
            keep_alive_max_failures: 5,
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_TIMEOUT_SECS),
            max_restarts: DEFAULT_MAX_SYNC_RESTARTS,
            rollback_ack_timeout: Duration::from_secs(20),
            shutdown_grace: Duration::from_secs(5),
            caught_up_lag: Duration::from_secs(15 * 60),
        }
    }
}

impl IndexerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var(ENV_DATABASE_URL).map_err(|_| ConfigError::Missing(ENV_DATABASE_URL))?;

        let start_time = env_parsed::<i64>(ENV_START_TIME)?;
        let run_mode = env_parsed::<RunMode>(ENV_RUN_MODE)?.unwrap_or_default();
        let chain_db_provider =
            env_parsed::<ChainDbProvider>(ENV_CHAIN_DB_PROVIDER)?.unwrap_or_default();
        let metrics_addr = env_parsed::<SocketAddr>(ENV_METRICS_ADDR)?;

        let blockfrost_project_id = env_non_empty(ENV_BLOCKFROST_PROJECT_ID);
        if matches!(
            chain_db_provider,
            ChainDbProvider::Blockfrost | ChainDbProvider::YaciStore
        ) && blockfrost_project_id.is_none()
        {
            return Err(ConfigError::Missing(ENV_BLOCKFROST_PROJECT_ID));
        }
        let chain_db_url = match (chain_db_provider, env_non_empty(ENV_CHAIN_DB_URL)) {
            (_, Some(url)) => url,
            (ChainDbProvider::YaciStore, None) => return Err(ConfigError::Missing(ENV_CHAIN_DB_URL)),
            _ => DEFAULT_CHAIN_DB_URL.to_string(),
        };

        let sync = SyncSettings {
            keep_alive_interval: Duration::from_secs(env_or(
                ENV_KEEP_ALIVE_INTERVAL,
                DEFAULT_KEEP_ALIVE_INTERVAL_SECS,
            )),
            monitor_interval: Duration::from_secs(env_or(
                ENV_MONITOR_INTERVAL,
                DEFAULT_MONITOR_INTERVAL_SECS,
            )),
            inactivity_timeout: Duration::from_secs(env_or(
                ENV_INACTIVITY_TIMEOUT,
                DEFAULT_INACTIVITY_TIMEOUT_SECS,
            )),
            max_restarts: env_or(ENV_MAX_SYNC_RESTARTS, DEFAULT_MAX_SYNC_RESTARTS),
            ..SyncSettings::default()
        };

        Ok(Self {
            database_url,
            node_ws_url: env::var(ENV_NODE_WS_URL).unwrap_or_else(|_| DEFAULT_NODE_WS_URL.to_string()),
            run_mode,
            chain_db_provider,
            chain_db_url,
            blockfrost_url: env::var(ENV_BLOCKFROST_URL)
                .unwrap_or_else(|_| DEFAULT_BLOCKFROST_URL.to_string()),
            blockfrost_project_id,
            yacistore_api_key: env_non_empty(ENV_YACISTORE_API_KEY),
            token_registry_url: env::var(ENV_TOKEN_REGISTRY_URL)
                .unwrap_or_else(|_| DEFAULT_TOKEN_REGISTRY_URL.to_string()),
            start_time,
            event_publishing_enabled: env::var(ENV_EVENT_PUBLISHING_ENABLED)
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            redis_url: env::var(ENV_REDIS_URL).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            price_channel: env::var(ENV_PRICE_CHANNEL)
                .unwrap_or_else(|_| DEFAULT_PRICE_CHANNEL.to_string()),
            metrics_addr,
            sync,
            candle_tz_offset_secs: env_or(ENV_CANDLE_TZ_OFFSET, 0),
        })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Optional variable that must parse when present
fn env_parsed<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    parse_optional(name, env_non_empty(name))
}

fn parse_optional<T: FromStr>(name: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: value.clone() })
    })
    .transpose()
}
