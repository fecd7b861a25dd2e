//! Error types shared across the indexer

use thiserror::Error;

use crate::services::datum::DatumError;

/// Failures of the persistent store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Invalid view name: {0}")]
    InvalidViewName(String),

    #[error("Invalid transaction hash: {0}")]
    InvalidHash(String),
}

/// Failures talking to the chain database
#[derive(Debug, Error)]
pub enum ChainDbError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Failures of the token metadata lookup
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Metadata lookup failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

/// Failures of the node protocol client
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Failures of outbound price publication
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failures while handling a pipeline event
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain database error: {0}")]
    ChainDb(#[from] ChainDbError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Datum error: {0}")]
    Datum(#[from] DatumError),

    #[error("Pipeline consumer is gone")]
    ConsumerGone,
}

/// Conditions that end a chain sync session
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Node unreachable after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: NodeError,
    },

    #[error("No block found at or after slot {0}")]
    NoInitialisationPoint(u64),

    #[error("Chain database error: {0}")]
    ChainDb(#[from] ChainDbError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Keep-alive failed {0} times in a row")]
    KeepAlive(u32),

    #[error("Block delivery stalled, restarted {0} times without progress")]
    Stalled(u32),

    #[error("Node client error: {0}")]
    Node(#[from] NodeError),
}

/// Conditions that stop the latest price batcher
#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("Latest price batcher failed {failures} times in a row, last error: {last}")]
    TooManyFailures { failures: u32, last: String },
}
