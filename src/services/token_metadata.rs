//! Token decimals lookup against the Cardano token registry

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::MetadataError;

/// Subjects per registry query
pub const METADATA_CHUNK_SIZE: usize = 50;

/// Attempts per chunk before giving up
pub const METADATA_MAX_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait TokenMetadata: Send + Sync {
    /// Decimals for the units the registry knows. Unknown units are left out.
    async fn get_decimals(&self, units: &[String]) -> Result<HashMap<String, i32>, MetadataError>;
}

#[derive(Clone)]
pub struct TokenRegistryClient {
    client: Client,
    base_url: String,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    subjects: &'a [String],
    properties: [&'static str; 1],
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    subjects: Vec<SubjectEntry>,
}

#[derive(Debug, Deserialize)]
struct SubjectEntry {
    subject: String,
    decimals: Option<DecimalsProperty>,
}

#[derive(Debug, Deserialize)]
struct DecimalsProperty {
    value: i32,
}

impl TokenRegistryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MetadataError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(15)).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_delay: Duration::from_secs(1),
        })
    }

    async fn query_chunk(&self, subjects: &[String]) -> Result<QueryResponse, MetadataError> {
        let url = format!("{}/metadata/query", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&QueryRequest {
                subjects,
                properties: ["decimals"],
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl TokenMetadata for TokenRegistryClient {
    async fn get_decimals(&self, units: &[String]) -> Result<HashMap<String, i32>, MetadataError> {
        let mut decimals = HashMap::new();

        for chunk in units.chunks(METADATA_CHUNK_SIZE) {
            let mut attempt = 0;
            let response = loop {
                attempt += 1;
                match self.query_chunk(chunk).await {
                    Ok(response) => break response,
                    Err(e) if attempt < METADATA_MAX_ATTEMPTS => {
                        warn!(attempt = attempt, error = %e, "Token registry query failed, retrying");
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    Err(e) => {
                        return Err(MetadataError::RetriesExhausted {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                }
            };

            decimals.extend(collect_decimals(response));
        }

        debug!(requested = units.len(), found = decimals.len(), "Fetched token decimals");
        Ok(decimals)
    }
}

fn collect_decimals(response: QueryResponse) -> impl Iterator<Item = (String, i32)> {
    response
        .subjects
        .into_iter()
        .filter_map(|s| s.decimals.map(|d| (s.subject, d.value)))
}
