//! Block to swaps
//!
//! Qualifies a block's transactions against the known pool credentials,
//! resolves the outputs they spend and routes each one to its DEX classifier.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ChainDbError;
use crate::models::chain::{Block, Transaction, TxInRef, Utxo};
use crate::models::swap::{QualifiedTransaction, Swap};
use crate::services::chain_db::ChainDatabase;
use crate::services::classifier::{self, DexClassifier};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Attempts between warnings while the chain database lags behind
const WARN_EVERY_N_ATTEMPTS: u32 = 10;

/// A transaction paying to a pool, before its inputs are resolved
#[derive(Clone)]
pub struct Candidate<'a> {
    pub tx: &'a Transaction,
    pub credential: String,
    pub classifier: Arc<dyn DexClassifier>,
}

pub struct SwapProcessor {
    by_credential: HashMap<String, Arc<dyn DexClassifier>>,
    chain_db: Arc<dyn ChainDatabase>,
    retry_delay: Duration,
}

impl SwapProcessor {
    pub fn new(classifiers: Vec<Arc<dyn DexClassifier>>, chain_db: Arc<dyn ChainDatabase>) -> Self {
        Self {
            by_credential: classifier::credential_index(&classifiers),
            chain_db,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Valid transactions with an output at a known pool address. The first
    /// matching output decides the classifier.
    pub fn qualify<'a>(&self, block: &'a Block) -> Vec<Candidate<'a>> {
        block
            .transactions
            .iter()
            .filter(|tx| tx.valid)
            .filter_map(|tx| {
                tx.outputs.iter().find_map(|out| {
                    let credential = out.payment_credential()?;
                    let classifier = self.by_credential.get(&credential)?;
                    Some(Candidate {
                        tx,
                        credential,
                        classifier: Arc::clone(classifier),
                    })
                })
            })
            .collect()
    }

    /// Swaps of a block in transaction order
    pub async fn process_block(&self, block: &Block) -> Result<Vec<Swap>, ChainDbError> {
        let candidates = self.qualify(block);
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let mut seen = HashSet::new();
        let refs: Vec<TxInRef> = candidates
            .iter()
            .flat_map(|c| c.tx.inputs.iter())
            .filter(|r| seen.insert(*r))
            .cloned()
            .collect();
        let resolved = self.resolve_inputs(&refs).await?;
        let by_ref: HashMap<TxInRef, Utxo> = resolved
            .into_iter()
            .map(|u| (u.reference(), u))
            .collect();

        let mut swaps = Vec::new();
        for candidate in candidates {
            let mut ordered = candidate.tx.inputs.clone();
            ordered.sort();
            let input_utxos: Vec<Utxo> = ordered
                .iter()
                .filter_map(|r| by_ref.get(r).cloned())
                .collect();
            if input_utxos.is_empty() {
                debug!(tx = %candidate.tx.hash, "No inputs resolved, skipping transaction");
                continue;
            }

            let qualified = QualifiedTransaction {
                tx_hash: candidate.tx.hash.clone(),
                dex_code: candidate.classifier.dex_code(),
                dex_credential: candidate.credential,
                block_slot: block.slot(),
                input_utxos,
                output_utxos: candidate.tx.outputs.clone(),
                witness_datums: candidate.tx.witness_datums.clone(),
                redeemers: candidate.tx.redeemers.clone(),
            };
            let found = candidate.classifier.compute_swaps(&qualified);
            debug!(
                tx = %qualified.tx_hash,
                dex = candidate.classifier.dex_name(),
                swaps = found.len(),
                "Classified transaction"
            );
            swaps.extend(found);
        }
        Ok(swaps)
    }

    /// Polls until every ref resolves. The chain database trails the node, so a
    /// partial answer means "not yet", not "never".
    async fn resolve_inputs(&self, refs: &[TxInRef]) -> Result<Vec<Utxo>, ChainDbError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.chain_db.get_input_utxos(refs).await {
                Ok(utxos) if utxos.len() >= refs.len() => return Ok(utxos),
                Ok(utxos) => {
                    if attempt % WARN_EVERY_N_ATTEMPTS == 0 {
                        warn!(
                            attempt = attempt,
                            resolved = utxos.len(),
                            wanted = refs.len(),
                            "Chain database still behind, waiting"
                        );
                    } else {
                        debug!(attempt = attempt, resolved = utxos.len(), wanted = refs.len(), "Inputs not yet indexed");
                    }
                }
                Err(e) => {
                    if attempt % WARN_EVERY_N_ATTEMPTS == 0 {
                        warn!(attempt = attempt, error = %e, "Input lookup failing, retrying");
                    } else {
                        debug!(attempt = attempt, error = %e, "Input lookup failed");
                    }
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
