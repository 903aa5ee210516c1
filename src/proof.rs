//! Proof construction against the source chain
//!
//! A packet emitted at height `h` lives in the state committed by the app hash
//! of header `h + 1`, so every proof is requested for `proven_height = h + 1`:
//! the light client is advanced with `create_update_client_data(h + 1)` and the
//! store is queried at `h`, whose proof verifies against that header.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cosmrs::AccountId;
use ics23::commitment_proof::Proof;
use ics23::{CommitmentProof, ExistenceProof};
use prost::Message;
use serde::Serialize;
use tendermint::block::{Commit, Header};
use tendermint::merkle::proof::ProofOps;
use tendermint::validator;
use tracing::{debug, info};

use crate::chain::SourceChain;
use crate::error::RelayError;
use crate::writers::retry::{with_retry, RetryPolicy};

/// ABCI path for raw wasm contract storage
pub const WASM_STORE_PATH: &str = "/store/wasm/key";
/// Prefix of contract storage inside the wasm module store
const CONTRACT_STORE_PREFIX: u8 = 0x03;

/// Everything the destination light client needs to trust `height`
#[derive(Debug, Clone, Serialize)]
pub struct LightClientUpdateData {
    pub height: u64,
    pub header: Header,
    /// Signatures over `header`, taken from block `height + 1`
    pub last_commit: Commit,
    pub validators: Vec<validator::Info>,
}

/// Produces the proofs attached to relay messages
#[async_trait]
pub trait ProofSource: Send + Sync {
    async fn get_packet_proofs(
        &self,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError>;

    async fn get_ack_packet_proofs(
        &self,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError>;

    async fn create_update_client_data(
        &self,
        height: u64,
    ) -> Result<LightClientUpdateData, RelayError>;
}

/// Storage namespaces of the bridge contract's commitment maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentNamespaces {
    pub packet: String,
    pub ack: String,
}

impl Default for CommitmentNamespaces {
    fn default() -> Self {
        Self {
            packet: "send_packet_commitment".to_string(),
            ack: "ack_commitment".to_string(),
        }
    }
}

/// [`ProofSource`] reading consensus data and wasm storage proofs from a
/// [`SourceChain`]
pub struct ProofBuilder {
    source: Arc<dyn SourceChain>,
    contract_prefix: Vec<u8>,
    namespaces: CommitmentNamespaces,
    retry: RetryPolicy,
}

impl ProofBuilder {
    /// `bridge_address` is the bech32 address of the source bridge contract
    pub fn new(
        source: Arc<dyn SourceChain>,
        bridge_address: &str,
        namespaces: CommitmentNamespaces,
        retry: RetryPolicy,
    ) -> Result<Self, RelayError> {
        let account = AccountId::from_str(bridge_address).map_err(|e| {
            RelayError::Config(format!("invalid bridge address {}: {}", bridge_address, e))
        })?;

        let mut contract_prefix = vec![CONTRACT_STORE_PREFIX];
        contract_prefix.extend_from_slice(&account.to_bytes());

        Ok(Self {
            source,
            contract_prefix,
            namespaces,
            retry,
        })
    }

    /// Raw store key of `seq` inside the map stored under `namespace`
    pub fn commitment_key(&self, namespace: &str, seq: u64) -> Vec<u8> {
        let mut key = self.contract_prefix.clone();
        key.extend_from_slice(&map_key(namespace, seq));
        key
    }

    async fn commitment_proofs(
        &self,
        namespace: &str,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError> {
        let query_height = proven_height.checked_sub(1).ok_or_else(|| {
            RelayError::ProofConstruction("proven height must be at least 1".to_string())
        })?;
        let key = self.commitment_key(namespace, seq);

        let ops = with_retry(&self.retry, "query_commitment_proof", || {
            let key = key.clone();
            async move {
                let ops = self
                    .source
                    .query_proof(WASM_STORE_PATH, key, query_height)
                    .await?;
                existence_proofs(&ops)
            }
        })
        .await?;

        debug!(
            namespace,
            seq,
            proven_height,
            proofs = ops.len(),
            "Built commitment proofs"
        );
        Ok(ops)
    }
}

/// Key of a `u64`-keyed map: `u16_be(len(ns)) || ns || u64_be(seq)`
pub fn map_key(namespace: &str, seq: u64) -> Vec<u8> {
    let ns = namespace.as_bytes();
    let mut key = Vec::with_capacity(2 + ns.len() + 8);
    key.extend_from_slice(&(ns.len() as u16).to_be_bytes());
    key.extend_from_slice(ns);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Decode every proof op into its ICS-23 existence proof, leaf first
pub fn existence_proofs(ops: &ProofOps) -> Result<Vec<ExistenceProof>, RelayError> {
    if ops.ops.is_empty() {
        return Err(RelayError::ProofConstruction(
            "proof has no operations".to_string(),
        ));
    }

    ops.ops
        .iter()
        .map(|op| {
            let proof = CommitmentProof::decode(op.data.as_slice()).map_err(|e| {
                RelayError::ProofConstruction(format!("undecodable {} op: {}", op.field_type, e))
            })?;
            match proof.proof {
                Some(Proof::Exist(existence)) => Ok(existence),
                _ => Err(RelayError::ProofConstruction(format!(
                    "{} op is not an existence proof",
                    op.field_type
                ))),
            }
        })
        .collect()
}

/// Consensus fetches surface every failure as retryable proof construction;
/// a block that does not exist yet usually appears a few seconds later.
fn consensus_error(what: &str, height: u64, e: RelayError) -> RelayError {
    match e {
        RelayError::Transport(_) => e,
        other => RelayError::ProofConstruction(format!("{} at {}: {}", what, height, other)),
    }
}

#[async_trait]
impl ProofSource for ProofBuilder {
    async fn get_packet_proofs(
        &self,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError> {
        self.commitment_proofs(&self.namespaces.packet, proven_height, seq)
            .await
    }

    async fn get_ack_packet_proofs(
        &self,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError> {
        self.commitment_proofs(&self.namespaces.ack, proven_height, seq)
            .await
    }

    async fn create_update_client_data(
        &self,
        height: u64,
    ) -> Result<LightClientUpdateData, RelayError> {
        let data = with_retry(&self.retry, "create_update_client_data", || async move {
            // All three or nothing
            let (header, last_commit, validators) = tokio::try_join!(
                async {
                    self.source
                        .block_header(height)
                        .await
                        .map_err(|e| consensus_error("header", height, e))
                },
                async {
                    self.source
                        .last_commit(height + 1)
                        .await
                        .map_err(|e| consensus_error("commit", height + 1, e))
                },
                async {
                    self.source
                        .validators(height)
                        .await
                        .map_err(|e| consensus_error("validators", height, e))
                },
            )?;

            Ok(LightClientUpdateData {
                height,
                header,
                last_commit,
                validators,
            })
        })
        .await?;

        info!(height, validators = data.validators.len(), "Built light client update");
        Ok(data)
    }
}
