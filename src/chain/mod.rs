//! Chain seams
//!
//! The relay engine only talks to the outside world through the traits in
//! this module: [`SourceChain`] for the chain packets are read from and
//! [`Destination`] for the chain they are delivered to. Concrete clients live
//! in the submodules; tests plug in mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tendermint::block::{Commit, Header};
use tendermint::merkle::proof::ProofOps;
use tendermint::validator;

use crate::error::RelayError;
use crate::proof::LightClientUpdateData;
use crate::types::Packet;

pub mod codec;
pub mod cosmos;
pub mod ton;

pub use codec::{RemoteTonCodec, TonCodec};
pub use cosmos::CosmosRpcClient;
pub use ton::TonCenterClient;

// ============================================================================
// Source side
// ============================================================================

/// One attribute of a transaction event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

/// A typed event emitted by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

impl TxEvent {
    pub fn new(kind: &str, attributes: &[(&str, &str)]) -> Self {
        Self {
            kind: kind.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| EventAttribute {
                    key: k.to_string(),
                    value: v.to_string(),
                })
                .collect(),
        }
    }
}

/// A transaction as returned by the source chain's search endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx {
    pub hash: String,
    pub height: u64,
    /// Position inside the block
    pub index: u32,
    /// RFC 3339 block time
    pub timestamp: String,
    /// Execution result code, 0 on success
    pub code: u32,
    pub events: Vec<TxEvent>,
}

impl RawTx {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// `key = value` filter applied to transaction searches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTag {
    pub key: String,
    pub value: String,
}

impl QueryTag {
    /// Parse `key=value`; the value may be quoted
    pub fn parse(raw: &str) -> Option<Self> {
        let (key, value) = raw.split_once('=')?;
        let key = key.trim();
        let value = value.trim().trim_matches('\'').trim_matches('"');
        if key.is_empty() || value.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Read access to the chain packets originate on
#[async_trait]
pub trait SourceChain: Send + Sync {
    /// Height of the latest committed block
    async fn latest_height(&self) -> Result<u64, RelayError>;

    /// Transactions in `[from, to]` matching every tag, in block order
    async fn search_txs(
        &self,
        from: u64,
        to: u64,
        tags: &[QueryTag],
    ) -> Result<Vec<RawTx>, RelayError>;

    async fn block_header(&self, height: u64) -> Result<Header, RelayError>;

    /// The commit stored in block `height`, i.e. the signatures over `height - 1`
    async fn last_commit(&self, height: u64) -> Result<Commit, RelayError>;

    async fn validators(&self, height: u64) -> Result<Vec<validator::Info>, RelayError>;

    /// Merkle proof for a raw store key, evaluated against the app hash that
    /// the header at `height + 1` commits to
    async fn query_proof(
        &self,
        path: &str,
        key: Vec<u8>,
        height: u64,
    ) -> Result<ProofOps, RelayError>;
}

// ============================================================================
// Destination side
// ============================================================================

/// Addresses the destination bridge adapter is wired to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub light_client: String,
    /// Source bridge contract, when the adapter exposes it
    pub bridge_wasm: Option<String>,
}

/// A message the relayer account broadcasts to the destination
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Advance the light client to `data.height`
    UpdateClient(LightClientUpdateData),
    /// Deliver a packet with its existence proofs at `proven_height`
    RecvPacket {
        proven_height: u64,
        packet: Packet,
        proofs: Vec<ics23::ExistenceProof>,
    },
}

impl RelayMessage {
    pub fn label(&self) -> &'static str {
        match self {
            RelayMessage::UpdateClient(_) => "update_client",
            RelayMessage::RecvPacket { .. } => "recv_packet",
        }
    }
}

/// What the destination returned for an accepted broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReceipt {
    /// Hash of the external message, used to look the transaction up later
    pub message_hash: String,
    /// Relayer account sequence the message was signed with
    pub sequence: u64,
}

/// Write access to the chain packets are delivered to
#[async_trait]
pub trait Destination: Send + Sync {
    /// Relayer account; submissions from one account are serialized
    fn account(&self) -> &str;

    async fn bridge_config(&self) -> Result<BridgeConfig, RelayError>;

    /// Highest source height the destination light client has verified
    async fn trusted_height(&self) -> Result<u64, RelayError>;

    /// Current sequence of the relayer account
    async fn sequence(&self) -> Result<u64, RelayError>;

    /// Sign with `sequence` and broadcast. Never retried by callers.
    async fn submit(
        &self,
        sequence: u64,
        message: &RelayMessage,
    ) -> Result<BroadcastReceipt, RelayError>;

    /// `Some(true)` once the broadcast transaction is indexed and succeeded,
    /// `Some(false)` while it is not visible yet, `None` when the destination
    /// cannot index by message hash. A transaction that landed but failed is
    /// an `Err(Submission)`.
    async fn transaction_landed(
        &self,
        _receipt: &BroadcastReceipt,
    ) -> Result<Option<bool>, RelayError> {
        Ok(None)
    }

    /// Balance of `address` in the destination's smallest unit
    async fn balance(&self, address: &str) -> Result<u128, RelayError>;
}
