//! Shared mocks for the relay integration tests
//!
//! `MockSource` stands in for the Cosmos RPC node, `MockDestination` for the
//! TON wallet and bridge, `MockProofSource` for the proof builder when a test
//! only exercises the pipeline.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ics23::commitment_proof::Proof;
use ics23::{CommitmentProof, ExistenceProof};
use prost::Message;
use tendermint::block::{self, Commit, Header, Height, Round};
use tendermint::merkle::proof::{ProofOp, ProofOps};
use tendermint::{account, chain, validator, AppHash, Hash, Time};
use tokio::time::Instant;

use tonbridge_relayer::chain::{
    BridgeConfig, BroadcastReceipt, Destination, QueryTag, RawTx, RelayMessage, SourceChain,
    TxEvent,
};
use tonbridge_relayer::error::RelayError;
use tonbridge_relayer::proof::{LightClientUpdateData, ProofSource};
use tonbridge_relayer::types::{Packet, Provenance, Source, TransferPacket};

/// Valid bech32 address used as the source bridge contract
pub const BRIDGE: &str = "orai1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5z5tpwxqergd3c8g7rusqgy8wuj";
pub const LIGHT_CLIENT: &str = "EQ-light-client";
pub const WALLET: &str = "EQ-relayer-wallet";

// ============================================================================
// Fixtures
// ============================================================================

pub fn header(height: u64) -> Header {
    Header {
        version: block::header::Version { block: 11, app: 0 },
        chain_id: chain::Id::try_from("Oraichain".to_string()).unwrap(),
        height: Height::try_from(height).unwrap(),
        time: Time::unix_epoch(),
        last_block_id: None,
        last_commit_hash: None,
        data_hash: None,
        validators_hash: Hash::None,
        next_validators_hash: Hash::None,
        consensus_hash: Hash::None,
        app_hash: AppHash::default(),
        last_results_hash: None,
        evidence_hash: None,
        proposer_address: account::Id::new([7u8; 20]),
    }
}

pub fn commit(height: u64) -> Commit {
    Commit {
        height: Height::try_from(height).unwrap(),
        round: Round::default(),
        block_id: block::Id::default(),
        signatures: Vec::new(),
    }
}

pub fn update_data(height: u64) -> LightClientUpdateData {
    LightClientUpdateData {
        height,
        header: header(height),
        last_commit: commit(height + 1),
        validators: Vec::new(),
    }
}

pub fn existence(key: &[u8]) -> ExistenceProof {
    ExistenceProof {
        key: key.to_vec(),
        value: b"commitment".to_vec(),
        ..Default::default()
    }
}

/// Proof ops as returned by `abci_query(prove = true)` on a wasm key
pub fn existence_ops(key: &[u8]) -> ProofOps {
    let proof = CommitmentProof {
        proof: Some(Proof::Exist(existence(key))),
    };
    ProofOps {
        ops: vec![ProofOp {
            field_type: "ics23:iavl".to_string(),
            key: key.to_vec(),
            data: proof.encode_to_vec(),
        }],
    }
}

/// A successful transaction emitting one `send_to_ton` from `contract`
pub fn send_to_ton_tx(
    hash: &str,
    height: u64,
    contract: &str,
    seq: u64,
    to: &str,
    denom: &str,
    amount: &str,
) -> RawTx {
    let seq = seq.to_string();
    RawTx {
        hash: hash.to_string(),
        height,
        index: 0,
        timestamp: "2024-06-01T00:00:00Z".to_string(),
        code: 0,
        events: vec![
            TxEvent::new("message", &[("action", "/cosmwasm.wasm.v1.MsgExecuteContract")]),
            TxEvent::new(
                "wasm",
                &[
                    ("_contract_address", contract),
                    ("action", "send_to_ton"),
                    ("seq", seq.as_str()),
                    ("to", to),
                    ("denom", denom),
                    ("amount", amount),
                    ("crc_src", "3335846818"),
                ],
            ),
        ],
    }
}

pub fn transfer(seq: u64, height: u64) -> Packet {
    Packet::Transfer(TransferPacket {
        seq,
        to: "EQ-recipient".to_string(),
        denom: "EQ-jetton".to_string(),
        amount: 1_000 * seq as u128,
        src: Source::Cosmos,
        timeout_timestamp: None,
        provenance: Provenance {
            hash: format!("TX{}", seq),
            height,
            tx_index: 0,
            event_index: 0,
            timestamp: "2024-06-01T00:00:00Z".to_string(),
        },
    })
}

// ============================================================================
// Source chain
// ============================================================================

#[derive(Default)]
pub struct MockSource {
    latest: AtomicU64,
    txs: Mutex<Vec<RawTx>>,
    proof_failures: AtomicU32,
    missing_commits: AtomicBool,
    missing_ranges: AtomicBool,
    /// Ranges passed to `search_txs`
    pub searches: Mutex<Vec<(u64, u64)>>,
    /// (key, height) of every proof query
    pub proof_queries: Mutex<Vec<(Vec<u8>, u64)>>,
    pub header_queries: Mutex<Vec<u64>>,
    pub commit_queries: Mutex<Vec<u64>>,
    pub validator_queries: Mutex<Vec<u64>>,
}

impl MockSource {
    pub fn new(latest: u64) -> Self {
        let source = Self::default();
        source.set_latest(latest);
        source
    }

    pub fn set_latest(&self, latest: u64) {
        self.latest.store(latest, Ordering::SeqCst);
    }

    pub fn push_tx(&self, tx: RawTx) {
        self.txs.lock().unwrap().push(tx);
    }

    /// Fail the next `n` proof queries with a transport error
    pub fn fail_proofs(&self, n: u32) {
        self.proof_failures.store(n, Ordering::SeqCst);
    }

    /// Make every commit lookup fail as if the block were not produced yet
    pub fn missing_commits(&self, missing: bool) {
        self.missing_commits.store(missing, Ordering::SeqCst);
    }

    /// Make every tx search fail as if the node had pruned the range
    pub fn missing_ranges(&self, missing: bool) {
        self.missing_ranges.store(missing, Ordering::SeqCst);
    }

    pub fn first_search_from(&self) -> Option<u64> {
        self.searches.lock().unwrap().iter().map(|(from, _)| *from).min()
    }
}

#[async_trait]
impl SourceChain for MockSource {
    async fn latest_height(&self) -> Result<u64, RelayError> {
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn search_txs(
        &self,
        from: u64,
        to: u64,
        _tags: &[QueryTag],
    ) -> Result<Vec<RawTx>, RelayError> {
        self.searches.lock().unwrap().push((from, to));
        if self.missing_ranges.load(Ordering::SeqCst) {
            return Err(RelayError::NotFound(
                "HTTP status client error (404 Not Found)".to_string(),
            ));
        }
        let mut txs: Vec<RawTx> = self
            .txs
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| tx.height >= from && tx.height <= to)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.height, tx.index));
        Ok(txs)
    }

    async fn block_header(&self, height: u64) -> Result<Header, RelayError> {
        self.header_queries.lock().unwrap().push(height);
        Ok(header(height))
    }

    async fn last_commit(&self, height: u64) -> Result<Commit, RelayError> {
        self.commit_queries.lock().unwrap().push(height);
        if self.missing_commits.load(Ordering::SeqCst) {
            return Err(RelayError::NotFound(format!("block {} not produced", height)));
        }
        Ok(commit(height))
    }

    async fn validators(&self, height: u64) -> Result<Vec<validator::Info>, RelayError> {
        self.validator_queries.lock().unwrap().push(height);
        Ok(Vec::new())
    }

    async fn query_proof(
        &self,
        _path: &str,
        key: Vec<u8>,
        height: u64,
    ) -> Result<ProofOps, RelayError> {
        self.proof_queries.lock().unwrap().push((key.clone(), height));
        let remaining = self.proof_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.proof_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::Transport("proof node unavailable".to_string()));
        }
        Ok(existence_ops(&key))
    }
}

// ============================================================================
// Destination chain
// ============================================================================

/// A broadcast seen by the mock wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub sequence: u64,
    pub label: &'static str,
    pub proven_height: u64,
    /// Packet sequence for `recv_packet`
    pub packet_seq: Option<u64>,
}

struct Pending {
    message: RelayMessage,
    message_hash: String,
    land_at: Instant,
}

/// Sequence-addressed wallet: a broadcast lands one second after submission
/// and bumps the sequence the next time it is read.
pub struct MockDestination {
    account: String,
    light_client: Mutex<String>,
    trusted: AtomicU64,
    sequence: AtomicU64,
    pending: Mutex<Vec<Pending>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reject_next: Mutex<Option<String>>,
    never_land: AtomicBool,
    indexes_messages: AtomicBool,
    landed: Mutex<HashSet<String>>,
    balance: AtomicU64,
    balance_error: Mutex<Option<String>>,
    pub broadcasts: Mutex<Vec<Broadcast>>,
}

impl MockDestination {
    pub fn new(trusted: u64) -> Self {
        Self {
            account: WALLET.to_string(),
            light_client: Mutex::new(LIGHT_CLIENT.to_string()),
            trusted: AtomicU64::new(trusted),
            sequence: AtomicU64::new(7),
            pending: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reject_next: Mutex::new(None),
            never_land: AtomicBool::new(false),
            indexes_messages: AtomicBool::new(false),
            landed: Mutex::new(HashSet::new()),
            balance: AtomicU64::new(10_000_000_000),
            balance_error: Mutex::new(None),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_light_client(&self, address: &str) {
        *self.light_client.lock().unwrap() = address.to_string();
    }

    pub fn reject_next(&self, reason: &str) {
        *self.reject_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn never_land(&self, never: bool) {
        self.never_land.store(never, Ordering::SeqCst);
    }

    /// Answer message-hash lookups instead of reporting no index
    pub fn index_messages(&self, index: bool) {
        self.indexes_messages.store(index, Ordering::SeqCst);
    }

    /// Record a message as landed, e.g. broadcast by an earlier run
    pub fn mark_landed(&self, message_hash: &str) {
        self.landed.lock().unwrap().insert(message_hash.to_string());
    }

    pub fn set_balance(&self, balance: u64) {
        self.balance.store(balance, Ordering::SeqCst);
    }

    pub fn fail_balance(&self, reason: &str) {
        *self.balance_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn trusted(&self) -> u64 {
        self.trusted.load(Ordering::SeqCst)
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Most broadcasts ever awaiting confirmation at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.broadcasts().iter().map(|b| b.label).collect()
    }

    fn land_due(&self) {
        if self.never_land.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        let (due, waiting): (Vec<Pending>, Vec<Pending>) =
            pending.drain(..).partition(|p| p.land_at <= now);
        *pending = waiting;

        for landed in due {
            self.landed.lock().unwrap().insert(landed.message_hash.clone());
            if let RelayMessage::UpdateClient(data) = &landed.message {
                self.trusted.fetch_max(data.height, Ordering::SeqCst);
            }
            self.sequence.fetch_add(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Destination for MockDestination {
    fn account(&self) -> &str {
        &self.account
    }

    async fn bridge_config(&self) -> Result<BridgeConfig, RelayError> {
        Ok(BridgeConfig {
            light_client: self.light_client.lock().unwrap().clone(),
            bridge_wasm: Some(BRIDGE.to_string()),
        })
    }

    async fn trusted_height(&self) -> Result<u64, RelayError> {
        self.land_due();
        Ok(self.trusted.load(Ordering::SeqCst))
    }

    async fn sequence(&self) -> Result<u64, RelayError> {
        self.land_due();
        Ok(self.sequence.load(Ordering::SeqCst))
    }

    async fn submit(
        &self,
        sequence: u64,
        message: &RelayMessage,
    ) -> Result<BroadcastReceipt, RelayError> {
        if let Some(reason) = self.reject_next.lock().unwrap().take() {
            return Err(RelayError::Submission(reason));
        }

        let (proven_height, packet_seq) = match message {
            RelayMessage::UpdateClient(data) => (data.height, None),
            RelayMessage::RecvPacket {
                proven_height,
                packet,
                ..
            } => (*proven_height, Some(packet.seq())),
        };
        let mut broadcasts = self.broadcasts.lock().unwrap();
        broadcasts.push(Broadcast {
            sequence,
            label: message.label(),
            proven_height,
            packet_seq,
        });
        let message_hash = format!("msg-{}-{}", message.label(), broadcasts.len());

        self.pending.lock().unwrap().push(Pending {
            message: message.clone(),
            message_hash: message_hash.clone(),
            land_at: Instant::now() + Duration::from_secs(1),
        });
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        Ok(BroadcastReceipt {
            message_hash,
            sequence,
        })
    }

    async fn transaction_landed(
        &self,
        receipt: &BroadcastReceipt,
    ) -> Result<Option<bool>, RelayError> {
        if !self.indexes_messages.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.land_due();
        Ok(Some(self.landed.lock().unwrap().contains(&receipt.message_hash)))
    }

    async fn balance(&self, _address: &str) -> Result<u128, RelayError> {
        if let Some(reason) = self.balance_error.lock().unwrap().clone() {
            return Err(RelayError::Transport(reason));
        }
        Ok(self.balance.load(Ordering::SeqCst) as u128)
    }
}

// ============================================================================
// Proof source
// ============================================================================

/// Proof source answering instantly unless told to fail or stall
#[derive(Default)]
pub struct MockProofSource {
    fail_packets: AtomicBool,
    /// Per packet sequence delay before the proof is returned
    delays: Mutex<HashMap<u64, Duration>>,
    pub packet_calls: Mutex<Vec<(u64, u64)>>,
    pub ack_calls: Mutex<Vec<(u64, u64)>>,
    pub update_calls: Mutex<Vec<u64>>,
}

impl MockProofSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_packets(&self, fail: bool) {
        self.fail_packets.store(fail, Ordering::SeqCst);
    }

    pub fn delay(&self, seq: u64, delay: Duration) {
        self.delays.lock().unwrap().insert(seq, delay);
    }
}

#[async_trait]
impl ProofSource for MockProofSource {
    async fn get_packet_proofs(
        &self,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError> {
        self.packet_calls.lock().unwrap().push((proven_height, seq));
        let delay = self.delays.lock().unwrap().get(&seq).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_packets.load(Ordering::SeqCst) {
            return Err(RelayError::ProofConstruction(format!(
                "no commitment for seq {}",
                seq
            )));
        }
        Ok(vec![existence(&seq.to_be_bytes())])
    }

    async fn get_ack_packet_proofs(
        &self,
        proven_height: u64,
        seq: u64,
    ) -> Result<Vec<ExistenceProof>, RelayError> {
        self.ack_calls.lock().unwrap().push((proven_height, seq));
        Ok(vec![existence(&seq.to_be_bytes())])
    }

    async fn create_update_client_data(
        &self,
        height: u64,
    ) -> Result<LightClientUpdateData, RelayError> {
        self.update_calls.lock().unwrap().push(height);
        Ok(update_data(height))
    }
}
