//! Packet, batch and job types shared by the watchers and the writers
//!
//! Packets are immutable once extracted and move by value from the extractor
//! into a [`Job`].

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Source tags
// ============================================================================

/// CRC32 of "COSMOS", the bridge contract's tag for Cosmos-native assets
pub const SRC_COSMOS: u32 = 3_335_846_818;
/// CRC32 of "TON", the bridge contract's tag for TON-native assets
pub const SRC_TON: u32 = 1_920_032_803;

/// Which chain originated the bridged asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cosmos,
    Ton,
}

impl Source {
    /// Parse the `crc_src` event attribute (numeric CRC or plain name)
    pub fn from_attribute(raw: &str) -> Option<Self> {
        match raw.trim() {
            s if s.eq_ignore_ascii_case("cosmos") => Some(Source::Cosmos),
            s if s.eq_ignore_ascii_case("ton") => Some(Source::Ton),
            s => match s.parse::<u32>().ok()? {
                SRC_COSMOS => Some(Source::Cosmos),
                SRC_TON => Some(Source::Ton),
                _ => None,
            },
        }
    }

    pub fn crc(&self) -> u32 {
        match self {
            Source::Cosmos => SRC_COSMOS,
            Source::Ton => SRC_TON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cosmos => "cosmos",
            Source::Ton => "ton",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Direction
// ============================================================================

/// A watched relay direction; also the key of its persisted offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    CosmosToTon,
    TonToCosmos,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::CosmosToTon => "cosmos_to_ton",
            Direction::TonToCosmos => "ton_to_cosmos",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cosmos_to_ton" => Some(Direction::CosmosToTon),
            "ton_to_cosmos" => Some(Direction::TonToCosmos),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Packets
// ============================================================================

/// Where and when a packet was emitted on the source chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub hash: String,
    pub height: u64,
    /// Position of the transaction inside its block
    #[serde(default)]
    pub tx_index: u32,
    /// Position of the bridge event inside its transaction
    #[serde(default)]
    pub event_index: u32,
    pub timestamp: String,
}

/// Outbound transfer extracted from a `send_to_ton` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPacket {
    pub seq: u64,
    pub to: String,
    pub denom: String,
    #[serde(with = "decimal_string")]
    pub amount: u128,
    pub src: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_timestamp: Option<u64>,
    pub provenance: Provenance,
}

/// Acknowledgement status carried by a `send_to_cosmos` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
    Timeout,
}

impl AckStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AckStatus::Success),
            1 => Some(AckStatus::Error),
            2 => Some(AckStatus::Timeout),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            AckStatus::Success => 0,
            AckStatus::Error => 1,
            AckStatus::Timeout => 2,
        }
    }
}

/// Acknowledgement extracted from a `send_to_cosmos` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPacket {
    pub seq: u64,
    pub status: AckStatus,
    pub provenance: Provenance,
}

/// Either kind of relayable packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Packet {
    Transfer(TransferPacket),
    Ack(AckPacket),
}

impl Packet {
    pub fn seq(&self) -> u64 {
        match self {
            Packet::Transfer(p) => p.seq,
            Packet::Ack(p) => p.seq,
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Transfer(_) => PacketKind::Transfer,
            Packet::Ack(_) => PacketKind::Ack,
        }
    }

    pub fn provenance(&self) -> &Provenance {
        match self {
            Packet::Transfer(p) => &p.provenance,
            Packet::Ack(p) => &p.provenance,
        }
    }

    /// Height whose state the destination must trust to verify this packet
    pub fn proven_height(&self) -> u64 {
        self.provenance().height + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Transfer,
    Ack,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Transfer => "transfer",
            PacketKind::Ack => "ack",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "transfer" => Some(PacketKind::Transfer),
            "ack" => Some(PacketKind::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packets extracted from one polling chunk plus the height to resume from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketBatch {
    pub transfer_packets: Vec<TransferPacket>,
    pub ack_packets: Vec<AckPacket>,
    pub offset: u64,
}

impl PacketBatch {
    pub fn is_empty(&self) -> bool {
        self.transfer_packets.is_empty() && self.ack_packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transfer_packets.len() + self.ack_packets.len()
    }

    /// All packets in source order: by height, transaction index, then event
    /// position inside the transaction.
    pub fn into_packets(self) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self
            .transfer_packets
            .into_iter()
            .map(Packet::Transfer)
            .chain(self.ack_packets.into_iter().map(Packet::Ack))
            .collect();
        packets.sort_by_key(|p| {
            let at = p.provenance();
            (at.height, at.tx_index, at.event_index)
        });
        packets
    }
}

/// Amounts travel as decimal strings; JSON numbers cannot hold every `u128`
mod decimal_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Job lifecycle. `Failed` is reachable from `ProofRequested`, `ProofReady`
/// and `Submitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Detected,
    ProofRequested,
    ProofReady,
    Submitted,
    Confirmed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Detected => "detected",
            JobStatus::ProofRequested => "proof_requested",
            JobStatus::ProofReady => "proof_ready",
            JobStatus::Submitted => "submitted",
            JobStatus::Confirmed => "confirmed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "detected" => Some(JobStatus::Detected),
            "proof_requested" => Some(JobStatus::ProofRequested),
            "proof_ready" => Some(JobStatus::ProofReady),
            "submitted" => Some(JobStatus::Submitted),
            "confirmed" => Some(JobStatus::Confirmed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Confirmed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued "relay this packet" unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier
    pub id: i64,
    pub direction: Direction,
    pub packet: Packet,
    /// Times this job was (re)queued after a failure
    pub retry_count: u32,
    /// Packet broadcast recorded before a restart, still unresolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_hash: Option<String>,
}

impl Job {
    /// Idempotency key; one job per packet and direction
    pub fn key(&self) -> JobKey {
        JobKey {
            direction: self.direction,
            kind: self.packet.kind(),
            seq: self.packet.seq(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub direction: Direction,
    pub kind: PacketKind,
    pub seq: u64,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.direction, self.kind, self.seq)
    }
}
