use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{Direction, Job, JobStatus, Packet};

// Note: heights and sequences are BIGINT in the database. Source chains never
// get near i64::MAX, so conversions saturate instead of failing.

/// A row of `relay_jobs`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub direction: String,
    pub kind: String,
    pub seq: i64,
    pub packet: serde_json::Value,
    pub height: i64,
    pub tx_hash: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    /// Message hash of the last destination broadcast
    pub dest_tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    /// Rebuild the queued job from its stored packet
    pub fn to_job(&self) -> Result<Job> {
        let direction = Direction::parse(&self.direction)
            .ok_or_else(|| eyre!("Unknown direction {} on job {}", self.direction, self.id))?;
        let packet: Packet = serde_json::from_value(self.packet.clone())
            .wrap_err_with(|| format!("Corrupt packet on job {}", self.id))?;

        Ok(Job {
            id: self.id,
            direction,
            packet,
            retry_count: self.attempts.max(0) as u32,
            submitted_hash: match self.status() {
                Some(JobStatus::Submitted) => self.dest_tx_hash.clone(),
                _ => None,
            },
        })
    }
}

/// For inserting new relay jobs
#[derive(Debug, Clone)]
pub struct NewRelayJob {
    pub direction: String,
    pub kind: String,
    pub seq: i64,
    pub packet: serde_json::Value,
    pub height: i64,
    pub tx_hash: String,
}

impl NewRelayJob {
    pub fn from_packet(direction: Direction, packet: &Packet) -> Result<Self> {
        Ok(Self {
            direction: direction.as_str().to_string(),
            kind: packet.kind().as_str().to_string(),
            seq: to_db_int(packet.seq()),
            packet: serde_json::to_value(packet).wrap_err("Failed to serialize packet")?,
            height: to_db_int(packet.provenance().height),
            tx_hash: packet.provenance().hash.clone(),
        })
    }
}

/// Offset row of `block_offsets`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BlockOffset {
    pub direction: String,
    pub last_processed_height: i64,
    pub updated_at: DateTime<Utc>,
}

pub fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub fn from_db_int(value: i64) -> u64 {
    value.max(0) as u64
}
