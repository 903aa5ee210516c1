//! Durable relay state: per-direction offsets and the job queue
//!
//! [`RelayStore`] is implemented by Postgres for production and by an
//! in-memory map for tests. [`OffsetStore`] layers the cursor rules on top.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::db::JobRecord;
use crate::error::RelayError;
use crate::types::{Direction, Job, JobStatus, Packet};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRelayStore;

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn load_offset(&self, direction: Direction) -> Result<Option<u64>, RelayError>;

    /// Persist `height`; a lower value than the stored one is ignored
    async fn save_offset(&self, direction: Direction, height: u64) -> Result<(), RelayError>;

    async fn offsets(&self) -> Result<Vec<(Direction, u64)>, RelayError>;

    /// Insert one job per packet, atomically. Returns only the jobs that did
    /// not exist yet, in packet order.
    async fn insert_jobs(
        &self,
        direction: Direction,
        packets: Vec<Packet>,
    ) -> Result<Vec<Job>, RelayError>;

    async fn job_status(&self, id: i64) -> Result<Option<JobStatus>, RelayError>;

    async fn update_job_status(&self, id: i64, status: JobStatus) -> Result<(), RelayError>;

    async fn mark_submitted(&self, id: i64, message_hash: &str) -> Result<(), RelayError>;

    async fn mark_confirmed(&self, id: i64) -> Result<(), RelayError>;

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), RelayError>;

    /// Non-terminal jobs of `direction` in source order
    async fn resumable_jobs(&self, direction: Direction) -> Result<Vec<Job>, RelayError>;

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, RelayError>;

    /// Move a failed job back to `detected`; `None` if it is not failed
    async fn requeue_failed(&self, id: i64) -> Result<Option<Job>, RelayError>;

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, RelayError>;
}

/// Cursor of one direction; the orchestrator is its only writer
#[derive(Clone)]
pub struct OffsetStore {
    store: Arc<dyn RelayStore>,
    direction: Direction,
}

impl OffsetStore {
    pub fn new(store: Arc<dyn RelayStore>, direction: Direction) -> Self {
        Self { store, direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Height to resume from. Never below `min_height`; a read failure falls
    /// back to `min_height`.
    pub async fn load(&self, min_height: u64) -> u64 {
        match self.store.load_offset(self.direction).await {
            Ok(Some(height)) if height >= min_height => height,
            Ok(Some(height)) => {
                debug!(
                    direction = %self.direction,
                    persisted = height,
                    min_height,
                    "Persisted offset below configured floor"
                );
                min_height
            }
            Ok(None) => min_height,
            Err(e) => {
                warn!(
                    direction = %self.direction,
                    error = %e,
                    min_height,
                    "Failed to read offset, starting from configured floor"
                );
                min_height
            }
        }
    }

    pub async fn save(&self, height: u64) -> Result<(), RelayError> {
        self.store.save_offset(self.direction, height).await?;
        debug!(direction = %self.direction, height, "Saved offset");
        Ok(())
    }
}
