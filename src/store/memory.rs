//! In-memory relay store (for tests and ephemeral runs)

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::RelayStore;
use crate::db::{JobRecord, NewRelayJob};
use crate::error::RelayError;
use crate::types::{Direction, Job, JobKey, JobStatus, Packet};

#[derive(Default)]
struct State {
    offsets: HashMap<Direction, u64>,
    jobs: BTreeMap<i64, JobRecord>,
    keys: HashMap<JobKey, i64>,
    next_id: i64,
}

/// [`RelayStore`] kept in process memory. Offset I/O can be made to fail to
/// exercise the orchestrator's rewind path.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_offsets: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every offset read and write fail until switched off
    pub fn fail_offset_io(&self, fail: bool) {
        self.fail_offsets.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a stored job
    pub fn job(&self, id: i64) -> Option<JobRecord> {
        self.lock().jobs.get(&id).cloned()
    }

    /// Snapshot of every stored job, by id
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.lock().jobs.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_offset_io(&self) -> Result<(), RelayError> {
        if self.fail_offsets.load(Ordering::SeqCst) {
            return Err(RelayError::Storage("offset storage unavailable".to_string()));
        }
        Ok(())
    }

    fn update<F>(&self, id: i64, apply: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| RelayError::Storage(format!("job {} does not exist", id)))?;
        apply(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

fn to_job(record: &JobRecord) -> Result<Job, RelayError> {
    record
        .to_job()
        .map_err(|e| RelayError::Storage(format!("{:#}", e)))
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn load_offset(&self, direction: Direction) -> Result<Option<u64>, RelayError> {
        self.check_offset_io()?;
        Ok(self.lock().offsets.get(&direction).copied())
    }

    async fn save_offset(&self, direction: Direction, height: u64) -> Result<(), RelayError> {
        self.check_offset_io()?;
        let mut state = self.lock();
        let entry = state.offsets.entry(direction).or_insert(height);
        *entry = (*entry).max(height);
        Ok(())
    }

    async fn offsets(&self) -> Result<Vec<(Direction, u64)>, RelayError> {
        let mut offsets: Vec<_> = self.lock().offsets.iter().map(|(d, h)| (*d, *h)).collect();
        offsets.sort_by_key(|(d, _)| d.as_str());
        Ok(offsets)
    }

    async fn insert_jobs(
        &self,
        direction: Direction,
        packets: Vec<Packet>,
    ) -> Result<Vec<Job>, RelayError> {
        let mut state = self.lock();
        let mut created = Vec::new();

        for packet in packets {
            let key = JobKey {
                direction,
                kind: packet.kind(),
                seq: packet.seq(),
            };
            if state.keys.contains_key(&key) {
                continue;
            }

            let new_job = NewRelayJob::from_packet(direction, &packet)
                .map_err(|e| RelayError::Storage(format!("{:#}", e)))?;
            state.next_id += 1;
            let id = state.next_id;
            let now = Utc::now();
            state.jobs.insert(
                id,
                JobRecord {
                    id,
                    direction: new_job.direction,
                    kind: new_job.kind,
                    seq: new_job.seq,
                    packet: new_job.packet,
                    height: new_job.height,
                    tx_hash: new_job.tx_hash,
                    status: JobStatus::Detected.as_str().to_string(),
                    attempts: 0,
                    last_error: None,
                    dest_tx_hash: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            state.keys.insert(key, id);
            created.push(Job {
                id,
                direction,
                packet,
                retry_count: 0,
                submitted_hash: None,
            });
        }

        Ok(created)
    }

    async fn job_status(&self, id: i64) -> Result<Option<JobStatus>, RelayError> {
        Ok(self.lock().jobs.get(&id).and_then(JobRecord::status))
    }

    async fn update_job_status(&self, id: i64, status: JobStatus) -> Result<(), RelayError> {
        self.update(id, |record| record.status = status.as_str().to_string())
    }

    async fn mark_submitted(&self, id: i64, message_hash: &str) -> Result<(), RelayError> {
        self.update(id, |record| {
            record.status = JobStatus::Submitted.as_str().to_string();
            record.dest_tx_hash = Some(message_hash.to_string());
        })
    }

    async fn mark_confirmed(&self, id: i64) -> Result<(), RelayError> {
        self.update(id, |record| {
            record.status = JobStatus::Confirmed.as_str().to_string();
            record.last_error = None;
        })
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), RelayError> {
        self.update(id, |record| {
            record.status = JobStatus::Failed.as_str().to_string();
            record.last_error = Some(error.to_string());
        })
    }

    async fn resumable_jobs(&self, direction: Direction) -> Result<Vec<Job>, RelayError> {
        let state = self.lock();
        let mut records: Vec<&JobRecord> = state
            .jobs
            .values()
            .filter(|r| r.direction == direction.as_str())
            .filter(|r| r.status().map(|s| !s.is_terminal()).unwrap_or(false))
            .collect();
        records.sort_by_key(|r| (r.height, r.id));
        records.into_iter().map(to_job).collect()
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, RelayError> {
        let state = self.lock();
        let mut failed: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|r| r.status() == Some(JobStatus::Failed))
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn requeue_failed(&self, id: i64) -> Result<Option<Job>, RelayError> {
        let mut state = self.lock();
        let Some(record) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if record.status() != Some(JobStatus::Failed) {
            return Ok(None);
        }
        record.status = JobStatus::Detected.as_str().to_string();
        record.attempts += 1;
        record.updated_at = Utc::now();
        to_job(record).map(Some)
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, RelayError> {
        let state = self.lock();
        let mut counts: BTreeMap<&'static str, (JobStatus, i64)> = BTreeMap::new();
        for status in state.jobs.values().filter_map(JobRecord::status) {
            counts.entry(status.as_str()).or_insert((status, 0)).1 += 1;
        }
        Ok(counts.into_values().collect())
    }
}
