//! Postgres-backed relay store

use async_trait::async_trait;
use sqlx::PgPool;

use super::RelayStore;
use crate::db::{self, from_db_int, to_db_int, JobRecord, NewRelayJob};
use crate::error::RelayError;
use crate::types::{Direction, Job, JobStatus, Packet};

/// [`RelayStore`] over the `block_offsets` and `relay_jobs` tables
#[derive(Clone)]
pub struct PgRelayStore {
    pool: PgPool,
}

impl PgRelayStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn storage(e: eyre::Report) -> RelayError {
    RelayError::Storage(format!("{:#}", e))
}

fn to_job(record: &JobRecord) -> Result<Job, RelayError> {
    record.to_job().map_err(storage)
}

#[async_trait]
impl RelayStore for PgRelayStore {
    async fn load_offset(&self, direction: Direction) -> Result<Option<u64>, RelayError> {
        let height = db::get_block_offset(&self.pool, direction.as_str())
            .await
            .map_err(storage)?;
        Ok(height.map(from_db_int))
    }

    async fn save_offset(&self, direction: Direction, height: u64) -> Result<(), RelayError> {
        db::upsert_block_offset(&self.pool, direction.as_str(), to_db_int(height))
            .await
            .map_err(storage)
    }

    async fn offsets(&self) -> Result<Vec<(Direction, u64)>, RelayError> {
        let rows = db::get_block_offsets(&self.pool).await.map_err(storage)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Direction::parse(&row.direction)
                    .map(|d| (d, from_db_int(row.last_processed_height)))
            })
            .collect())
    }

    async fn insert_jobs(
        &self,
        direction: Direction,
        packets: Vec<Packet>,
    ) -> Result<Vec<Job>, RelayError> {
        let new_jobs = packets
            .iter()
            .map(|p| NewRelayJob::from_packet(direction, p))
            .collect::<eyre::Result<Vec<_>>>()
            .map_err(storage)?;
        let ids = db::insert_relay_jobs(&self.pool, &new_jobs)
            .await
            .map_err(storage)?;

        Ok(packets
            .into_iter()
            .zip(ids)
            .filter_map(|(packet, id)| {
                id.map(|id| Job {
                    id,
                    direction,
                    packet,
                    retry_count: 0,
                    submitted_hash: None,
                })
            })
            .collect())
    }

    async fn job_status(&self, id: i64) -> Result<Option<JobStatus>, RelayError> {
        let record = db::get_relay_job(&self.pool, id).await.map_err(storage)?;
        Ok(record.and_then(|r| r.status()))
    }

    async fn update_job_status(&self, id: i64, status: JobStatus) -> Result<(), RelayError> {
        db::update_job_status(&self.pool, id, status.as_str())
            .await
            .map_err(storage)
    }

    async fn mark_submitted(&self, id: i64, message_hash: &str) -> Result<(), RelayError> {
        db::update_job_submitted(&self.pool, id, message_hash)
            .await
            .map_err(storage)
    }

    async fn mark_confirmed(&self, id: i64) -> Result<(), RelayError> {
        db::update_job_confirmed(&self.pool, id)
            .await
            .map_err(storage)
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), RelayError> {
        db::update_job_failed(&self.pool, id, error)
            .await
            .map_err(storage)
    }

    async fn resumable_jobs(&self, direction: Direction) -> Result<Vec<Job>, RelayError> {
        db::get_resumable_jobs(&self.pool, direction.as_str())
            .await
            .map_err(storage)?
            .iter()
            .map(to_job)
            .collect()
    }

    async fn failed_jobs(&self, limit: i64) -> Result<Vec<JobRecord>, RelayError> {
        db::get_failed_jobs(&self.pool, limit).await.map_err(storage)
    }

    async fn requeue_failed(&self, id: i64) -> Result<Option<Job>, RelayError> {
        let record = db::requeue_failed_job(&self.pool, id)
            .await
            .map_err(storage)?;
        record.as_ref().map(to_job).transpose()
    }

    async fn count_by_status(&self) -> Result<Vec<(JobStatus, i64)>, RelayError> {
        let rows = db::count_jobs_by_status(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| JobStatus::parse(&status).map(|s| (s, count)))
            .collect())
    }
}
