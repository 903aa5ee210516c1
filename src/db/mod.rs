use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

pub mod models;

pub use models::*;

const JOB_SELECT: &str = "id, direction, kind, seq, packet, height, tx_hash, status, attempts, \
                          last_error, dest_tx_hash, created_at, updated_at";

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

// ============ Offsets ============

/// Get last processed height for a direction
pub async fn get_block_offset(pool: &PgPool, direction: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"SELECT last_processed_height FROM block_offsets WHERE direction = $1"#,
    )
    .bind(direction)
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get block offset")?;

    Ok(row.map(|r| r.0))
}

/// Persist the offset for a direction; never moves it backwards
pub async fn upsert_block_offset(pool: &PgPool, direction: &str, height: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO block_offsets (direction, last_processed_height)
        VALUES ($1, $2)
        ON CONFLICT (direction) DO UPDATE
            SET last_processed_height = GREATEST(block_offsets.last_processed_height, $2),
                updated_at = NOW()
        "#,
    )
    .bind(direction)
    .bind(height)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update block offset for {}", direction))?;

    Ok(())
}

/// All persisted offsets
pub async fn get_block_offsets(pool: &PgPool) -> Result<Vec<BlockOffset>> {
    sqlx::query_as::<_, BlockOffset>(
        r#"SELECT direction, last_processed_height, updated_at FROM block_offsets ORDER BY direction"#,
    )
    .fetch_all(pool)
    .await
    .wrap_err("Failed to get block offsets")
}

// ============ Jobs ============

/// Insert jobs in one transaction. Returns the new id per job, `None` for a
/// job whose `(direction, kind, seq)` already exists.
pub async fn insert_relay_jobs(pool: &PgPool, jobs: &[NewRelayJob]) -> Result<Vec<Option<i64>>> {
    let mut tx = pool.begin().await.wrap_err("Failed to begin transaction")?;
    let mut ids = Vec::with_capacity(jobs.len());

    for job in jobs {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO relay_jobs (direction, kind, seq, packet, height, tx_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (direction, kind, seq) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&job.direction)
        .bind(&job.kind)
        .bind(job.seq)
        .bind(&job.packet)
        .bind(job.height)
        .bind(&job.tx_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            error!("SQL error inserting relay job: {:?}", e);
            e
        })
        .wrap_err_with(|| format!("Failed to insert {} job {}", job.kind, job.seq))?;

        ids.push(row.map(|r| r.0));
    }

    tx.commit().await.wrap_err("Failed to commit relay jobs")?;
    Ok(ids)
}

/// Get a job by id
pub async fn get_relay_job(pool: &PgPool, id: i64) -> Result<Option<JobRecord>> {
    let query = format!("SELECT {} FROM relay_jobs WHERE id = $1", JOB_SELECT);
    sqlx::query_as::<_, JobRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to get relay job {}", id))
}

/// Move a job to an intermediate status
pub async fn update_job_status(pool: &PgPool, id: i64, status: &str) -> Result<()> {
    sqlx::query(r#"UPDATE relay_jobs SET status = $1, updated_at = NOW() WHERE id = $2"#)
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to update job {} to {}", id, status))?;

    Ok(())
}

/// Update job status to submitted with the destination message hash
pub async fn update_job_submitted(pool: &PgPool, id: i64, dest_tx_hash: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE relay_jobs SET status = 'submitted', dest_tx_hash = $1, updated_at = NOW() WHERE id = $2"#,
    )
    .bind(dest_tx_hash)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update job {} as submitted", id))?;

    Ok(())
}

/// Update job status to confirmed
pub async fn update_job_confirmed(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(
        r#"UPDATE relay_jobs SET status = 'confirmed', last_error = NULL, updated_at = NOW() WHERE id = $1"#,
    )
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update job {} as confirmed", id))?;

    Ok(())
}

/// Update job status to failed with error
pub async fn update_job_failed(pool: &PgPool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"UPDATE relay_jobs SET status = 'failed', last_error = $1, updated_at = NOW() WHERE id = $2"#,
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update job {} as failed", id))?;

    Ok(())
}

/// Non-terminal jobs of a direction in source order, for resuming after restart
pub async fn get_resumable_jobs(pool: &PgPool, direction: &str) -> Result<Vec<JobRecord>> {
    let query = format!(
        "SELECT {} FROM relay_jobs WHERE direction = $1 AND status NOT IN ('confirmed', 'failed') \
         ORDER BY height, id",
        JOB_SELECT
    );
    sqlx::query_as::<_, JobRecord>(&query)
        .bind(direction)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get resumable jobs")
}

/// Most recent failed jobs
pub async fn get_failed_jobs(pool: &PgPool, limit: i64) -> Result<Vec<JobRecord>> {
    let query = format!(
        "SELECT {} FROM relay_jobs WHERE status = 'failed' ORDER BY updated_at DESC LIMIT $1",
        JOB_SELECT
    );
    sqlx::query_as::<_, JobRecord>(&query)
        .bind(limit)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to get failed jobs")
}

/// Reset a failed job to `detected` and count the attempt. Returns `None` if
/// the job does not exist or is not failed.
pub async fn requeue_failed_job(pool: &PgPool, id: i64) -> Result<Option<JobRecord>> {
    let query = format!(
        "UPDATE relay_jobs SET status = 'detected', attempts = attempts + 1, updated_at = NOW() \
         WHERE id = $1 AND status = 'failed' RETURNING {}",
        JOB_SELECT
    );
    sqlx::query_as::<_, JobRecord>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await
        .wrap_err_with(|| format!("Failed to requeue job {}", id))
}

/// Job counts grouped by status
pub async fn count_jobs_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    sqlx::query_as(r#"SELECT status, COUNT(*) FROM relay_jobs GROUP BY status ORDER BY status"#)
        .fetch_all(pool)
        .await
        .wrap_err("Failed to count jobs")
}
