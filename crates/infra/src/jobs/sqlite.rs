//! SQLite-backed durable job store.
//!
//! ## Claim protocol
//!
//! `claim_due` is a single `UPDATE ... WHERE id = (SELECT ...) RETURNING`
//! statement. SQLite runs a write statement under the database write lock
//! from its first step, so selecting the oldest eligible row and flipping it
//! to `processing` happen as one unit: a concurrent claimer either waits on
//! the lock (bounded by the busy timeout) or sees the row already claimed.
//! A crash mid-statement rolls back, leaving the job untouched.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError | Scenario |
//! |------------|------------|----------|
//! | Database (unique violation) on insert | `DuplicateId` | id already enqueued |
//! | Database (other) | `Storage` | busy timeout, I/O, corruption |
//! | PoolClosed / Io / other | `Storage` | connection failures |
//!
//! Timestamps are stored as integer microseconds since the Unix epoch so that
//! SQL comparisons and ordering are exact.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{Job, JobId, JobState, QueueError, QueueResult};

use super::store::{JobStats, JobStore};

/// How long a statement waits for the write lock before failing as `Storage`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 8;

const JOB_COLUMNS: &str =
    "id, command, state, attempts, max_retries, created_at, updated_at, next_run_at";

/// Durable job store on a single SQLite file.
///
/// Cheap to clone; the pool is shared.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub async fn open(path: &Path) -> QueueResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.init().await?;
        debug!(path = %path.display(), "job store opened");
        Ok(store)
    }

    async fn init(&self) -> QueueResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id           TEXT PRIMARY KEY,
                command      TEXT NOT NULL,
                state        TEXT NOT NULL,
                attempts     INTEGER NOT NULL,
                max_retries  INTEGER NOT NULL,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL,
                next_run_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_next_run ON jobs(state, next_run_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, next_run_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?5)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(JobState::Pending.as_str())
        .bind(i64::from(job.max_retries))
        .bind(job.created_at.timestamp_micros())
        .bind(job.updated_at.timestamp_micros())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(QueueError::DuplicateId(job.id.clone()))
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = ?1,
                attempts = attempts + 1,
                updated_at = ?3
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = ?2 AND next_run_at <= ?3
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(JobState::Processing.as_str())
            .bind(JobState::Pending.as_str())
            .bind(now.timestamp_micros())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state), err)]
    async fn update(&self, job: &mut Job) -> QueueResult<()> {
        let updated_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?2,
                attempts = ?3,
                next_run_at = ?4,
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.next_run_at.timestamp_micros())
        .bind(updated_at.timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job.id.clone()));
        }
        job.updated_at = updated_at;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(QueueError::NotFound(id.clone())),
        }
    }

    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn counts_by_state(&self) -> QueueResult<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("counts_by_state", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("counts_by_state", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("counts_by_state", e))?;
            stats.add(parse_state(&state)?, u64::try_from(total).unwrap_or_default());
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn retry_dead(&self, id: &JobId) -> QueueResult<Job> {
        let now = Utc::now().timestamp_micros();
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = ?2,
                attempts = 0,
                next_run_at = ?4,
                updated_at = ?4
            WHERE id = ?1 AND state = ?3
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(JobState::Pending.as_str())
            .bind(JobState::Dead.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("retry_dead", e))?;

        match row {
            Some(row) => row_to_job(&row),
            None => {
                // Either missing (NotFound from get) or not dead.
                let current = self.get(id).await?;
                Err(QueueError::validation(format!(
                    "job {id} is not in the dead letter queue (state: {})",
                    current.state
                )))
            }
        }
    }
}

/// Map a database row into a `Job`.
fn row_to_job(row: &SqliteRow) -> QueueResult<Job> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let id: String = row.try_get("id").map_err(decode)?;
    let id = JobId::parse(&id).map_err(|e| corrupt("id", e))?;
    let state: String = row.try_get("state").map_err(decode)?;
    let attempts: i64 = row.try_get("attempts").map_err(decode)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(decode)?;

    Ok(Job {
        id,
        command: row.try_get("command").map_err(decode)?,
        state: parse_state(&state)?,
        attempts: u32::try_from(attempts).map_err(|e| corrupt("attempts", e))?,
        max_retries: u32::try_from(max_retries).map_err(|e| corrupt("max_retries", e))?,
        created_at: micros_to_datetime(row.try_get("created_at").map_err(decode)?)?,
        updated_at: micros_to_datetime(row.try_get("updated_at").map_err(decode)?)?,
        next_run_at: micros_to_datetime(row.try_get("next_run_at").map_err(decode)?)?,
    })
}

fn parse_state(raw: &str) -> QueueResult<JobState> {
    raw.parse().map_err(|e| corrupt("state", e))
}

fn micros_to_datetime(micros: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| QueueError::storage(format!("invalid timestamp in jobs table: {micros}")))
}

fn corrupt(column: &str, err: impl core::fmt::Display) -> QueueError {
    QueueError::storage(format!("invalid {column} in jobs table: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            QueueError::storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QueueError::storage(format!("connection pool closed in {operation}"))
        }
        other => QueueError::storage(format!("sqlx error in {operation}: {other}")),
    }
}
