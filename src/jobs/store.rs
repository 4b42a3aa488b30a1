use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::types::{Job, JobStatus, JobType};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    type         TEXT NOT NULL,
    status       TEXT NOT NULL,
    file_path    TEXT NOT NULL,
    params       TEXT NOT NULL,
    progress     REAL NOT NULL DEFAULT 0,
    result       TEXT,
    error        TEXT,
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at);
";

/// Single-writer sqlite store for job rows. Queries run on the blocking
/// pool so the async workers never stall the executor on disk I/O.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self, JobError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, JobError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| JobError::Internal(format!("store task panicked: {}", e)))?
    }

    pub async fn insert(&self, job: Job) -> Result<(), JobError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, type, status, file_path, params, progress, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.file_path,
                    job.params.to_string(),
                    job.progress,
                    job.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, type, status, file_path, params, progress, result, error,
                        created_at, started_at, completed_at
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(JobError::from)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Job>, JobError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, status, file_path, params, progress, result, error,
                        created_at, started_at, completed_at
                 FROM jobs ORDER BY created_at DESC",
            )?;
            let jobs = stmt
                .query_map([], row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    /// Jobs a client would watch: pending or running.
    pub async fn list_active(&self) -> Result<Vec<Job>, JobError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, type, status, file_path, params, progress, result, error,
                        created_at, started_at, completed_at
                 FROM jobs WHERE status IN ('pending', 'running') ORDER BY created_at ASC",
            )?;
            let jobs = stmt
                .query_map([], row_to_job)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    pub async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), JobError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE jobs SET status = 'running', started_at = ?2, error = NULL
                 WHERE id = ?1",
                params![id.to_string(), at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_completed(
        &self,
        id: Uuid,
        result: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE jobs SET status = 'completed', progress = 1.0, result = ?2,
                        completed_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), result.to_string(), at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn mark_failed(
        &self,
        id: Uuid,
        error: String,
        at: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE jobs SET status = 'failed', error = ?2, completed_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), error, at.to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    /// Flip to cancelled, but only from a non-terminal status. Returns
    /// whether this call performed the transition, so cancellation is
    /// recorded exactly once even when racing the worker.
    pub async fn mark_cancelled(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, JobError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'cancelled', completed_at = ?2
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id.to_string(), at.to_rfc3339()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Reset a failed or cancelled job back to pending for a retry.
    pub async fn reset_for_retry(&self, id: Uuid) -> Result<bool, JobError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'pending', progress = 0, error = NULL,
                        result = NULL, started_at = NULL, completed_at = NULL
                 WHERE id = ?1 AND status IN ('failed', 'cancelled')",
                params![id.to_string()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn update_progress(&self, id: Uuid, progress: f64) -> Result<(), JobError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE jobs SET progress = ?2 WHERE id = ?1 AND status = 'running'",
                params![id.to_string(), progress.clamp(0.0, 1.0)],
            )?;
            Ok(())
        })
        .await
    }

    /// Startup recovery: any row still marked running belonged to a worker
    /// that was killed mid-flight. Returns the number of rewritten rows.
    pub async fn reset_running_to_pending(&self) -> Result<usize, JobError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE jobs SET status = 'pending', progress = 0, started_at = NULL
                 WHERE status = 'running'",
                [],
            )?;
            Ok(changed)
        })
        .await
    }

    /// Pending job ids of one lane in creation order, for the startup resume
    /// sweep and the channel-overflow fallback.
    pub async fn pending_ids(&self, lane: JobType) -> Result<Vec<Uuid>, JobError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM jobs WHERE status = 'pending' AND type = ?1
                 ORDER BY created_at ASC",
            )?;
            let ids = stmt
                .query_map(params![lane.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids
                .into_iter()
                .filter_map(|s| Uuid::parse_str(&s).ok())
                .collect())
        })
        .await
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let params_raw: String = row.get(4)?;
    let result_raw: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    Ok(Job {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        job_type: JobType::parse(&job_type).unwrap_or(JobType::Transcribe),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        file_path: row.get(3)?,
        params: serde_json::from_str(&params_raw).unwrap_or(serde_json::Value::Null),
        progress: row.get(5)?,
        result: result_raw.and_then(|r| serde_json::from_str(&r).ok()),
        error: row.get(7)?,
        created_at: parse_ts(&created_at),
        started_at: started_at.as_deref().map(parse_ts),
        completed_at: completed_at.as_deref().map(parse_ts),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}
