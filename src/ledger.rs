//! Sync job ledger
//!
//! Durable record of sync intents per document. Jobs move through
//! `pending -> running -> succeeded | failed | stale`; `failed` is
//! promoted back to `pending` once its backoff elapses, until the
//! attempt ceiling turns it into terminal `exhausted`. Terminal jobs
//! are retained for audit and never deleted by the pipeline.
//!
//! Claiming is a single atomic UPDATE, so two workers can never hold
//! the same job. At most one job per document is ever open
//! (pending/failed/running); the scheduler's collapse rule maintains
//! that invariant.

use crate::error::{Error, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// What a sync job asks the indexing backend to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Create => write!(f, "create"),
            JobKind::Update => write!(f, "update"),
            JobKind::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(JobKind::Create),
            "update" => Ok(JobKind::Update),
            "delete" => Ok(JobKind::Delete),
            _ => Err(Error::Validation(format!("Unknown job kind: {}", s))),
        }
    }
}

/// Sync job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Failed,
    Succeeded,
    Exhausted,
    Stale,
}

impl JobState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Exhausted | JobState::Stale)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Failed => write!(f, "failed"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Exhausted => write!(f, "exhausted"),
            JobState::Stale => write!(f, "stale"),
        }
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "failed" => Ok(JobState::Failed),
            "succeeded" => Ok(JobState::Succeeded),
            "exhausted" => Ok(JobState::Exhausted),
            "stale" => Ok(JobState::Stale),
            _ => Err(Error::Validation(format!("Unknown job state: {}", s))),
        }
    }
}

/// A sync job row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub document_id: String,
    pub kind: String,
    pub state: String,
    pub attempt: i64,
    pub last_error: Option<String>,
    pub content_hash_at_enqueue: String,
    pub run_after: String,
    pub created_at: String,
    pub updated_at: String,
}

impl SyncJob {
    pub fn get_kind(&self) -> Result<JobKind> {
        self.kind.parse()
    }

    pub fn get_state(&self) -> Result<JobState> {
        self.state.parse()
    }
}

/// An exhausted job joined with its document, for operator visibility
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FailedSync {
    pub job_id: String,
    pub document_id: String,
    pub file_name: String,
    pub kind: String,
    pub attempt: i64,
    pub last_error: Option<String>,
    pub updated_at: String,
}

/// Job ledger handle
#[derive(Clone)]
pub struct JobLedger {
    pool: SqlitePool,
}

impl JobLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new pending job
    pub async fn enqueue(
        &self,
        document_id: &str,
        kind: JobKind,
        content_hash: &str,
    ) -> Result<SyncJob> {
        let now = Utc::now().to_rfc3339();
        let job = SyncJob {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            kind: kind.to_string(),
            state: JobState::Pending.to_string(),
            attempt: 0,
            last_error: None,
            content_hash_at_enqueue: content_hash.to_string(),
            run_after: now.clone(),
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO sync_jobs
                (id, document_id, kind, state, attempt, last_error,
                 content_hash_at_enqueue, run_after, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.document_id)
        .bind(&job.kind)
        .bind(&job.state)
        .bind(job.attempt)
        .bind(&job.last_error)
        .bind(&job.content_hash_at_enqueue)
        .bind(&job.run_after)
        .bind(&job.created_at)
        .bind(&job.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Enqueued {} job {} for document {}", kind, job.id, document_id);
        Ok(job)
    }

    /// Get a job by id
    pub async fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let job = sqlx::query_as::<_, SyncJob>("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// The at-most-one non-terminal job for a document
    pub async fn find_open(&self, document_id: &str) -> Result<Option<SyncJob>> {
        let job = sqlx::query_as::<_, SyncJob>(
            r#"
            SELECT * FROM sync_jobs
            WHERE document_id = ? AND state IN ('pending', 'failed', 'running')
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Retarget a pending or failed job at newer content, in place.
    ///
    /// Returns false when the job slipped into running or a terminal
    /// state since it was looked up; the caller then leaves it alone
    /// and relies on the staleness check at claim time.
    pub async fn collapse(&self, job_id: &str, kind: JobKind, content_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET kind = ?, content_hash_at_enqueue = ?, updated_at = ?
            WHERE id = ? AND state IN ('pending', 'failed')
            "#,
        )
        .bind(kind.to_string())
        .bind(content_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically claim the oldest eligible pending job.
    ///
    /// The claim is a single UPDATE against the FIFO head (insertion
    /// order breaks created_at ties), so concurrent workers each get a
    /// distinct job or nothing.
    pub async fn claim_next(&self) -> Result<Option<SyncJob>> {
        let now = Utc::now().to_rfc3339();
        let job = sqlx::query_as::<_, SyncJob>(
            r#"
            UPDATE sync_jobs
            SET state = 'running', updated_at = ?
            WHERE id = (
                SELECT id FROM sync_jobs
                WHERE state = 'pending' AND run_after <= ?
                ORDER BY created_at, rowid
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref job) = job {
            debug!("Claimed job {} for document {}", job.id, job.document_id);
        }
        Ok(job)
    }

    /// Return jobs stranded in `running` by an interrupted process to
    /// `pending`. Called once at pool startup; the supersession gates
    /// at claim time sort out anything the interrupted run already
    /// pushed to the backend.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET state = 'pending', updated_at = ? WHERE state = 'running'",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            debug!("Recovered {} interrupted jobs", recovered);
        }
        Ok(recovered)
    }

    /// Promote failed jobs whose backoff has elapsed back to pending.
    /// Returns how many were released.
    pub async fn release_retries(&self, max_attempts: u32) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = 'pending', updated_at = ?
            WHERE state = 'failed' AND attempt < ? AND run_after <= ?
            "#,
        )
        .bind(&now)
        .bind(max_attempts as i64)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Record adapter success. The attempt counter is left as-is and
    /// the last error is cleared.
    pub async fn mark_succeeded(&self, job_id: &str) -> Result<()> {
        self.finish(job_id, JobState::Succeeded, None, 0).await
    }

    /// Record a transient adapter failure.
    ///
    /// Increments the attempt counter; below the ceiling the job parks
    /// in `failed` until `run_after`, at the ceiling it becomes
    /// terminal `exhausted`. Returns the resulting state.
    pub async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        max_attempts: u32,
        backoff: std::time::Duration,
    ) -> Result<JobState> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        let attempt = job.attempt + 1;
        let state = if attempt >= max_attempts as i64 {
            JobState::Exhausted
        } else {
            JobState::Failed
        };
        let run_after = (Utc::now() + Duration::milliseconds(backoff.as_millis() as i64))
            .to_rfc3339();

        sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = ?, attempt = ?, last_error = ?, run_after = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.to_string())
        .bind(attempt)
        .bind(error)
        .bind(&run_after)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        debug!(
            "Job {} failed (attempt {}), now {}",
            job_id, attempt, state
        );
        Ok(state)
    }

    /// Record a permanent adapter failure: terminal immediately, no
    /// retry budget consumed beyond this attempt.
    pub async fn mark_exhausted(&self, job_id: &str, error: &str) -> Result<()> {
        self.finish(job_id, JobState::Exhausted, Some(error), 1).await
    }

    /// Abandon a job whose snapshot was superseded. Not an error.
    pub async fn mark_stale(&self, job_id: &str) -> Result<()> {
        self.finish(job_id, JobState::Stale, None, 0).await
    }

    async fn finish(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<&str>,
        attempt_delta: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET state = ?, attempt = attempt + ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.to_string())
        .bind(attempt_delta)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job_id.to_string()));
        }

        debug!("Job {} is {}", job_id, state);
        Ok(())
    }

    /// Latest job state for a document, the `getSyncStatus` surface
    pub async fn sync_status(&self, document_id: &str) -> Result<Option<JobState>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT state FROM sync_jobs
            WHERE document_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(state,)| state.parse()).transpose()
    }

    /// Exhausted jobs in a knowledge base, for operator attention
    pub async fn list_failed(&self, knowledge_base_id: &str) -> Result<Vec<FailedSync>> {
        let rows = sqlx::query_as::<_, FailedSync>(
            r#"
            SELECT j.id AS job_id, j.document_id, d.file_name, j.kind,
                   j.attempt, j.last_error, j.updated_at
            FROM sync_jobs j
            JOIN documents d ON d.id = j.document_id
            WHERE j.state = 'exhausted' AND d.knowledge_base_id = ?
            ORDER BY j.updated_at DESC
            "#,
        )
        .bind(knowledge_base_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Full job history for a document, oldest first. The pipeline
    /// never deletes ledger rows.
    pub async fn history(&self, document_id: &str) -> Result<Vec<SyncJob>> {
        let jobs = sqlx::query_as::<_, SyncJob>(
            "SELECT * FROM sync_jobs WHERE document_id = ? ORDER BY created_at, rowid",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Number of jobs currently eligible for claiming or awaiting
    /// retry, used by drain loops
    pub async fn open_job_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sync_jobs WHERE state IN ('pending', 'failed', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
