//! Job store
//!
//! Handles all database operations on job records:
//! - Fetching submitted jobs
//! - Claiming jobs (Submitted -> Running)
//! - Recording terminal state with the worker exit code

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinder_core::domain::job::{Job, JobStatus};
use sqlx::SqlitePool;

/// Store trait for job record operations
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetches submitted jobs, oldest first.
    async fn fetch_submitted(&self) -> Result<Vec<Job>>;

    /// Claims a job for execution: Submitted -> Running, stamping
    /// `started_at` and the claiming dispatcher.
    ///
    /// Returns `false` when the row was no longer in Submitted, i.e. the
    /// claim was lost to another dispatcher.
    async fn mark_running(&self, id: i64, dispatcher_id: &str, ts: DateTime<Utc>) -> Result<bool>;

    /// Records a successful terminal transition, stamping `finished_at`.
    async fn mark_finished(&self, id: i64, ts: DateTime<Utc>, exit_code: i32) -> Result<()>;

    /// Records a failed terminal transition, stamping `finished_at`.
    ///
    /// Used both for nonzero worker exits and for spawn failures (with a
    /// synthetic exit code).
    async fn mark_failed(&self, id: i64, ts: DateTime<Utc>, exit_code: i32) -> Result<()>;

    /// Finds a job by ID.
    async fn find_by_id(&self, id: i64) -> Result<Option<Job>>;
}

/// SQLite implementation of JobStore
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Creates a new store over an open connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn mark_terminal(
        &self,
        id: i64,
        status: JobStatus,
        ts: DateTime<Utc>,
        exit_code: i32,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, finished_at = ?, exit_code = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(ts)
        .bind(exit_code)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark job {} {}", id, status.as_str()))?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn fetch_submitted(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, path, status, submitted_at, started_at, finished_at,
                   exit_code, dispatcher_id
            FROM jobs
            WHERE status = ?
            ORDER BY submitted_at ASC
            "#,
        )
        .bind(JobStatus::Submitted.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch submitted jobs")?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn mark_running(&self, id: i64, dispatcher_id: &str, ts: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?, started_at = ?, dispatcher_id = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(JobStatus::Running.as_str())
        .bind(ts)
        .bind(dispatcher_id)
        .bind(id)
        .bind(JobStatus::Submitted.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to mark job {} running", id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_finished(&self, id: i64, ts: DateTime<Utc>, exit_code: i32) -> Result<()> {
        self.mark_terminal(id, JobStatus::Finished, ts, exit_code)
            .await
    }

    async fn mark_failed(&self, id: i64, ts: DateTime<Utc>, exit_code: i32) -> Result<()> {
        self.mark_terminal(id, JobStatus::Failed, ts, exit_code).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, path, status, submitted_at, started_at, finished_at,
                   exit_code, dispatcher_id
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to find job {}", id))?;

        Ok(row.map(|r| r.into()))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    path: String,
    status: String,
    submitted_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    dispatcher_id: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        let status = JobStatus::parse(&row.status).unwrap_or(JobStatus::Submitted);

        Job {
            id: row.id,
            path: row.path,
            status,
            submitted_at: row.submitted_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            dispatcher_id: row.dispatcher_id,
        }
    }
}
