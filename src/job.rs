//! Job records, lifecycle states, and the enqueue request builder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

use crate::error::Error;

/// Lifecycle state of a job.
///
/// `Pending` rows wait for a claim; `Running` rows are bound to a worker and
/// a parallelism slot. `Succeeded`, `Failed` and `Cancelled` are terminal:
/// no further transition touches the row until retention purges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// A full job record as stored in `exportq_jobs`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub job_id: i64,
    pub query_sql: String,
    pub storage_account: String,
    pub storage_container: String,
    /// Destination blob; populated when the job succeeds.
    pub result_blob_path: Option<String>,
    /// Earliest time the job may run; pushed forward by retry backoff.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub correlation_id: Option<String>,
    pub status: JobStatus,
    /// Incremented on every claim (and on orphan requeue), capped by
    /// `max_attempts`.
    pub attempt_count: i32,
    pub max_attempts: i32,
    /// Per-attempt wall-clock deadline.
    pub max_runtime: std::time::Duration,
    /// Accumulated diagnostics across attempts, newest last.
    pub last_error: Option<String>,
    /// Identity of the worker that most recently claimed the job.
    pub run_by: Option<String>,
    /// Postgres backend pid of the connection currently executing the job.
    pub backend_pid: Option<i32>,
}

/// Column list matching [`Job::from_row`]. `max_runtime` is read as epoch
/// seconds to avoid interval arithmetic on the Rust side.
pub(crate) const JOB_COLUMNS: &str = "job_id, query_sql, storage_account, storage_container, \
     result_blob_path, scheduled_at, created_at, updated_at, started_at, finished_at, \
     priority, correlation_id, status, attempt_count, max_attempts, \
     extract(epoch FROM max_runtime)::double precision AS max_runtime_secs, \
     last_error, run_by, backend_pid";

impl Job {
    pub(crate) fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, Error> {
        let status_str: String = row.try_get("status").map_err(Error::from)?;
        let status = JobStatus::from_str(&status_str).ok_or_else(|| {
            Error::invalid_argument(format!("unknown job status in store: {status_str}"))
        })?;
        let max_runtime_secs: f64 = row.try_get("max_runtime_secs").map_err(Error::from)?;

        Ok(Self {
            job_id: row.try_get("job_id")?,
            query_sql: row.try_get("query_sql")?,
            storage_account: row.try_get("storage_account")?,
            storage_container: row.try_get("storage_container")?,
            result_blob_path: row.try_get("result_blob_path")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            priority: row.try_get("priority")?,
            correlation_id: row.try_get("correlation_id")?,
            status,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            max_runtime: std::time::Duration::from_secs_f64(max_runtime_secs.max(0.0)),
            last_error: row.try_get("last_error")?,
            run_by: row.try_get("run_by")?,
            backend_pid: row.try_get("backend_pid")?,
        })
    }
}

/// Configuration for submitting an export job.
///
/// Only the query and the storage sink are mandatory; everything else has a
/// queue-level default.
pub struct EnqueueJob {
    pub(crate) query_sql: String,
    pub(crate) storage_account: String,
    pub(crate) storage_container: String,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
    pub(crate) priority: i32,
    pub(crate) correlation_id: Option<String>,
    pub(crate) max_runtime: Option<std::time::Duration>,
    pub(crate) max_attempts: u16,
}

impl EnqueueJob {
    /// Default number of claims a job may consume before it goes terminal.
    pub(crate) const DEFAULT_MAX_ATTEMPTS: u16 = 3;

    /// Per-attempt deadline applied when none is given.
    pub(crate) const DEFAULT_MAX_RUNTIME: std::time::Duration =
        std::time::Duration::from_secs(30 * 60);

    /// Create a new `EnqueueJob` for `query_sql` writing to
    /// `storage_account`/`storage_container`.
    pub fn new(
        query_sql: impl Into<String>,
        storage_account: impl Into<String>,
        storage_container: impl Into<String>,
    ) -> Self {
        Self {
            query_sql: query_sql.into(),
            storage_account: storage_account.into(),
            storage_container: storage_container.into(),
            scheduled_at: None,
            priority: 0,
            correlation_id: None,
            max_runtime: None,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Earliest time the job may run; defaults to immediately.
    pub fn scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }

    /// Queue priority in `[-1000, 1000]`; higher runs first.
    pub fn priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    /// Opaque client tag; also seeds the result blob prefix.
    pub fn correlation_id(self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self
        }
    }

    /// Per-attempt wall-clock deadline in `(0, 24h]`; defaults to 30 minutes.
    pub fn max_runtime(self, max_runtime: std::time::Duration) -> Self {
        Self {
            max_runtime: Some(max_runtime),
            ..self
        }
    }

    /// Set how many attempts the job may consume; must be at least 1.
    pub fn max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }
}
