//! Two-phase worker: claim one job under the parallelism cap, execute it
//! with a wall-clock deadline, persist the outcome.
//!
//! [`Worker::run_next_job`] pins a single pooled connection for the whole
//! job. Transaction T1 claims the row and commits, making `running` visible
//! to observers before the long-running work starts; transaction T2 re-locks
//! the row, drives the executor, and commits the terminal state. The
//! parallelism slot is a session-level advisory lock on the pinned
//! connection, so it survives the commit between T1 and T2 and disappears
//! with the session if the worker dies.

use chrono::{DateTime, Utc};
use futures::{FutureExt as _, StreamExt as _};
use sqlx::Acquire as _;
use sqlx::{PgConnection, Row as _};

use crate::MAX_LAST_ERROR_LEN;
use crate::config::ClaimConfig;
use crate::error::Error;
use crate::executor::{ExportRequest, QueryExecutor};
use crate::job::JobStatus;
use crate::slots;
use crate::utils::Ticker;

/// Floor and ceiling applied to `max_runtime` before the deadline is armed.
const RUNTIME_FLOOR: std::time::Duration = std::time::Duration::from_secs(1);
const RUNTIME_CEILING: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Retry backoff grows one minute per attempt up to this cap.
const BACKOFF_CAP_MINUTES: i32 = 10;

/// What [`Worker::run_next_job`] did with the job it claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Export finished; the blob path is recorded on the row.
    Succeeded { job_id: i64 },
    /// The attempt failed; the job went back to `pending` with backoff.
    Retried { job_id: i64 },
    /// The attempt failed and the attempt budget is exhausted.
    Failed { job_id: i64 },
    /// The claimed row vanished or changed state before execution started.
    Skipped { job_id: i64 },
}

/// Claims and executes jobs against a shared queue.
///
/// The pool must allow at least as many connections as jobs this process
/// runs concurrently: each in-flight job pins one connection from claim to
/// terminal status.
pub struct Worker<E> {
    pool: sqlx::PgPool,
    executor: E,
    worker_name: String,
}

/// A claimed row bound to the slot that admitted it.
struct ClaimedJob {
    job_id: i64,
    slot_id: i32,
}

/// Runner-side snapshot of the claimed row, read back under lock in T2.
struct RunnerRow {
    status: JobStatus,
    query_sql: String,
    storage_account: String,
    storage_container: String,
    correlation_id: Option<String>,
    attempt_count: i32,
    max_attempts: i32,
    max_runtime: std::time::Duration,
}

impl<E> Worker<E> {
    /// Create a worker bound to `pool` that executes jobs with `executor`.
    pub fn new(pool: sqlx::PgPool, executor: E) -> Self {
        Self {
            pool,
            executor,
            worker_name: format!("exportq-{}", std::process::id()),
        }
    }

    /// Identity recorded as `run_by` on claimed rows; defaults to
    /// `exportq-<pid>`.
    pub fn worker_name(self, worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            ..self
        }
    }
}

impl<E> Worker<E>
where
    E: QueryExecutor,
{
    /// Claim and execute at most one job. The single entry point for
    /// schedulers; idempotent and safe to invoke concurrently from any
    /// number of workers.
    ///
    /// Returns `None` when nothing was claimed: empty queue, saturated slot
    /// semaphore, or no connection headroom. Executor failures and deadline
    /// expiry never surface here; they are recorded on the job row. Only
    /// store errors propagate.
    pub async fn run_next_job(&self) -> Result<Option<RunOutcome>, Error> {
        let mut conn = self.pool.acquire().await?;

        let Some(claimed) = self.claim_next_job(&mut conn).await? else {
            return Ok(None);
        };

        let outcome = self.run_claimed(&mut conn, &claimed).await;

        // Release exactly once, whatever happened above. A failure here is
        // logged, not raised: the session going away frees the slot anyway.
        if let Err(error) = slots::release(&mut conn, claimed.slot_id).await {
            tracing::error!(
                error = %error,
                slot_id = claimed.slot_id,
                "failed to release parallelism slot"
            );
        }

        outcome.map(Some)
    }

    /// Poll the queue every `poll_interval` until `signal` resolves,
    /// draining all runnable jobs on each tick.
    pub async fn run_until<Signal>(&self, poll_interval: std::time::Duration, signal: Signal)
    where
        Signal: Future + Send,
    {
        let tick = Ticker::new(poll_interval).fuse();
        let signal = signal.fuse();
        futures::pin_mut!(tick);
        futures::pin_mut!(signal);

        loop {
            futures::select! {
                _ = &mut signal => {
                    tracing::debug!("shutdown signal received; stopping poll loop");
                    break;
                }
                tick_val = tick.next() => {
                    if tick_val.is_none() {
                        break;
                    }
                    self.drain().await;
                }
            }
        }
    }

    /// Poll the queue every `poll_interval`, forever.
    pub async fn run(&self, poll_interval: std::time::Duration) {
        self.run_until(poll_interval, std::future::pending::<()>())
            .await
    }

    async fn drain(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(outcome = ?outcome, "job processed");
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(error = %error, "failed to run next job");
                    break;
                }
            }
        }
    }

    /// T1: claim planning. Reads configuration, samples connection headroom,
    /// binds a slot, and flips one pending row to `running`.
    async fn claim_next_job(&self, conn: &mut PgConnection) -> Result<Option<ClaimedJob>, Error> {
        let config = ClaimConfig::load(&mut *conn).await?;

        let free = connection_headroom(&mut *conn).await?;
        if free <= config.min_free_connections {
            tracing::debug!(
                free_connections = free,
                min_free_connections = config.min_free_connections,
                "no connection headroom; yielding"
            );
            return Ok(None);
        }

        let Some(slot_id) = slots::acquire(&mut *conn, config.max_parallel_jobs).await? else {
            tracing::trace!("all parallelism slots busy");
            return Ok(None);
        };

        // From here on the slot must not leak: release it on every path that
        // does not hand it to the runner.
        match self.claim_row(&mut *conn).await {
            Ok(Some(job_id)) => {
                tracing::info!(job_id = job_id, slot_id = slot_id, "job claimed");
                Ok(Some(ClaimedJob { job_id, slot_id }))
            }
            Ok(None) => {
                slots::release(&mut *conn, slot_id).await?;
                Ok(None)
            }
            Err(error) => {
                if let Err(release_error) = slots::release(&mut *conn, slot_id).await {
                    tracing::error!(
                        error = %release_error,
                        slot_id = slot_id,
                        "failed to release slot after claim error"
                    );
                }
                Err(error)
            }
        }
    }

    async fn claim_row(&self, conn: &mut PgConnection) -> Result<Option<i64>, Error> {
        let mut tx = conn.begin().await?;
        let job_id: Option<i64> = sqlx::query_scalar(CLAIM_SQL)
            .bind(&self.worker_name)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job_id)
    }

    /// T2: execute the claimed job and persist the outcome. The row stays
    /// exclusively locked for the duration of the attempt.
    async fn run_claimed(
        &self,
        conn: &mut PgConnection,
        claimed: &ClaimedJob,
    ) -> Result<RunOutcome, Error> {
        let job_id = claimed.job_id;
        let mut tx = conn.begin().await?;

        let row = sqlx::query(RUNNER_SELECT_SQL)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            // Benign race: purged between T1 and T2.
            tracing::warn!(job_id = job_id, "claimed row no longer exists");
            return Ok(RunOutcome::Skipped { job_id });
        };
        let snapshot = RunnerRow::from_row(&row)?;
        if snapshot.status != JobStatus::Running {
            tracing::warn!(
                job_id = job_id,
                status = snapshot.status.as_str(),
                "claimed row left the running state"
            );
            return Ok(RunOutcome::Skipped { job_id });
        }

        let blob_path = blob_path(job_id, snapshot.correlation_id.as_deref(), Utc::now());
        let runtime = clamp_runtime(snapshot.max_runtime);

        let request = ExportRequest {
            query_sql: &snapshot.query_sql,
            storage_account: &snapshot.storage_account,
            storage_container: &snapshot.storage_container,
            blob_path: &blob_path,
            deadline: runtime,
        };

        // Deadline enforcement lives at the executor boundary; the runner
        // itself does not time-share.
        let result = tokio::time::timeout(
            runtime,
            self.executor.execute_readonly_to_blob(request),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                sqlx::query(SUCCESS_SQL)
                    .bind(job_id)
                    .bind(&blob_path)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                tracing::info!(job_id = job_id, blob_path = %blob_path, "export succeeded");
                Ok(RunOutcome::Succeeded { job_id })
            }
            Ok(Err(error)) => {
                let diagnostic = diagnostic(
                    snapshot.attempt_count,
                    snapshot.max_attempts,
                    "executor_error",
                    &error.to_string(),
                );
                self.fail_attempt(tx, job_id, &snapshot, diagnostic).await
            }
            Err(_elapsed) => {
                let diagnostic = diagnostic(
                    snapshot.attempt_count,
                    snapshot.max_attempts,
                    "deadline_exceeded",
                    &format!("query did not finish within {}s", runtime.as_secs()),
                );
                self.fail_attempt(tx, job_id, &snapshot, diagnostic).await
            }
        }
    }

    /// Failure path: back to `pending` with backoff, or terminal `failed`
    /// when the attempt budget is gone. The diagnostic is appended to
    /// `last_error` either way.
    async fn fail_attempt(
        &self,
        mut tx: sqlx::Transaction<'_, sqlx::Postgres>,
        job_id: i64,
        snapshot: &RunnerRow,
        diagnostic: String,
    ) -> Result<RunOutcome, Error> {
        let exhausted = snapshot.attempt_count >= snapshot.max_attempts;
        if exhausted {
            sqlx::query(FAIL_SQL)
                .bind(job_id)
                .bind(&diagnostic)
                .execute(&mut *tx)
                .await?;
        } else {
            let backoff = backoff_minutes(snapshot.attempt_count);
            sqlx::query(RETRY_SQL)
                .bind(job_id)
                .bind(backoff)
                .bind(&diagnostic)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::warn!(
            job_id = job_id,
            attempt = snapshot.attempt_count,
            max_attempts = snapshot.max_attempts,
            exhausted = exhausted,
            "export attempt failed"
        );
        Ok(if exhausted {
            RunOutcome::Failed { job_id }
        } else {
            RunOutcome::Retried { job_id }
        })
    }
}

const CLAIM_SQL: &str = r"
WITH next_job AS (
    SELECT job_id
    FROM exportq_jobs
    WHERE status = 'pending'
      AND scheduled_at <= now()
      AND attempt_count < max_attempts
    ORDER BY priority DESC, scheduled_at ASC, job_id ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE exportq_jobs AS job
SET status = 'running',
    started_at = now(),
    updated_at = now(),
    attempt_count = job.attempt_count + 1,
    run_by = $1,
    backend_pid = pg_backend_pid()
FROM next_job
WHERE job.job_id = next_job.job_id
RETURNING job.job_id
";

const RUNNER_SELECT_SQL: &str = r"
SELECT status, query_sql, storage_account, storage_container, correlation_id,
       attempt_count, max_attempts,
       extract(epoch FROM max_runtime)::double precision AS max_runtime_secs
FROM exportq_jobs
WHERE job_id = $1
FOR UPDATE
";

const SUCCESS_SQL: &str = r"
UPDATE exportq_jobs
SET status = 'succeeded',
    finished_at = now(),
    updated_at = now(),
    result_blob_path = $2,
    last_error = NULL,
    backend_pid = NULL
WHERE job_id = $1
";

const RETRY_SQL: &str = r"
UPDATE exportq_jobs
SET status = 'pending',
    scheduled_at = now() + make_interval(mins => $2::int),
    started_at = NULL,
    finished_at = NULL,
    updated_at = now(),
    last_error = left(concat_ws(E'\n', last_error, $3::text), 4000),
    backend_pid = NULL
WHERE job_id = $1
";

const FAIL_SQL: &str = r"
UPDATE exportq_jobs
SET status = 'failed',
    finished_at = now(),
    updated_at = now(),
    last_error = left(concat_ws(E'\n', last_error, $2::text), 4000),
    backend_pid = NULL
WHERE job_id = $1
";

impl RunnerRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, Error> {
        let status_str: String = row.try_get("status")?;
        let status = JobStatus::from_str(&status_str).ok_or_else(|| {
            Error::invalid_argument(format!("unknown job status in store: {status_str}"))
        })?;
        let max_runtime_secs: f64 = row.try_get("max_runtime_secs")?;

        Ok(Self {
            status,
            query_sql: row.try_get("query_sql")?,
            storage_account: row.try_get("storage_account")?,
            storage_container: row.try_get("storage_container")?,
            correlation_id: row.try_get("correlation_id")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            max_runtime: std::time::Duration::from_secs_f64(max_runtime_secs.max(0.0)),
        })
    }
}

/// `free = max(max_connections - current backends, 0)`, sampled, not
/// reserved.
async fn connection_headroom(conn: &mut PgConnection) -> Result<i32, Error> {
    let free: i32 = sqlx::query_scalar(
        "SELECT greatest(current_setting('max_connections')::int \
                 - (SELECT count(*) FROM pg_stat_activity)::int, 0)",
    )
    .fetch_one(conn)
    .await?;
    Ok(free)
}

/// Destination blob for one attempt:
/// `<prefix>/<job_id>/<YYYYMMDDhhmmss>.parquet`, where the prefix is the
/// sanitized correlation id or the job id.
fn blob_path(job_id: i64, correlation_id: Option<&str>, now: DateTime<Utc>) -> String {
    let prefix = match correlation_id.map(sanitize_prefix) {
        Some(prefix) if !prefix.is_empty() => prefix,
        _ => job_id.to_string(),
    };
    format!("{prefix}/{job_id}/{}.parquet", now.format("%Y%m%d%H%M%S"))
}

/// Collapse runs of characters outside `[A-Za-z0-9_-]` into a single `_`.
fn sanitize_prefix(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_replaced = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            last_replaced = false;
        } else if !last_replaced {
            out.push('_');
            last_replaced = true;
        }
    }
    out
}

fn clamp_runtime(max_runtime: std::time::Duration) -> std::time::Duration {
    max_runtime.clamp(RUNTIME_FLOOR, RUNTIME_CEILING)
}

/// Linear backoff, capped: `min(attempt, 10)` minutes.
fn backoff_minutes(attempt: i32) -> i32 {
    attempt.min(BACKOFF_CAP_MINUTES)
}

/// `attempt n/m [code]: message`, truncated to the `last_error` cap.
fn diagnostic(attempt: i32, max_attempts: i32, code: &str, message: &str) -> String {
    let mut text = format!("attempt {attempt}/{max_attempts} [{code}]: {message}");
    if let Some((idx, _)) = text.char_indices().nth(MAX_LAST_ERROR_LEN) {
        text.truncate(idx);
    }
    text
}
