//! Operational maintenance: best-effort kill, orphan recovery, retention
//! purge.

use sqlx::postgres::types::PgInterval;

use crate::client::Client;
use crate::error::{Error, is_lock_unavailable, is_permission_denied};
use crate::job::JobStatus;

impl Client {
    /// Best-effort interrupt of an in-flight job.
    ///
    /// Terminates the recorded worker backend only when the pid is still
    /// present in the process table *and* its current statement plausibly
    /// belongs to a queue runner; pid reuse must never get an unrelated
    /// backend signalled. Whether or not a signal went out, a row still in
    /// `running` is transitioned to `cancelled`.
    ///
    /// Returns `true` iff termination was issued.
    pub async fn kill(&self, job_id: i64) -> Result<bool, Error> {
        let row: Option<(String, Option<i32>)> =
            sqlx::query_as("SELECT status, backend_pid FROM exportq_jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((status, backend_pid)) = row else {
            return Err(Error::not_found(job_id));
        };
        if JobStatus::from_str(&status) != Some(JobStatus::Running) {
            return Ok(false);
        }

        let mut signalled = false;
        if let Some(pid) = backend_pid {
            let looks_like_runner: bool = sqlx::query_scalar(
                "SELECT EXISTS ( \
                     SELECT 1 FROM pg_stat_activity \
                     WHERE pid = $1 AND query LIKE '%exportq_jobs%' \
                 )",
            )
            .bind(pid)
            .fetch_one(&self.pool)
            .await?;

            if looks_like_runner {
                match sqlx::query_scalar::<_, bool>("SELECT pg_terminate_backend($1)")
                    .bind(pid)
                    .fetch_one(&self.pool)
                    .await
                {
                    Ok(terminated) => signalled = terminated,
                    Err(error) if is_permission_denied(&error) => {
                        tracing::warn!(
                            job_id = job_id,
                            backend_pid = pid,
                            "not permitted to terminate backend; cancelling row only"
                        );
                    }
                    Err(error) => return Err(error.into()),
                }
            } else {
                tracing::warn!(
                    job_id = job_id,
                    backend_pid = pid,
                    "backend gone or running an unrelated statement; skipping signal"
                );
            }
        }

        // Transition the row if it is still running. Without a signal the
        // runner may be alive and holding the row lock; NOWAIT keeps this
        // path from stalling behind a long export.
        let mut tx = self.pool.begin().await?;
        let current: Option<String> = if signalled {
            sqlx::query_scalar("SELECT status FROM exportq_jobs WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?
        } else {
            match sqlx::query_scalar(
                "SELECT status FROM exportq_jobs WHERE job_id = $1 FOR UPDATE NOWAIT",
            )
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            {
                Ok(row) => row,
                Err(error) if is_lock_unavailable(&error) => return Ok(false),
                Err(error) => return Err(error.into()),
            }
        };

        if current.as_deref().and_then(JobStatus::from_str) == Some(JobStatus::Running) {
            sqlx::query(
                r"UPDATE exportq_jobs
                  SET status = 'cancelled', finished_at = now(), updated_at = now(),
                      last_error = left(concat_ws(E'\n', last_error, $2::text), 4000),
                      backend_pid = NULL
                  WHERE job_id = $1",
            )
            .bind(job_id)
            .bind(if signalled {
                "kill: worker backend terminated"
            } else {
                "kill: backend not signalled; row cancelled"
            })
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            tracing::info!(job_id = job_id, signalled = signalled, "running job killed");
        }

        Ok(signalled)
    }

    /// Requeue up to `limit` `running` rows whose recorded worker backend is
    /// gone from the process table. Rows that exhaust their attempt budget
    /// go terminal `failed` instead. Returns the number of rows acted upon.
    pub async fn requeue_orphaned_running_jobs(&self, limit: i64) -> Result<u64, Error> {
        let result = sqlx::query(ORPHAN_REQUEUE_SQL)
            .bind(limit)
            .execute(&self.pool)
            .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count = count, "requeued orphaned running jobs");
        }
        Ok(count)
    }

    /// Delete up to `limit` finished rows older than `older_than`. One
    /// bounded batch per call; callers repeat until the return is zero.
    pub async fn purge_old_jobs(
        &self,
        older_than: std::time::Duration,
        limit: i64,
    ) -> Result<u64, Error> {
        let older_than =
            PgInterval::try_from(older_than).map_err(|error| Error::new_database(error))?;

        let result = sqlx::query(PURGE_SQL)
            .bind(older_than)
            .bind(limit)
            .execute(&self.pool)
            .await?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::debug!(count = count, "purged finished jobs");
        }
        Ok(count)
    }
}

// The increment is clamped at max_attempts so the attempt invariant holds
// even when the final attempt is the one that orphaned.
const ORPHAN_REQUEUE_SQL: &str = r"
WITH orphans AS (
    SELECT job_id
    FROM exportq_jobs
    WHERE status = 'running'
      AND (backend_pid IS NULL
           OR NOT EXISTS (
                  SELECT 1 FROM pg_stat_activity a WHERE a.pid = exportq_jobs.backend_pid
              ))
    ORDER BY job_id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE exportq_jobs AS job
SET attempt_count = least(job.attempt_count + 1, job.max_attempts),
    status = CASE WHEN job.attempt_count + 1 >= job.max_attempts
                  THEN 'failed' ELSE 'pending' END,
    scheduled_at = CASE WHEN job.attempt_count + 1 >= job.max_attempts
                        THEN job.scheduled_at
                        ELSE now() + make_interval(mins => least(job.attempt_count + 1, 10)) END,
    started_at = CASE WHEN job.attempt_count + 1 >= job.max_attempts
                      THEN job.started_at ELSE NULL END,
    finished_at = CASE WHEN job.attempt_count + 1 >= job.max_attempts
                       THEN now() ELSE NULL END,
    backend_pid = NULL,
    last_error = left(concat_ws(E'\n', job.last_error,
                                'orphaned: worker backend no longer present'), 4000),
    updated_at = now()
FROM orphans
WHERE job.job_id = orphans.job_id
";

const PURGE_SQL: &str = r"
WITH expired AS (
    SELECT job_id
    FROM exportq_jobs
    WHERE finished_at IS NOT NULL
      AND finished_at < now() - $1
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
DELETE FROM exportq_jobs AS job
USING expired
WHERE job.job_id = expired.job_id
";
