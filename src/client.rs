//! Client handle: enqueue admission, soft cancel, job lookup.

use chrono::{DateTime, Utc};
use sqlx::postgres::types::PgInterval;

use crate::error::{Error, is_lock_unavailable};
use crate::job::{EnqueueJob, JOB_COLUMNS, Job, JobStatus};
use crate::validate;

/// A handle used to submit and manage export jobs.
///
/// Cheap to clone; all operations go through the wrapped pool.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) pool: sqlx::PgPool,
}

/// Upper bound on a per-attempt deadline.
const MAX_RUNTIME_CEILING: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

impl Client {
    /// Create a new client bound to the given connection pool.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Validate `job` and insert it as `pending`; returns the server-assigned
    /// job id.
    ///
    /// All admission failures surface as
    /// [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument) and
    /// leave the store untouched.
    pub async fn enqueue(&self, job: &EnqueueJob) -> Result<i64, Error> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_tx(job, &mut *conn).await
    }

    /// Enqueue using an existing transaction or connection.
    ///
    /// The insert becomes visible with the caller's commit, which lets a job
    /// be submitted atomically with the caller's own bookkeeping.
    #[allow(clippy::manual_async_fn)]
    pub fn enqueue_tx<'a, 'c, 'job, A>(
        &self,
        job: &'job EnqueueJob,
        tx: A,
    ) -> impl Future<Output = Result<i64, Error>> + Send
    where
        A: sqlx::Acquire<'c, Database = sqlx::Postgres> + Send + 'a,
    {
        async move {
            let normalized = normalize(job)?;

            let max_runtime = PgInterval::try_from(normalized.max_runtime)
                .map_err(|error| Error::new_database(error))?;

            let mut conn = tx.acquire().await?;
            let job_id: i64 = sqlx::query_scalar(
                "INSERT INTO exportq_jobs \
                     (query_sql, storage_account, storage_container, scheduled_at, \
                      priority, correlation_id, max_runtime, max_attempts) \
                 VALUES ($1, $2, $3, coalesce($4, now()), $5, $6, $7, $8) \
                 RETURNING job_id",
            )
            .bind(normalized.query_sql)
            .bind(normalized.storage_account)
            .bind(normalized.storage_container)
            .bind(normalized.scheduled_at)
            .bind(normalized.priority)
            .bind(normalized.correlation_id)
            .bind(max_runtime)
            .bind(normalized.max_attempts)
            .fetch_one(&mut *conn)
            .await?;

            tracing::debug!(job_id = job_id, "job enqueued");
            Ok(job_id)
        }
    }

    /// Soft-cancel a pending job.
    ///
    /// Returns `true` iff the row was transitioned to `cancelled`. A row in
    /// any other state, or one currently locked by a claim in flight, yields
    /// `false`; an unknown id is an error.
    pub async fn cancel(&self, job_id: i64) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = match sqlx::query_scalar(
            "SELECT status FROM exportq_jobs WHERE job_id = $1 FOR UPDATE NOWAIT",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        {
            Ok(row) => row,
            Err(error) if is_lock_unavailable(&error) => return Ok(false),
            Err(error) => return Err(error.into()),
        };

        let Some(status) = status else {
            return Err(Error::not_found(job_id));
        };
        if JobStatus::from_str(&status) != Some(JobStatus::Pending) {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE exportq_jobs \
             SET status = 'cancelled', finished_at = now(), updated_at = now(), \
                 backend_pid = NULL \
             WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(job_id = job_id, "job cancelled");
        Ok(true)
    }

    /// Fetch a single job record.
    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM exportq_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Job::from_row).transpose()
    }
}

#[derive(Debug)]
struct NormalizedJob<'a> {
    query_sql: &'a str,
    storage_account: &'a str,
    storage_container: &'a str,
    scheduled_at: Option<DateTime<Utc>>,
    priority: i32,
    correlation_id: Option<&'a str>,
    max_runtime: std::time::Duration,
    max_attempts: i32,
}

/// Apply the admission checks and defaults of the enqueue contract.
fn normalize(job: &EnqueueJob) -> Result<NormalizedJob<'_>, Error> {
    let query_sql = job.query_sql.trim();
    if query_sql.is_empty() {
        return Err(Error::invalid_argument("query_sql must be non-empty"));
    }
    if query_sql.chars().count() > validate::MAX_QUERY_LEN {
        return Err(Error::invalid_argument(format!(
            "query_sql exceeds {} characters",
            validate::MAX_QUERY_LEN
        )));
    }
    validate::ensure_read_only(query_sql)?;

    let storage_account = job.storage_account.trim();
    if storage_account.is_empty() {
        return Err(Error::invalid_argument("storage_account must be non-empty"));
    }
    let storage_container = job.storage_container.trim();
    if storage_container.is_empty() {
        return Err(Error::invalid_argument(
            "storage_container must be non-empty",
        ));
    }

    if !(-1000..=1000).contains(&job.priority) {
        return Err(Error::invalid_argument(
            "priority must be in [-1000, 1000]",
        ));
    }

    let max_runtime = job.max_runtime.unwrap_or(EnqueueJob::DEFAULT_MAX_RUNTIME);
    if max_runtime.is_zero() || max_runtime > MAX_RUNTIME_CEILING {
        return Err(Error::invalid_argument(
            "max_runtime must be in (0, 24 hours]",
        ));
    }

    if job.max_attempts == 0 {
        return Err(Error::invalid_argument("max_attempts must be at least 1"));
    }

    Ok(NormalizedJob {
        query_sql,
        storage_account,
        storage_container,
        scheduled_at: job.scheduled_at,
        priority: job.priority,
        correlation_id: job.correlation_id.as_deref(),
        max_runtime,
        max_attempts: i32::from(job.max_attempts),
    })
}
