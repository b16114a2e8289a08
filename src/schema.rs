//! Persisted state layout and installer.
//!
//! One logical job table per database, two companion tables (runtime
//! settings and the schema-version marker), and the two partial indexes the
//! claim planner and the retention purge lean on.

use sqlx::PgPool;

use crate::error::Error;

/// Version recorded by [`install`]; bump alongside layout changes.
pub const SCHEMA_VERSION: &str = "1";

const SETUP_SQL: &str = r"
CREATE TABLE IF NOT EXISTS exportq_jobs (
    job_id            bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    query_sql         text NOT NULL,
    storage_account   text NOT NULL,
    storage_container text NOT NULL,
    result_blob_path  text,
    scheduled_at      timestamptz NOT NULL DEFAULT now(),
    created_at        timestamptz NOT NULL DEFAULT now(),
    updated_at        timestamptz NOT NULL DEFAULT now(),
    started_at        timestamptz,
    finished_at       timestamptz,
    priority          integer NOT NULL DEFAULT 0,
    correlation_id    text,
    status            text NOT NULL DEFAULT 'pending',
    attempt_count     integer NOT NULL DEFAULT 0,
    max_attempts      integer NOT NULL DEFAULT 3,
    max_runtime       interval NOT NULL DEFAULT interval '30 minutes',
    last_error        text,
    run_by            text,
    backend_pid       integer,
    CONSTRAINT exportq_jobs_status_check CHECK (
        status IN ('pending', 'running', 'succeeded', 'failed', 'cancelled')
    ),
    CONSTRAINT exportq_jobs_max_runtime_check CHECK (
        max_runtime > interval '0' AND max_runtime <= interval '24 hours'
    ),
    CONSTRAINT exportq_jobs_priority_check CHECK (
        priority BETWEEN -1000 AND 1000
    ),
    CONSTRAINT exportq_jobs_attempts_check CHECK (
        attempt_count >= 0 AND max_attempts >= 1 AND attempt_count <= max_attempts
    )
);

CREATE INDEX IF NOT EXISTS exportq_jobs_pending_idx
    ON exportq_jobs (priority DESC, scheduled_at, job_id)
    WHERE status = 'pending';

CREATE INDEX IF NOT EXISTS exportq_jobs_finished_idx
    ON exportq_jobs (finished_at)
    WHERE finished_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS exportq_settings (
    key   text PRIMARY KEY,
    value text NOT NULL
);

INSERT INTO exportq_settings (key, value)
VALUES ('max_parallel_jobs', '4'),
       ('min_free_connections', '5')
ON CONFLICT (key) DO NOTHING;

CREATE TABLE IF NOT EXISTS exportq_schema_version (
    version      text PRIMARY KEY,
    installed_at timestamptz NOT NULL DEFAULT now(),
    installed_by text NOT NULL DEFAULT current_user
);
";

/// Create the queue tables, indexes, and settings defaults. Idempotent.
pub async fn install(pool: &PgPool) -> Result<(), Error> {
    sqlx::raw_sql(SETUP_SQL).execute(pool).await?;
    sqlx::query(
        "INSERT INTO exportq_schema_version (version) VALUES ($1) \
         ON CONFLICT (version) DO NOTHING",
    )
    .bind(SCHEMA_VERSION)
    .execute(pool)
    .await?;
    Ok(())
}

/// Highest installed schema version, or `None` on a pristine database.
pub async fn version(pool: &PgPool) -> Result<Option<String>, Error> {
    let version: Option<String> =
        sqlx::query_scalar("SELECT max(version) FROM exportq_schema_version")
            .fetch_one(pool)
            .await?;
    Ok(version)
}
