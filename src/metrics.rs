//! Read-only aggregate snapshot over the job table.

use serde::Serialize;
use sqlx::Row as _;

use crate::client::Client;
use crate::error::Error;

/// Point-in-time queue health: counts by status plus how long due pending
/// work has been waiting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    /// Longest wait among pending jobs whose `scheduled_at` has passed;
    /// `None` when nothing is due.
    pub oldest_pending_wait: Option<std::time::Duration>,
    /// Mean wait over the same rows.
    pub avg_pending_wait: Option<std::time::Duration>,
}

const METRICS_SQL: &str = r"
SELECT
    count(*) FILTER (WHERE status = 'pending')   AS pending,
    count(*) FILTER (WHERE status = 'running')   AS running,
    count(*) FILTER (WHERE status = 'succeeded') AS succeeded,
    count(*) FILTER (WHERE status = 'failed')    AS failed,
    count(*) FILTER (WHERE status = 'cancelled') AS cancelled,
    extract(epoch FROM max(now() - scheduled_at)
        FILTER (WHERE status = 'pending' AND scheduled_at <= now()))::double precision
        AS oldest_pending_wait_secs,
    extract(epoch FROM avg(now() - scheduled_at)
        FILTER (WHERE status = 'pending' AND scheduled_at <= now()))::double precision
        AS avg_pending_wait_secs
FROM exportq_jobs
";

impl Client {
    /// Snapshot the queue counters and pending-wait durations.
    pub async fn queue_metrics(&self) -> Result<QueueMetrics, Error> {
        let row = sqlx::query(METRICS_SQL).fetch_one(&self.pool).await?;

        let wait = |column: &str| -> Result<Option<std::time::Duration>, sqlx::Error> {
            let secs: Option<f64> = row.try_get(column)?;
            Ok(secs.map(|s| std::time::Duration::from_secs_f64(s.max(0.0))))
        };

        Ok(QueueMetrics {
            pending: row.try_get("pending")?,
            running: row.try_get("running")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
            cancelled: row.try_get("cancelled")?,
            oldest_pending_wait: wait("oldest_pending_wait_secs")?,
            avg_pending_wait: wait("avg_pending_wait_secs")?,
        })
    }
}
