//! Claim-time configuration.
//!
//! Settings live in the `exportq_settings` table so every worker in the
//! cluster observes the same values and operators can adjust them at
//! runtime. Missing, unparsable, or out-of-range entries silently fall back
//! to the defaults; a bad setting must never stop the queue.

use sqlx::PgConnection;

pub(crate) const DEFAULT_MAX_PARALLEL_JOBS: i32 = 4;
pub(crate) const DEFAULT_MIN_FREE_CONNECTIONS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClaimConfig {
    /// Size of the cluster-global slot semaphore, clamped to `[1, 10000]`.
    pub(crate) max_parallel_jobs: i32,
    /// Headroom the claim planner leaves on the shared database, clamped to
    /// `[0, 1000]`.
    pub(crate) min_free_connections: i32,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_parallel_jobs: DEFAULT_MAX_PARALLEL_JOBS,
            min_free_connections: DEFAULT_MIN_FREE_CONNECTIONS,
        }
    }
}

impl ClaimConfig {
    pub(crate) async fn load(conn: &mut PgConnection) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT key, value FROM exportq_settings \
             WHERE key IN ('max_parallel_jobs', 'min_free_connections')",
        )
        .fetch_all(conn)
        .await?;

        let mut config = Self::default();
        for (key, value) in rows {
            match key.as_str() {
                "max_parallel_jobs" => {
                    config.max_parallel_jobs =
                        parse_setting(&key, &value, DEFAULT_MAX_PARALLEL_JOBS, 1, 10_000);
                }
                "min_free_connections" => {
                    config.min_free_connections =
                        parse_setting(&key, &value, DEFAULT_MIN_FREE_CONNECTIONS, 0, 1_000);
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

fn parse_setting(key: &str, value: &str, default: i32, min: i32, max: i32) -> i32 {
    match value.trim().parse::<i32>() {
        Ok(parsed) => parsed.clamp(min, max),
        Err(_) => {
            tracing::debug!(key = key, value = value, "unparsable setting, using default");
            default
        }
    }
}
