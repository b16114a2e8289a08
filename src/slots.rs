//! Cluster-global parallelism slots.
//!
//! Each slot is a *session-level* advisory lock keyed
//! `(SLOT_LOCK_NAMESPACE, slot_id)`. Session scope matters twice over: the
//! lock survives the commit between the claim and run transactions, and a
//! worker that dies mid-job frees its slot the moment its connection is torn
//! down. Binding the slot id to the claimed job lets the runner release the
//! exact slot it holds.

use sqlx::PgConnection;

use crate::SLOT_LOCK_NAMESPACE;

/// Try slots `1..=max_parallel_jobs` in ascending order, non-blocking; the
/// first free slot wins. `None` means the semaphore is saturated.
pub(crate) async fn acquire(
    conn: &mut PgConnection,
    max_parallel_jobs: i32,
) -> Result<Option<i32>, sqlx::Error> {
    for slot_id in 1..=max_parallel_jobs {
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(SLOT_LOCK_NAMESPACE)
            .bind(slot_id)
            .fetch_one(&mut *conn)
            .await?;
        if locked {
            return Ok(Some(slot_id));
        }
    }
    Ok(None)
}

/// Release a slot previously acquired on this same connection.
///
/// Releasing a slot that is not held indicates an accounting bug elsewhere;
/// it is logged rather than escalated because the job outcome is already
/// committed by the time the slot is dropped.
pub(crate) async fn release(conn: &mut PgConnection, slot_id: i32) -> Result<(), sqlx::Error> {
    let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
        .bind(SLOT_LOCK_NAMESPACE)
        .bind(slot_id)
        .fetch_one(&mut *conn)
        .await?;
    if !released {
        tracing::warn!(slot_id = slot_id, "advisory slot was not held at release");
    }
    Ok(())
}
