//! Durable PostgreSQL job queue for long-running read-only analytical exports.
//!
//! Clients submit read-only queries with [`Client::enqueue`]; worker
//! processes call [`Worker::run_next_job`] on a timer, claim one job under a
//! cluster-global parallelism cap, execute it through a [`QueryExecutor`]
//! that streams the result set to an object-store blob, and record the
//! terminal status on the job row.
//!
//! All coordination happens through the shared database: claims take
//! row-level locks with the skip-locked discipline, and the parallelism cap
//! is a set of session-scoped advisory locks, so a crashed worker releases
//! its slot when its connection dies. No in-process locks are involved; any
//! number of processes may drive the queue concurrently.

pub mod client;
pub mod error;
pub mod executor;
pub mod job;
pub mod metrics;
pub mod schema;
pub mod worker;

mod config;
mod maintenance;
mod slots;
mod utils;
mod validate;

pub use client::Client;
pub use error::{Error, ErrorKind};
pub use executor::{ExportRequest, QueryExecutor};
pub use job::{EnqueueJob, Job, JobStatus};
pub use metrics::QueueMetrics;
pub use worker::{RunOutcome, Worker};

/// Advisory-lock namespace (`classid`) for the parallelism slots; ascii "EXPQ".
///
/// Slots are keyed `(SLOT_LOCK_NAMESPACE, slot_id)` and shared by every
/// worker connected to the same cluster.
pub const SLOT_LOCK_NAMESPACE: i32 = 0x4558_5051;

/// Cap applied to `last_error` on every write, in characters.
pub(crate) const MAX_LAST_ERROR_LEN: usize = 4000;
