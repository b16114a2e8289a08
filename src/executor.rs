//! Contract with the external query executor.
//!
//! The queue owns state transitions; the executor owns running the
//! user-supplied query and streaming its result set to the object store. The
//! runner talks to it through this single operation and otherwise treats it
//! as a black box.

/// Destination and budget for one export attempt.
#[derive(Debug, Clone, Copy)]
pub struct ExportRequest<'a> {
    /// The validated read-only query to run.
    pub query_sql: &'a str,
    pub storage_account: &'a str,
    pub storage_container: &'a str,
    /// Blob path computed by the runner, unique per attempt.
    pub blob_path: &'a str,
    /// Remaining wall-clock budget. Implementations should abort and raise
    /// once it elapses; the runner additionally enforces it at the call
    /// boundary.
    pub deadline: std::time::Duration,
}

#[trait_variant::make(QueryExecutor: Send)]
pub trait LocalQueryExecutor {
    type Error: std::error::Error + Send;

    /// Run `request.query_sql` read-only and stream the result set to
    /// `(storage_account, storage_container, blob_path)`.
    ///
    /// A zero-row result is still success; whether an empty blob is
    /// physically created is implementation-defined.
    async fn execute_readonly_to_blob(
        &self,
        request: ExportRequest<'_>,
    ) -> Result<(), Self::Error>;
}
