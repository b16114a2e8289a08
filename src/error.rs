//! Crate-wide error type.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures surfaced by queue operations.
pub enum ErrorKind {
    /// Enqueue admission rejected the submitted job.
    InvalidArgument,
    /// The operation referenced a job id that does not exist.
    NotFound,
    /// Errors originating from database interactions.
    DataBase,
}

#[derive(Debug)]
/// Error type returned by [`Client`](crate::Client) and
/// [`Worker`](crate::Worker) operations.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::InvalidArgument,
            inner: Box::new(MsgError(message.into())),
        }
    }

    pub(crate) fn not_found(job_id: i64) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            inner: Box::new(MsgError(format!("no job with id {job_id}"))),
        }
    }

    pub(crate) fn new_database(error: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self {
            kind: ErrorKind::DataBase,
            inner: error,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self::new_database(Box::new(value))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct MsgError(String);

impl std::fmt::Display for MsgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MsgError {}

/// True when `error` is the `lock_not_available` condition raised by
/// `FOR UPDATE NOWAIT` on a row somebody else holds.
pub(crate) fn is_lock_unavailable(error: &sqlx::Error) -> bool {
    matches!(
        error.as_database_error().and_then(|db| db.code()),
        Some(code) if code == "55P03"
    )
}

/// True when `error` is `insufficient_privilege`, e.g. the caller may not
/// signal other backends.
pub(crate) fn is_permission_denied(error: &sqlx::Error) -> bool {
    matches!(
        error.as_database_error().and_then(|db| db.code()),
        Some(code) if code == "42501"
    )
}
