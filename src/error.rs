//! Error types for the pack datastore.

/// Errors surfaced by the datastore and its components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The CID (or metadata key) is not present, or has been tombstoned.
    #[error("not found: {0}")]
    NotFound(String),

    /// The CID already exists, or a row was not in the state an update
    /// requires.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The connection string names a database backend this crate does not
    /// speak to.
    #[error("unsupported database backend: {0}")]
    UnsupportedBackend(String),

    /// Malformed store or packer configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A retryable database or object-store failure.
    #[error("transient backend error: {0}")]
    TransientBackend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A non-retryable failure: corruption, schema mismatch, malformed
    /// archive data.
    #[error("permanent backend error: {0}")]
    PermanentBackend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type alias for datastore operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(db.message().to_string())
            }
            e @ (sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed) => Error::TransientBackend(Box::new(e)),
            e => Error::PermanentBackend(Box::new(e)),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            e @ object_store::Error::Generic { .. } => Error::TransientBackend(Box::new(e)),
            e => Error::PermanentBackend(Box::new(e)),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Error::PermanentBackend(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::PermanentBackend(Box::new(err))
    }
}
