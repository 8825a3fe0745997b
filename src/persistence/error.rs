//! Error types for the record store

use thiserror::Error;

/// Result type alias for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or writing records.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("unsupported connection string: {0}")]
    ConnectionString(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid record {name}: {reason}")]
    InvalidRecord { name: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
