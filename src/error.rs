use std::time::Duration;

use thiserror::Error;

/// Engine error taxonomy.
///
/// Usage and Validation errors are surfaced without touching the current
/// transaction. LockTimeout rolls back the failed write attempt but keeps the
/// surrounding transaction alive. Corruption is fatal to the transaction and,
/// with auto-rebuild enabled, triggers an offline rebuild. Io and Crypto are
/// fatal to the engine handle.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate key in unique index '{index}': {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Lock timeout after {0:?}")]
    LockTimeout(Duration),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Structural corruption: {0}")]
    Corruption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Database was rebuilt after corruption ({0}); retry the operation")]
    Rebuilt(String),
}

impl DbError {
    pub fn usage(msg: impl Into<String>) -> Self {
        DbError::Usage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        DbError::Validation(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        DbError::Corruption(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        DbError::Crypto(msg.into())
    }

    /// True when the error must tear down the engine handle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Io(_) | DbError::Crypto(_))
    }

    /// True when the current transaction cannot survive this error.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            DbError::Corruption(_) | DbError::Io(_) | DbError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
