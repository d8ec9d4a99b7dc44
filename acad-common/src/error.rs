//! Common error types for the academic sync workspace

use thiserror::Error;

/// Common result type for acad operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the stores and the sync engine
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cached document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the underlying database reported lock contention or a
    /// dropped connection, i.e. the call is worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(db_err) => matches!(
                db_err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ) || db_err.to_string().contains("database is locked"),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = Error::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }

    #[test]
    fn test_not_found_is_not_transient() {
        let err = Error::NotFound("professor p-1".to_string());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Not found: professor p-1");
    }
}
