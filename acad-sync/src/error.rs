//! Error types for acad-sync
//!
//! Collaborator calls fail with [`StoreError`]; engine internals with
//! [`SyncError`]. Both expose an [`ErrorClass`] so boundary logging can tell
//! quota exhaustion from network trouble from malformed data.

use std::fmt;
use thiserror::Error;

/// Coarse classification used in logs and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, lock contention, 5xx: worth one retry
    Transient,
    /// Quota or rate limit: back off, disable realtime
    Quota,
    NotFound,
    Database,
    /// Malformed document or row
    Shape,
    /// Caller input rejected
    Invalid,
    /// Session closed while the operation was in flight
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Quota => "quota",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Database => "database",
            ErrorClass::Shape => "shape",
            ErrorClass::Invalid => "invalid",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by the relational store or the document cache
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Malformed data: {0}")]
    Shape(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Transient(_) => ErrorClass::Transient,
            StoreError::NotFound(_) => ErrorClass::NotFound,
            StoreError::QuotaExceeded(_) => ErrorClass::Quota,
            StoreError::Shape(_) => ErrorClass::Shape,
            StoreError::Database(db_err) => {
                let locked = db_err.to_string().contains("database is locked");
                if locked || matches!(db_err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Database
                }
            }
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Shape(err.to_string())
    }
}

impl From<acad_common::Error> for StoreError {
    fn from(err: acad_common::Error) -> Self {
        match err {
            acad_common::Error::Database(e) => StoreError::Database(e),
            acad_common::Error::Io(e) => StoreError::Transient(e.to_string()),
            acad_common::Error::NotFound(msg) => StoreError::NotFound(msg),
            acad_common::Error::Serialization(e) => StoreError::Shape(e.to_string()),
            other => StoreError::Shape(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Engine-level failure
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cached document has a shape no migration can repair
    #[error("Unmigratable cached document: {0}")]
    Unmigratable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No snapshot loaded for owner {0}")]
    NotLoaded(String),

    #[error("Session closed")]
    Cancelled,

    #[error("Cache write queue closed")]
    WriterClosed,

    #[error(transparent)]
    Common(#[from] acad_common::Error),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Store(e) => e.class(),
            SyncError::Unmigratable(_) => ErrorClass::Shape,
            SyncError::InvalidInput(_) => ErrorClass::Invalid,
            SyncError::NotLoaded(_) => ErrorClass::NotFound,
            SyncError::Cancelled | SyncError::WriterClosed => ErrorClass::Cancelled,
            SyncError::Common(e) if e.is_transient() => ErrorClass::Transient,
            SyncError::Common(acad_common::Error::InvalidInput(_)) => ErrorClass::Invalid,
            SyncError::Common(acad_common::Error::Serialization(_)) => ErrorClass::Shape,
            SyncError::Common(_) => ErrorClass::Database,
        }
    }

    /// Worth a single automatic retry
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
