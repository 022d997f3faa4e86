// this_file: src/error.rs
//! Error types for the fcdircache library

use thiserror::Error;

/// Main error type for directory cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// Directory or cache file does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cache exists but its time checksum no longer matches the directory
    #[error("Stale cache: {0}")]
    Stale(String),

    /// Magic, version, size or offset validation failed
    #[error("Malformed cache: {0}")]
    Malformed(String),

    /// IO operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation failure while building or loading a cache
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Cross-process lock unavailable
    #[error("Lock contention: {0}")]
    LockContention(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing error in a configuration file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error is an ordinary cache miss that callers recover from
    /// by trying the next candidate or rebuilding.
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Stale(_) | Error::Malformed(_)
        )
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Malformed(reason.into())
    }
}

/// Result type alias for directory cache operations
pub type Result<T> = std::result::Result<T, Error>;
