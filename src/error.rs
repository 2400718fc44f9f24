//! Error types for flatstore
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using FlatError
pub type Result<T> = std::result::Result<T, FlatError>;

/// Unified error type for flatstore operations
#[derive(Debug, Error)]
pub enum FlatError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Contract Violations
    // -------------------------------------------------------------------------
    #[error("Store is read-only")]
    ReadOnlyViolation,

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Keys must not be empty")]
    InvalidKey,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Store is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Heap Errors
    // -------------------------------------------------------------------------
    /// `key` names the write that did not fit, when known
    #[error("Heap full: {reason}")]
    HeapFull {
        reason: String,
        key: Option<Vec<u8>>,
    },

    #[error("Heap corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Batch / Crash Log Errors
    // -------------------------------------------------------------------------
    #[error("A batch is already open")]
    NestedBatch,

    #[error("No batch is open")]
    NoOpenBatch,

    /// Raised by `FailureTrack` to abandon an operation mid-flight.
    #[cfg(any(test, feature = "fault-injection"))]
    #[error("Injected failure")]
    InjectedFailure,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration / Ownership Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data directory is already locked by another instance: {}", .0.display())]
    AlreadyLocked(PathBuf),
}

impl FlatError {
    /// Shorthand for a heap-full error with context
    pub(crate) fn heap_full(reason: impl Into<String>) -> Self {
        FlatError::HeapFull {
            reason: reason.into(),
            key: None,
        }
    }

    /// Attach the key being written to a heap-full error
    pub(crate) fn for_key(self, key: &[u8]) -> Self {
        match self {
            FlatError::HeapFull { reason, key: None } => FlatError::HeapFull {
                reason,
                key: Some(key.to_vec()),
            },
            other => other,
        }
    }

    /// Key of the write that overflowed the heap
    pub fn overflowed_key(&self) -> Option<&[u8]> {
        match self {
            FlatError::HeapFull { key, .. } => key.as_deref(),
            _ => None,
        }
    }

    /// Whether this error leaves the store unusable (never retried)
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlatError::Corruption(_) | FlatError::Io(_))
    }
}

impl From<bincode::Error> for FlatError {
    fn from(err: bincode::Error) -> Self {
        FlatError::Serialization(err.to_string())
    }
}
