//! Error types for storage-server calls.

use std::time::Duration;

use thiserror::Error;

use crate::types::ShareIndex;

/// Result type alias for storage-server operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors a storage server (or the path to it) can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server is read-only")]
    ReadOnly,

    #[error("server is full")]
    Full,

    #[error("no bucket allocated for share {0}")]
    NoBucket(ShareIndex),

    #[error("share {0} is already closed")]
    AlreadyClosed(ShareIndex),

    #[error("share {0} not found")]
    NotFound(ShareIndex),

    #[error("write of {len} bytes at offset {offset} exceeds allocated size {allocated}")]
    OutOfBounds { offset: u64, len: u64, allocated: u64 },
}

impl StorageError {
    /// Whether the failure says nothing about the server's willingness to
    /// store data, only about reaching it.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_) | StorageError::Timeout(_))
    }
}
