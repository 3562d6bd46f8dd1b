//! Storage layer error types
//!
//! All errors that can occur while decoding, locking or hydrating records
//! are defined here. We use `thiserror` for ergonomic error definition.

use thiserror::Error;

use crate::storage::types::{InvalidNameError, Timestamp};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// a byte sequence did not decode as a cell, revision or value
    #[error("corrupted data: {reason}")]
    CorruptData { reason: String },

    /// a lock was released without being held, or upgraded from read to write
    #[error("lock misuse: {reason}")]
    LockMisuse { reason: String },

    /// a revision was appended with a timestamp older than the log's tail
    #[error("out of order revision on {field}: last={last}, attempted={attempted}")]
    OutOfOrderRevision {
        field: String,
        last: Timestamp,
        attempted: Timestamp,
    },

    /// a value whose encoding would overflow its length prefix
    #[error("value too large: {size} payload bytes, limit is {max}")]
    ValueTooLarge { size: usize, max: usize },

    /// invalid field name
    #[error("invalid field name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// I/O error raised by a persistence source
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// the process-wide registry was configured twice
    #[error("global registry is already initialized")]
    AlreadyInitialized,
}

impl StorageError {
    /// shorthand for building a [`StorageError::CorruptData`]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        StorageError::CorruptData {
            reason: reason.into(),
        }
    }

    /// shorthand for building a [`StorageError::LockMisuse`]
    pub fn lock_misuse(reason: impl Into<String>) -> Self {
        StorageError::LockMisuse {
            reason: reason.into(),
        }
    }

    /// check if this error came from undecodable bytes
    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::CorruptData { .. })
    }

    /// check if this error is a programming defect around lock handling
    pub fn is_lock_misuse(&self) -> bool {
        matches!(self, StorageError::LockMisuse { .. })
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
