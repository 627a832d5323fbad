//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred (disk full, permission denied, ...).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the log.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The log is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A record checksum did not match its contents.
    #[error("checksum mismatch at offset {offset}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Offset of the offending record.
        offset: u64,
        /// Checksum stored in the record.
        expected: u32,
        /// Checksum computed over the record.
        actual: u32,
    },

    /// Another process holds the store file.
    #[error("store is locked by another process")]
    Locked,

    /// A bucket or key is too long to be framed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The store has fallen back to memory-only operation; the write was
    /// applied in memory but is not durable.
    #[error("store degraded to memory-only operation: {0}")]
    Degraded(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    pub(crate) fn truncate_would_grow(requested: u64, len: u64) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("truncate to {requested} bytes would grow a {len} byte log"),
        ))
    }
}
