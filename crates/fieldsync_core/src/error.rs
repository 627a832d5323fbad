//! Error types for the cache layer and outbox.

use crate::types::{OperationId, OperationStatus};
use fieldsync_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in cache and outbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No queued operation has this id.
    #[error("queued operation not found: {id}")]
    NotFound {
        /// The missing id.
        id: OperationId,
    },

    /// A status change is not allowed from the operation's current status.
    #[error("cannot {action} operation {id} while {from:?}")]
    InvalidTransition {
        /// The operation.
        id: OperationId,
        /// Its current status.
        from: OperationStatus,
        /// The attempted action.
        action: &'static str,
    },

    /// Only pending operations can be cancelled.
    #[error("operation {id} cannot be cancelled while {status:?}")]
    NotCancellable {
        /// The operation.
        id: OperationId,
        /// Its current status.
        status: OperationStatus,
    },

    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
