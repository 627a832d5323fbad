//! Error types for the sync engine.

use crate::transport::TransportError;
use fieldsync_core::CoreError;
use fieldsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a failure, for presentation in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The device is offline or the server is unreachable.
    NetworkUnavailable,
    /// The server failed in a way that may succeed later (5xx, 408, 429).
    TransientServer,
    /// The server rejected the request (4xx); retrying will not help.
    Validation,
    /// A payload could not be encoded or decoded.
    Serialization,
    /// Local storage failed.
    Storage,
    /// A request did not finish in time.
    Timeout,
}

impl FailureKind {
    /// Whether failures of this kind are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::NetworkUnavailable | FailureKind::TransientServer | FailureKind::Timeout
        )
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The device is offline.
    #[error("network unavailable")]
    NetworkUnavailable,

    /// The server failed transiently.
    #[error("server error{}: {message}", status_suffix(.status))]
    TransientServer {
        /// HTTP status, if any.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// The server rejected the request.
    #[error("request rejected{}: {message}", status_suffix(.status))]
    Validation {
        /// HTTP status, if any.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// Payload encoding error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cache or outbox error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// A sync pass is already running.
    #[error("sync already in progress")]
    AlreadySyncing,

    /// The engine was destroyed.
    #[error("sync engine destroyed")]
    Destroyed,

    /// No tokio runtime is available to drive background work.
    #[error("no async runtime available")]
    NoRuntime,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl SyncError {
    /// Classifies this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::NetworkUnavailable | SyncError::Destroyed | SyncError::NoRuntime => {
                FailureKind::NetworkUnavailable
            }
            SyncError::TransientServer { .. } | SyncError::AlreadySyncing => {
                FailureKind::TransientServer
            }
            SyncError::Validation { .. } => FailureKind::Validation,
            SyncError::Serialization(_) | SyncError::Core(CoreError::Serialization(_)) => {
                FailureKind::Serialization
            }
            SyncError::Core(CoreError::Storage(_)) => FailureKind::Storage,
            SyncError::Core(_) => FailureKind::Validation,
            SyncError::Timeout => FailureKind::Timeout,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::AlreadySyncing => true,
            SyncError::Destroyed | SyncError::NoRuntime => false,
            other => other.kind().is_retryable(),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Core(CoreError::Storage(err))
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err.kind() {
            FailureKind::NetworkUnavailable => SyncError::NetworkUnavailable,
            FailureKind::Timeout => SyncError::Timeout,
            FailureKind::TransientServer => SyncError::TransientServer {
                status: err.status,
                message: err.message,
            },
            FailureKind::Serialization => SyncError::Serialization(err.message),
            _ => SyncError::Validation {
                status: err.status,
                message: err.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::NetworkUnavailable.is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::TransientServer {
            status: Some(503),
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!SyncError::Validation {
            status: Some(422),
            message: "bad date".into()
        }
        .is_retryable());
        assert!(!SyncError::Destroyed.is_retryable());
    }

    #[test]
    fn transport_errors_map_to_kinds() {
        let err: SyncError = TransportError::from_status(500, "boom").into();
        assert_eq!(err.kind(), FailureKind::TransientServer);

        let err: SyncError = TransportError::from_status(422, "invalid").into();
        assert_eq!(err.kind(), FailureKind::Validation);

        let err: SyncError = TransportError::network("connection refused").into();
        assert!(matches!(err, SyncError::NetworkUnavailable));

        let err: SyncError = TransportError::serialization("not JSON").into();
        assert!(matches!(err, SyncError::Serialization(_)));
        assert_eq!(err.kind(), FailureKind::Serialization);
    }

    #[test]
    fn error_display() {
        let err = SyncError::Validation {
            status: Some(422),
            message: "date in the past".into(),
        };
        assert_eq!(err.to_string(), "request rejected (422): date in the past");

        let err = SyncError::TransientServer {
            status: None,
            message: "reset".into(),
        };
        assert_eq!(err.to_string(), "server error: reset");
    }

    #[test]
    fn storage_errors_classify_as_storage() {
        let err: SyncError = StorageError::Locked.into();
        assert_eq!(err.kind(), FailureKind::Storage);
    }
}
