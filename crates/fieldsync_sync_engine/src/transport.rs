//! Transport layer abstraction for sync operations.

use crate::error::FailureKind;
use fieldsync_core::{QueuedOperation, RefreshScope};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// A failed transport call.
///
/// `retryable` decides what the orchestrator does with the operation:
/// retryable failures are retried with backoff, anything else abandons the
/// operation as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Whether the same request may succeed later.
    pub retryable: bool,
    /// HTTP status, when the server answered.
    pub status: Option<u16>,
    /// Human-readable description.
    pub message: String,
    /// The body could not be encoded or decoded.
    pub malformed: bool,
}

impl TransportError {
    /// The server could not be reached.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            status: None,
            message: message.into(),
            malformed: false,
        }
    }

    /// The request did not finish within `after`.
    pub fn timeout(after: Duration) -> Self {
        Self {
            retryable: true,
            status: Some(408),
            message: format!("timed out after {}ms", after.as_millis()),
            malformed: false,
        }
    }

    /// The server answered with a non-success `status`.
    ///
    /// 408, 429 and 5xx are retryable; other statuses are permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            retryable: is_retryable_status(status),
            status: Some(status),
            message: message.into(),
            malformed: false,
        }
    }

    /// The request could not be built from the operation.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            status: None,
            message: message.into(),
            malformed: false,
        }
    }

    /// A payload or response body that is not valid JSON of the expected shape.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            status: None,
            message: message.into(),
            malformed: true,
        }
    }

    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Classifies the failure.
    pub fn kind(&self) -> FailureKind {
        if self.malformed {
            return FailureKind::Serialization;
        }
        match (self.retryable, self.status) {
            (true, None) => FailureKind::NetworkUnavailable,
            (true, Some(408)) => FailureKind::Timeout,
            (true, Some(_)) => FailureKind::TransientServer,
            (false, _) => FailureKind::Validation,
        }
    }
}

/// Whether an HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// What the server said about an accepted operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerResponse {
    /// HTTP status (2xx).
    pub status: u16,
    /// Server-issued key, when it differs from the client's local key.
    pub canonical_key: Option<String>,
    /// The server's view of the entity after the write.
    pub payload: Option<Value>,
}

impl ServerResponse {
    /// A plain `200 OK` with no body.
    pub fn ok() -> Self {
        Self {
            status: 200,
            canonical_key: None,
            payload: None,
        }
    }

    /// Sets the server-issued key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.canonical_key = Some(key.into());
        self
    }

    /// Sets the server's entity representation.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A request for fresh server data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Entity kind.
    pub entity_kind: String,
    /// Which entities.
    pub scope: RefreshScope,
}

/// One entity returned by a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEntity {
    /// Entity key.
    pub key: String,
    /// Server representation.
    pub payload: Value,
}

impl FetchedEntity {
    /// Creates a fetched entity.
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// A sync transport handles network communication with the backend.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (REST over HTTP, a mock for testing, etc.). Validating
/// payload shape is the transport's job; the engine treats payloads as
/// opaque.
pub trait SyncTransport: Send + Sync + 'static {
    /// Delivers one queued operation.
    ///
    /// Implementations should send `op.id` as an idempotency key so a
    /// retried delivery is applied once.
    fn submit(
        &self,
        op: &QueuedOperation,
    ) -> impl Future<Output = TransportResult<ServerResponse>> + Send;

    /// Fetches the current server state of a group of entities.
    ///
    /// For a single-key scope, an empty result means the entity no longer
    /// exists.
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = TransportResult<Vec<FetchedEntity>>> + Send;
}
