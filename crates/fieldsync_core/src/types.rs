//! Shared data model for cached entities and queued writes.

use crate::codec;
use crate::error::CoreResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Returns the timestamp moved forward by `by`.
    #[must_use]
    pub fn saturating_add(self, by: Duration) -> Self {
        Self(self.0.saturating_add(by.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Unique identifier of a queued operation.
///
/// Generated locally, and sent to the server as an idempotency key so a
/// retried submission cannot apply twice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generates a new random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of write a queued operation performs on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Create a new entity.
    Create,
    /// Replace an existing entity.
    Update,
    /// Remove an entity.
    Delete,
}

impl Method {
    /// Lowercase name used in logs and the CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of a queued operation.
///
/// `Synced` operations are evicted from the outbox as soon as they reach
/// that state, so it is only ever observed on the value returned by
/// [`MutationOutbox::mark_synced`](crate::MutationOutbox::mark_synced).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be submitted.
    Pending,
    /// Currently in flight.
    Submitting,
    /// Accepted by the server.
    Synced,
    /// Abandoned after a permanent error or too many attempts.
    Failed,
}

impl OperationStatus {
    /// Lowercase name used in logs and the CLI.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitting => "submitting",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write made while offline (or pending confirmation), waiting for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Unique id, also the server idempotency key.
    pub id: OperationId,
    /// Monotonic enqueue position. Submission order follows it.
    pub sequence: u64,
    /// Entity kind, e.g. `"appointments"`.
    pub entity_kind: String,
    /// What the server should do.
    pub method: Method,
    /// The entity's key as the client knows it, possibly a temporary one.
    #[serde(default)]
    pub local_key: Option<String>,
    /// Request body.
    pub payload: Value,
    /// When the write was made.
    pub created_at: Timestamp,
    /// Lifecycle position.
    pub status: OperationStatus,
    /// Number of failed retryable attempts so far.
    pub retry_count: u32,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Whether the operation is still waiting to reach the server.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Pending | OperationStatus::Submitting
        )
    }

    /// Whether the operation has been abandoned.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == OperationStatus::Failed
    }

    /// Whether this operation targets `kind/key`.
    #[must_use]
    pub fn targets(&self, kind: &str, key: &str) -> bool {
        self.entity_kind == kind && self.local_key.as_deref() == Some(key)
    }
}

/// A cached server entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Entity kind.
    pub entity_kind: String,
    /// Entity key, unique within the kind.
    pub key: String,
    /// Server representation.
    pub payload: Value,
    /// When the payload was obtained from the server (or written locally).
    pub fetched_at: Timestamp,
    /// How long the payload stays fresh.
    pub ttl: Duration,
}

impl CacheEntry {
    /// Whether the entry has outlived its TTL at `now`.
    ///
    /// The boundary is exclusive: an entry exactly `ttl` old is still fresh.
    #[must_use]
    pub fn is_stale_at(&self, now: Timestamp) -> bool {
        now.saturating_since(self.fetched_at) > self.ttl
    }

    /// Age of the entry at `now`.
    #[must_use]
    pub fn age_at(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.fetched_at)
    }

    /// Deserializes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| crate::CoreError::serialization(e.to_string()))
    }
}

/// On-disk form of a cache entry; kind and key live in the bucket and key.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub payload: Value,
    pub fetched_at: Timestamp,
    pub ttl_ms: u64,
}

impl StoredEntry {
    pub(crate) fn encode(&self) -> CoreResult<Vec<u8>> {
        codec::encode(self)
    }

    pub(crate) fn into_entry(self, kind: &str, key: &str) -> CacheEntry {
        CacheEntry {
            entity_kind: kind.to_string(),
            key: key.to_string(),
            payload: self.payload,
            fetched_at: self.fetched_at,
            ttl: Duration::from_millis(self.ttl_ms),
        }
    }
}

impl From<&CacheEntry> for StoredEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            payload: entry.payload.clone(),
            fetched_at: entry.fetched_at,
            ttl_ms: entry.ttl.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(fetched_at: u64, ttl_ms: u64) -> CacheEntry {
        CacheEntry {
            entity_kind: "appointments".into(),
            key: "a1".into(),
            payload: json!({"id": "a1"}),
            fetched_at: Timestamp::from_millis(fetched_at),
            ttl: Duration::from_millis(ttl_ms),
        }
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let e = entry(1_000, 500);
        assert!(!e.is_stale_at(Timestamp::from_millis(1_500)));
        assert!(e.is_stale_at(Timestamp::from_millis(1_501)));
    }

    #[test]
    fn clock_behind_fetch_is_fresh() {
        let e = entry(10_000, 0);
        assert!(!e.is_stale_at(Timestamp::from_millis(5_000)));
        assert_eq!(e.age_at(Timestamp::from_millis(5_000)), Duration::ZERO);
    }

    #[test]
    fn zero_ttl_is_stale_after_any_time() {
        let e = entry(1_000, 0);
        assert!(!e.is_stale_at(Timestamp::from_millis(1_000)));
        assert!(e.is_stale_at(Timestamp::from_millis(1_001)));
    }

    #[test]
    fn decode_typed_payload() {
        #[derive(Deserialize)]
        struct Appointment {
            id: String,
        }
        let a: Appointment = entry(0, 0).decode().unwrap();
        assert_eq!(a.id, "a1");
    }

    #[test]
    fn operation_id_is_unique() {
        assert_ne!(OperationId::generate(), OperationId::generate());
    }

    #[test]
    fn queued_operation_cbor_layout() {
        let op = QueuedOperation {
            id: OperationId::from("op-1"),
            sequence: 7,
            entity_kind: "samples".into(),
            method: Method::Update,
            local_key: Some("s1".into()),
            payload: json!({"weight": 1.25}),
            created_at: Timestamp::from_millis(42),
            status: OperationStatus::Pending,
            retry_count: 2,
            last_error: Some("timeout".into()),
        };
        let bytes = codec::encode(&op).unwrap();
        let back: QueuedOperation = codec::decode(&bytes).unwrap();
        assert_eq!(back, op);
        assert!(back.targets("samples", "s1"));
        assert!(!back.targets("samples", "s2"));
    }
}
