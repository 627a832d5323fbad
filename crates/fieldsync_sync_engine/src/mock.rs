//! A scriptable in-memory transport.

use crate::transport::{
    FetchRequest, FetchedEntity, ServerResponse, SyncTransport, TransportError, TransportResult,
};
use fieldsync_core::{Method, OperationId, QueuedOperation, RefreshScope};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// One recorded `submit` call.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    /// Operation id.
    pub id: OperationId,
    /// Entity kind.
    pub entity_kind: String,
    /// Method.
    pub method: Method,
    /// Local key at submit time.
    pub local_key: Option<String>,
    /// Submitted body.
    pub payload: Value,
    /// Failed attempts before this one.
    pub retry_count: u32,
    /// When the call started.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<TransportResult<ServerResponse>>,
    fetch_results: HashMap<String, TransportResult<Vec<FetchedEntity>>>,
    submits: Vec<SubmitRecord>,
    fetches: Vec<FetchRequest>,
    latency: Duration,
}

/// A mock transport for testing.
///
/// Submit replies are consumed in order from a script; once it is empty,
/// every submit succeeds with `200 OK`. Fetch results are configured per
/// entity kind. Every call is recorded.
///
/// # Example
///
/// ```rust
/// use fieldsync_sync_engine::{MockTransport, ServerResponse, TransportError};
///
/// let transport = MockTransport::new();
/// transport.push_reply(Err(TransportError::from_status(500, "boom")));
/// transport.push_reply(Ok(ServerResponse::ok().with_key("srv-1")));
/// assert_eq!(transport.submit_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reply to the submit script.
    pub fn push_reply(&self, reply: TransportResult<ServerResponse>) {
        self.state.lock().replies.push_back(reply);
    }

    /// Scripts `times` failures with `status`.
    pub fn fail_times(&self, times: usize, status: u16) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state
                .replies
                .push_back(Err(TransportError::from_status(status, format!("HTTP {status}"))));
        }
    }

    /// Sets what `fetch` returns for `entity_kind`.
    pub fn set_fetch(&self, entity_kind: &str, entities: Vec<FetchedEntity>) {
        self.state
            .lock()
            .fetch_results
            .insert(entity_kind.to_string(), Ok(entities));
    }

    /// Makes `fetch` fail for `entity_kind`.
    pub fn set_fetch_error(&self, entity_kind: &str, error: TransportError) {
        self.state
            .lock()
            .fetch_results
            .insert(entity_kind.to_string(), Err(error));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Every submit call so far.
    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().submits.clone()
    }

    /// Number of submit calls so far.
    pub fn submit_count(&self) -> usize {
        self.state.lock().submits.len()
    }

    /// Number of submit calls for one operation.
    pub fn submit_count_for(&self, id: &OperationId) -> usize {
        self.state
            .lock()
            .submits
            .iter()
            .filter(|s| &s.id == id)
            .count()
    }

    /// Every fetch call so far.
    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.state.lock().fetches.clone()
    }
}

impl SyncTransport for MockTransport {
    async fn submit(&self, op: &QueuedOperation) -> TransportResult<ServerResponse> {
        let (latency, reply) = {
            let mut state = self.state.lock();
            state.submits.push(SubmitRecord {
                id: op.id.clone(),
                entity_kind: op.entity_kind.clone(),
                method: op.method,
                local_key: op.local_key.clone(),
                payload: op.payload.clone(),
                retry_count: op.retry_count,
                at: Instant::now(),
            });
            (state.latency, state.replies.pop_front())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        reply.unwrap_or_else(|| Ok(ServerResponse::ok()))
    }

    async fn fetch(&self, request: &FetchRequest) -> TransportResult<Vec<FetchedEntity>> {
        let (latency, result) = {
            let mut state = self.state.lock();
            state.fetches.push(request.clone());
            let result = state
                .fetch_results
                .get(&request.entity_kind)
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()));
            (state.latency, result)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let entities = result?;
        Ok(entities
            .into_iter()
            .filter(|e| match &request.scope {
                RefreshScope::Key(k) => &e.key == k,
                RefreshScope::Prefix(p) => e.key.starts_with(p.as_str()),
                RefreshScope::All => true,
            })
            .collect())
    }
}
