//! # FieldSync Sync Engine
//!
//! Background sync for FieldSync.
//!
//! This crate provides:
//! - The sync loop that drains the outbox in FIFO order ([`SyncOrchestrator`])
//! - Retry with exponential backoff and per-request timeouts
//! - Debounced connectivity monitoring ([`NetworkMonitor`])
//! - Typed sync events with unsubscribe handles ([`EventBridge`])
//! - A transport abstraction with a REST implementation and a mock
//! - [`SyncContext`], the object screens talk to
//!
//! ## Architecture
//!
//! Screens read from the cache and write to the outbox; neither ever waits
//! on the network. The orchestrator runs passes in the background:
//! 1. Drain the outbox one operation at a time, oldest first
//! 2. Retry transient failures in place, abandon permanent ones
//! 3. Refresh stale cache scopes whose kind has nothing left to send
//!
//! ## Key Invariants
//!
//! - At most one pass runs at a time; triggers arriving mid-pass coalesce
//!   into one follow-up pass
//! - Operations for the same entity reach the server in creation order
//! - Every submit is bounded by a timeout, so a pass always ends
//! - Operation ids are sent as idempotency keys; a retried delivery is
//!   applied once by the server
//! - The server is authoritative: its response overwrites the cached entity

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod events;
mod http;
mod listeners;
mod mock;
mod network;
mod orchestrator;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use context::{SyncContext, SyncContextBuilder, WriteOutcome};
pub use error::{FailureKind, SyncError, SyncResult};
pub use events::{EventBridge, OperationFailure, SyncEvent, SyncSummary, SyncTrigger};
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpTransport, LoopbackClient,
    LoopbackServer,
};
pub use listeners::{Listeners, Subscription};
pub use mock::{MockTransport, SubmitRecord};
pub use network::NetworkMonitor;
pub use orchestrator::{SyncOrchestrator, SyncPhase, SyncState, SyncStats};
pub use transport::{
    is_retryable_status, FetchRequest, FetchedEntity, ServerResponse, SyncTransport,
    TransportError, TransportResult,
};
