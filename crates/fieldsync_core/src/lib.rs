//! # FieldSync Core
//!
//! Local state of the FieldSync offline engine.
//!
//! This crate provides:
//! - [`CacheLayer`]: cached server entities with per-kind TTL freshness
//! - [`MutationOutbox`]: a durable FIFO queue of writes waiting for the server
//! - The data model shared by both ([`CacheEntry`], [`QueuedOperation`])
//! - A [`Clock`] abstraction so staleness can be tested deterministically
//!
//! Both components sit on a shared [`PersistentStore`](fieldsync_storage::PersistentStore)
//! and never touch the network. Being offline is their normal steady state,
//! not an error.
//!
//! ## Key Invariants
//!
//! - `(entity_kind, key)` is unique in the cache; `id` is unique in the outbox
//! - A cache entry is stale iff `now - fetched_at > ttl`
//! - Queued operations survive restarts until synced or abandoned
//! - A put replaces a whole cache entry; readers never see a partial entry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod clock;
mod codec;
mod config;
mod error;
mod outbox;
mod types;

pub use cache::{CacheEntity, CacheLayer, Cached, RefreshScope, RefreshTarget, ScopeFilter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CachePolicy, OutboxConfig};
pub use error::{CoreError, CoreResult};
pub use outbox::MutationOutbox;
pub use types::{CacheEntry, Method, OperationId, OperationStatus, QueuedOperation, Timestamp};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
