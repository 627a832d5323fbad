//! Sync events and their fan-out to UI subscribers.

use crate::error::FailureKind;
use crate::listeners::{Listeners, Subscription};
use fieldsync_core::OperationId;
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// Why a sync pass started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTrigger {
    /// The engine was initialized with work pending.
    Startup,
    /// Connectivity came back.
    Reconnect,
    /// The user or app asked for it.
    Manual,
    /// The periodic timer fired.
    Periodic,
    /// A write was queued while online.
    Enqueue,
    /// A read found stale data.
    Refresh,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::Startup => "startup",
            SyncTrigger::Reconnect => "reconnect",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Enqueue => "enqueue",
            SyncTrigger::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// A queued operation abandoned during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationFailure {
    /// The operation.
    pub id: OperationId,
    /// Its entity kind.
    pub entity_kind: String,
    /// Why it failed.
    pub kind: FailureKind,
    /// Server or transport message.
    pub message: String,
    /// Retryable attempts made before giving up.
    pub retry_count: u32,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    /// What started the pass.
    pub trigger: SyncTrigger,
    /// Operations accepted by the server.
    pub synced: usize,
    /// Operations abandoned.
    pub failed: usize,
    /// Details of each abandoned operation.
    pub failures: Vec<OperationFailure>,
    /// Cache scopes refreshed.
    pub refreshed: usize,
    /// Retryable failures that were retried.
    pub retries: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl SyncSummary {
    pub(crate) fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            synced: 0,
            failed: 0,
            failures: Vec::new(),
            refreshed: 0,
            retries: 0,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn record_failure(&mut self, failure: OperationFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }
}

/// Something the UI may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Debounced connectivity changed.
    NetworkChange {
        /// New state.
        is_online: bool,
    },
    /// A pass started.
    SyncStart {
        /// Why.
        trigger: SyncTrigger,
    },
    /// A pass finished. Individual failures are inside the summary.
    SyncComplete(SyncSummary),
    /// A pass could not run to completion, or local storage failed.
    SyncError {
        /// Classification.
        kind: FailureKind,
        /// Description.
        message: String,
    },
}

/// Delivers [`SyncEvent`]s to any number of subscribers.
///
/// Cloning yields another handle to the same subscriber list.
#[derive(Debug, Clone)]
pub struct EventBridge {
    listeners: Listeners<SyncEvent>,
}

impl EventBridge {
    /// Creates a bridge with no subscribers.
    pub fn new() -> Self {
        Self {
            listeners: Listeners::new("sync_events"),
        }
    }

    /// Registers a handler until the returned subscription is dropped.
    pub fn subscribe(&self, handler: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(handler)
    }

    /// Delivers `event` to every subscriber, in subscription order.
    pub fn publish(&self, event: SyncEvent) {
        let delivered = self.listeners.emit(&event);
        trace!(?event, delivered, "sync event published");
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drops every subscriber.
    pub fn clear(&self) {
        self.listeners.clear();
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}
