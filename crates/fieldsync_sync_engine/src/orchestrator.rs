//! The sync loop.
//!
//! One [`SyncOrchestrator`] drains the outbox against a [`SyncTransport`]
//! and refreshes flagged cache scopes afterwards. At most one pass runs at a
//! time: a trigger that arrives mid-pass is coalesced into a single follow-up
//! pass that starts as soon as the current one finishes.
//!
//! ```text
//!   Idle ──trigger──▶ Syncing ──drained──▶ Idle
//!                        │
//!                        └──network lost──▶ Error ──▶ Idle
//! ```

use crate::config::SyncConfig;
use crate::error::{FailureKind, SyncError, SyncResult};
use crate::events::{EventBridge, OperationFailure, SyncEvent, SyncSummary, SyncTrigger};
use crate::listeners::Subscription;
use crate::network::NetworkMonitor;
use crate::transport::{FetchRequest, SyncTransport, TransportError};
use fieldsync_core::{
    CacheLayer, Method, MutationOutbox, OperationStatus, QueuedOperation, RefreshScope, Timestamp,
};
use fieldsync_storage::{PersistentStore, StoreHealth};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Phase of the orchestrator as a whole, not of any one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    /// No pass is running.
    Idle,
    /// A pass is draining the outbox or refreshing the cache.
    Syncing,
    /// A pass was cut short. Transient; the orchestrator returns to `Idle`.
    Error,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncPhase::Idle => f.write_str("idle"),
            SyncPhase::Syncing => f.write_str("syncing"),
            SyncPhase::Error => f.write_str("error"),
        }
    }
}

/// Cumulative counters since the orchestrator was created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Passes that ran to completion.
    pub passes_completed: u64,
    /// Operations accepted by the server.
    pub operations_synced: u64,
    /// Operations abandoned as failed.
    pub operations_failed: u64,
    /// Retryable failures that were retried.
    pub retries: u64,
    /// Cache scopes refreshed.
    pub refreshes: u64,
    /// When the last pass completed.
    pub last_sync_at: Option<Timestamp>,
    /// Message of the last pass-level error.
    pub last_error: Option<String>,
}

/// Point-in-time view of the engine for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Debounced connectivity.
    pub is_online: bool,
    /// Current phase.
    pub phase: SyncPhase,
    /// Whether a pass is running or scheduled.
    pub syncing: bool,
    /// When the last pass completed.
    pub last_sync_at: Option<Timestamp>,
    /// Operations waiting for delivery.
    pub pending_count: usize,
    /// Operations abandoned and awaiting a user decision.
    pub failed_count: usize,
    /// Set when local storage is no longer durable.
    pub storage_warning: Option<String>,
}

struct Inner<T> {
    transport: Arc<T>,
    store: Arc<PersistentStore>,
    cache: Arc<CacheLayer>,
    outbox: Arc<MutationOutbox>,
    monitor: NetworkMonitor,
    events: EventBridge,
    config: SyncConfig,

    busy: AtomicBool,
    rerun: Mutex<Option<SyncTrigger>>,
    destroyed: AtomicBool,
    storage_warned: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    activity: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,

    runtime: Mutex<Option<Handle>>,
    network_sub: Mutex<Option<Subscription>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<SyncStats>,
}

/// Drives outbox delivery and cache refresh.
///
/// Cheap to clone; clones drive the same loop.
pub struct SyncOrchestrator<T: SyncTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SyncTransport> Clone for SyncOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SyncTransport> SyncOrchestrator<T> {
    /// Wires an orchestrator over shared components.
    ///
    /// Nothing runs in the background until [`initialize`](Self::initialize).
    pub fn new(
        transport: Arc<T>,
        store: Arc<PersistentStore>,
        cache: Arc<CacheLayer>,
        outbox: Arc<MutationOutbox>,
        monitor: NetworkMonitor,
        events: EventBridge,
        config: SyncConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (activity, _) = watch::channel(0u64);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                cache,
                outbox,
                monitor,
                events,
                config,
                busy: AtomicBool::new(false),
                rerun: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                storage_warned: AtomicBool::new(false),
                phase,
                activity,
                shutdown,
                runtime: Mutex::new(None),
                network_sub: Mutex::new(None),
                timer: Mutex::new(None),
                stats: Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Starts background activity on the current tokio runtime.
    ///
    /// Subscribes to connectivity changes, starts the periodic timer when
    /// one is configured, and runs a startup pass if the device is online.
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` outside a tokio runtime and `Destroyed` after
    /// [`destroy`](Self::destroy).
    pub fn initialize(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(SyncError::Destroyed);
        }
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        {
            let mut slot = inner.runtime.lock();
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(runtime.clone());
        }

        let weak = Arc::downgrade(inner);
        let subscription = inner.monitor.subscribe(move |online| {
            if let Some(inner) = weak.upgrade() {
                inner.on_network_change(online);
            }
        });
        *inner.network_sub.lock() = Some(subscription);

        if let Some(every) = inner.config.sync_interval {
            let weak = Arc::downgrade(inner);
            *inner.timer.lock() = Some(runtime.spawn(periodic(weak, every)));
        }

        let online = inner.monitor.is_online();
        info!(
            online,
            pending = inner.outbox.pending_count(),
            failed = inner.outbox.failed_count(),
            "sync orchestrator initialized"
        );
        if online {
            inner.request(SyncTrigger::Startup);
        }
        Ok(())
    }

    /// Stops all background activity.
    ///
    /// Unsubscribes from the network monitor, cancels the periodic timer,
    /// pending debounce and any backoff wait, and drops every event
    /// subscriber. Idempotent, and safe to call before `initialize`.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.shutdown.send_replace(true);
        if let Some(mut subscription) = inner.network_sub.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(timer) = inner.timer.lock().take() {
            timer.abort();
        }
        inner.monitor.cancel_pending();
        inner.events.clear();
        inner.rerun.lock().take();
        info!("sync orchestrator destroyed");
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Requests a pass in the background.
    ///
    /// Ignored while offline or before `initialize`. Coalesced if a pass
    /// is already running.
    pub fn request(&self, trigger: SyncTrigger) {
        self.inner.request(trigger);
    }

    /// Runs a pass on the calling task and returns its summary.
    ///
    /// # Errors
    ///
    /// `AlreadySyncing` if a pass is running, `NetworkUnavailable` when
    /// offline or if connectivity drops mid-pass, `Destroyed` after
    /// `destroy`.
    pub async fn sync_now(&self) -> SyncResult<SyncSummary> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return Err(SyncError::Destroyed);
        }
        if !inner.monitor.is_online() {
            return Err(SyncError::NetworkUnavailable);
        }
        if inner.busy.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadySyncing);
        }
        inner.rerun.lock().take();
        let result = inner.run_pass(SyncTrigger::Manual).await;
        if inner.finish_pass() {
            inner.spawn_loop();
        }
        result
    }

    /// Resolves once no pass is running or scheduled.
    pub async fn wait_idle(&self) {
        let mut activity = self.inner.activity.subscribe();
        while self.inner.busy.load(Ordering::SeqCst) {
            if activity.changed().await.is_err() {
                return;
            }
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    /// Watches phase transitions.
    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    /// Whether a pass is running or scheduled.
    pub fn is_syncing(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Cumulative counters.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.lock().clone()
    }

    /// Status snapshot.
    pub fn state(&self) -> SyncState {
        let inner = &self.inner;
        SyncState {
            is_online: inner.monitor.is_online(),
            phase: *inner.phase.borrow(),
            syncing: inner.busy.load(Ordering::SeqCst),
            last_sync_at: inner.stats.lock().last_sync_at,
            pending_count: inner.outbox.pending_count(),
            failed_count: inner.outbox.failed_count(),
            storage_warning: match inner.store.health() {
                StoreHealth::Healthy => None,
                StoreHealth::Degraded { reason } => Some(reason),
            },
        }
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// The active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl<T: SyncTransport> fmt::Debug for SyncOrchestrator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("phase", &*self.inner.phase.borrow())
            .field("busy", &self.inner.busy.load(Ordering::SeqCst))
            .field("destroyed", &self.inner.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn periodic<T: SyncTransport>(weak: Weak<Inner<T>>, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.outbox.pending_count() > 0 || inner.cache.pending_refreshes() > 0 {
            inner.request(SyncTrigger::Periodic);
        }
    }
}

enum Step {
    Delivered,
    Retry(std::time::Duration),
    Abandoned,
    Skipped,
}

impl<T: SyncTransport> Inner<T> {
    fn on_network_change(self: &Arc<Self>, online: bool) {
        self.events.publish(SyncEvent::NetworkChange { is_online: online });
        if online {
            self.request(SyncTrigger::Reconnect);
        }
    }

    fn request(self: &Arc<Self>, trigger: SyncTrigger) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if !self.monitor.is_online() {
            debug!(%trigger, "sync request ignored while offline");
            return;
        }
        if self.runtime.lock().is_none() {
            debug!(%trigger, "sync request ignored before initialize");
            return;
        }
        self.rerun.lock().get_or_insert(trigger);
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!(%trigger, "sync pass already running, request coalesced");
            return;
        }
        self.spawn_loop();
    }

    fn spawn_loop(self: &Arc<Self>) {
        let runtime = self.runtime.lock().clone().or_else(|| Handle::try_current().ok());
        let Some(runtime) = runtime else {
            warn!("no runtime to run a sync pass on");
            self.busy.store(false, Ordering::SeqCst);
            self.activity.send_modify(|n| *n += 1);
            return;
        };
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            loop {
                let trigger = inner.rerun.lock().take().unwrap_or(SyncTrigger::Manual);
                // Errors are published as events by the pass itself.
                let _ = inner.run_pass(trigger).await;
                if !inner.finish_pass() {
                    break;
                }
            }
        });
    }

    /// Releases the busy flag. Returns true if the caller re-acquired it to
    /// run a coalesced follow-up pass.
    fn finish_pass(&self) -> bool {
        self.busy.store(false, Ordering::SeqCst);
        self.activity.send_modify(|n| *n += 1);
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        if !self.monitor.is_online() {
            self.rerun.lock().take();
            return false;
        }
        self.rerun.lock().is_some() && !self.busy.swap(true, Ordering::SeqCst)
    }

    async fn run_pass(&self, trigger: SyncTrigger) -> SyncResult<SyncSummary> {
        let started = Instant::now();
        self.phase.send_replace(SyncPhase::Syncing);
        self.events.publish(SyncEvent::SyncStart { trigger });
        info!(%trigger, pending = self.outbox.pending_count(), "sync pass started");
        self.check_storage();

        let mut summary = SyncSummary::new(trigger);
        let mut outcome = self.drain(&mut summary).await;
        if outcome.is_ok() && (self.config.refresh_after_drain || trigger == SyncTrigger::Refresh) {
            outcome = self.refresh(&mut summary).await;
        }
        summary.duration = started.elapsed();
        self.check_storage();

        {
            let mut stats = self.stats.lock();
            stats.operations_synced += summary.synced as u64;
            stats.operations_failed += summary.failed as u64;
            stats.retries += summary.retries as u64;
            stats.refreshes += summary.refreshed as u64;
            match &outcome {
                Ok(()) => {
                    stats.passes_completed += 1;
                    stats.last_sync_at = Some(self.cache.now());
                }
                Err(e) => stats.last_error = Some(e.to_string()),
            }
        }

        match outcome {
            Ok(()) => {
                self.phase.send_replace(SyncPhase::Idle);
                info!(
                    %trigger,
                    synced = summary.synced,
                    failed = summary.failed,
                    refreshed = summary.refreshed,
                    duration_ms = summary.duration.as_millis() as u64,
                    "sync pass complete"
                );
                self.events.publish(SyncEvent::SyncComplete(summary.clone()));
                Ok(summary)
            }
            Err(SyncError::Destroyed) => {
                self.phase.send_replace(SyncPhase::Idle);
                debug!(%trigger, "sync pass stopped by shutdown");
                Err(SyncError::Destroyed)
            }
            Err(e) => {
                self.phase.send_replace(SyncPhase::Error);
                warn!(%trigger, synced = summary.synced, error = %e, "sync pass interrupted");
                self.events.publish(SyncEvent::SyncError {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                self.phase.send_replace(SyncPhase::Idle);
                Err(e)
            }
        }
    }

    async fn drain(&self, summary: &mut SyncSummary) -> SyncResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return Err(SyncError::Destroyed);
            }
            if !self.monitor.is_online() {
                return Err(SyncError::NetworkUnavailable);
            }
            let Some(head) = self.outbox.next_ready() else {
                return Ok(());
            };

            match self.deliver(head, summary).await {
                Step::Delivered | Step::Abandoned | Step::Skipped => {}
                Step::Retry(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return Err(SyncError::Destroyed),
                    }
                }
            }
        }
    }

    async fn deliver(&self, head: QueuedOperation, summary: &mut SyncSummary) -> Step {
        let op = match self.outbox.mark_submitting(&head.id) {
            Ok(op) => op,
            Err(e) => {
                debug!(op_id = %head.id, error = %e, "operation changed before submit");
                return Step::Skipped;
            }
        };

        let attempt = op.retry_count + 1;
        debug!(op_id = %op.id, entity_kind = %op.entity_kind, method = %op.method, attempt, "submitting operation");
        let timeout = self.config.submit_timeout;
        let result = match tokio::time::timeout(timeout, self.transport.submit(&op)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(timeout)),
        };

        match result {
            Ok(response) => {
                self.apply_success(&op, response);
                summary.synced += 1;
                Step::Delivered
            }
            Err(e) => {
                let failed = match self.outbox.mark_failed(&op.id, &e.message, e.is_retryable()) {
                    Ok(failed) => failed,
                    Err(err) => {
                        error!(op_id = %op.id, error = %err, "failed to record submit failure");
                        return Step::Skipped;
                    }
                };
                if failed.status == OperationStatus::Pending {
                    let delay = self.config.retry.delay_for_attempt(failed.retry_count);
                    summary.retries += 1;
                    debug!(
                        op_id = %op.id,
                        attempt,
                        status = ?e.status,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retry scheduled"
                    );
                    return Step::Retry(delay);
                }
                summary.record_failure(OperationFailure {
                    id: failed.id.clone(),
                    entity_kind: failed.entity_kind.clone(),
                    kind: e.kind(),
                    message: e.message,
                    retry_count: failed.retry_count,
                });
                Step::Abandoned
            }
        }
    }

    fn apply_success(&self, op: &QueuedOperation, response: crate::transport::ServerResponse) {
        let kind = op.entity_kind.as_str();
        if let Err(e) = self.outbox.mark_synced(&op.id) {
            warn!(op_id = %op.id, error = %e, "synced operation could not be evicted");
            return;
        }

        let key = match (op.local_key.as_deref(), response.canonical_key.as_deref()) {
            (Some(local), Some(canonical)) if local != canonical => {
                self.cache.rekey(kind, local, canonical);
                let rewritten = self.outbox.rewrite_local_key(kind, local, canonical);
                info!(entity_kind = kind, local, canonical, rewritten, "temporary key replaced");
                Some(canonical.to_string())
            }
            (Some(local), _) => Some(local.to_string()),
            (None, canonical) => canonical.map(str::to_string),
        };
        let Some(key) = key else {
            return;
        };
        if self.outbox.has_pending_for(kind, &key) {
            return;
        }
        match op.method {
            Method::Delete => {
                self.cache.invalidate(kind, &key);
            }
            Method::Create | Method::Update => {
                let payload = response.payload.unwrap_or_else(|| op.payload.clone());
                self.cache.put_with_policy(kind, &key, payload);
            }
        }
    }

    async fn refresh(&self, summary: &mut SyncSummary) -> SyncResult<()> {
        let targets = self.cache.take_refresh_targets();
        if targets.is_empty() {
            return Ok(());
        }
        let mut shutdown = self.shutdown.subscribe();
        let mut remaining = targets.into_iter();

        while let Some(target) = remaining.next() {
            if *shutdown.borrow_and_update() {
                return Err(SyncError::Destroyed);
            }
            if !self.monitor.is_online() {
                self.cache.flag_refresh(target);
                remaining.for_each(|t| self.cache.flag_refresh(t));
                return Err(SyncError::NetworkUnavailable);
            }
            if self.outbox.pending_count_for(&target.entity_kind) > 0 {
                debug!(entity_kind = %target.entity_kind, "refresh deferred until outbox drains");
                self.cache.flag_refresh(target);
                continue;
            }

            let request = FetchRequest {
                entity_kind: target.entity_kind.clone(),
                scope: target.scope.clone(),
            };
            let timeout = self.config.fetch_timeout;
            let result = match tokio::time::timeout(timeout, self.transport.fetch(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout(timeout)),
            };

            let entities = match result {
                Ok(entities) => entities,
                Err(e) if e.status == Some(404) && matches!(target.scope, RefreshScope::Key(_)) => {
                    Vec::new()
                }
                Err(e) => {
                    warn!(entity_kind = %target.entity_kind, scope = ?target.scope, error = %e, "cache refresh failed");
                    self.cache.flag_refresh(target);
                    continue;
                }
            };
            // A write queued while the fetch was in flight must not be overwritten.
            if self.outbox.pending_count_for(&target.entity_kind) > 0 {
                debug!(entity_kind = %target.entity_kind, "refresh deferred, writes queued during fetch");
                self.cache.flag_refresh(target);
                continue;
            }
            let written = self.cache.replace_scope(
                &target.entity_kind,
                &target.scope,
                entities.into_iter().map(|e| (e.key, e.payload)).collect(),
            );
            debug!(entity_kind = %target.entity_kind, scope = ?target.scope, written, "cache refreshed");
            summary.refreshed += 1;
        }
        Ok(())
    }

    fn check_storage(&self) {
        if let StoreHealth::Degraded { reason } = self.store.health() {
            if !self.storage_warned.swap(true, Ordering::SeqCst) {
                error!(%reason, "local storage degraded, changes are no longer durable");
                self.events.publish(SyncEvent::SyncError {
                    kind: FailureKind::Storage,
                    message: reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::transport::ServerResponse;
    use fieldsync_core::{CachePolicy, ManualClock, OutboxConfig, RefreshTarget};
    use serde_json::json;
    use std::time::Duration;

    struct Rig {
        transport: Arc<MockTransport>,
        cache: Arc<CacheLayer>,
        outbox: Arc<MutationOutbox>,
        monitor: NetworkMonitor,
        events: EventBridge,
        orchestrator: SyncOrchestrator<MockTransport>,
    }

    fn rig(online: bool, config: SyncConfig) -> Rig {
        let store = Arc::new(PersistentStore::in_memory());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = Arc::new(CacheLayer::new(store.clone(), clock.clone(), CachePolicy::default()));
        let outbox = Arc::new(MutationOutbox::open(
            store.clone(),
            clock,
            OutboxConfig::default().with_max_attempts(config.retry.max_attempts),
        ));
        let transport = Arc::new(MockTransport::new());
        let monitor = NetworkMonitor::new(online, Duration::ZERO);
        let events = EventBridge::new();
        let orchestrator = SyncOrchestrator::new(
            transport.clone(),
            store,
            cache.clone(),
            outbox.clone(),
            monitor.clone(),
            events.clone(),
            config,
        );
        Rig {
            transport,
            cache,
            outbox,
            monitor,
            events,
            orchestrator,
        }
    }

    fn quiet() -> SyncConfig {
        SyncConfig::default().with_retry(crate::config::RetryConfig::default().with_jitter(false))
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_drains_in_fifo_order() {
        let rig = rig(true, quiet());
        let a = rig.outbox.enqueue("forms", Method::Create, json!({"n": 1})).unwrap();
        let b = rig.outbox.enqueue("forms", Method::Create, json!({"n": 2})).unwrap();

        let summary = rig.orchestrator.sync_now().await.unwrap();
        assert_eq!(summary.synced, 2);
        assert_eq!(summary.failed, 0);
        let order: Vec<_> = rig.transport.submits().into_iter().map(|s| s.id).collect();
        assert_eq!(order, vec![a, b]);
        assert!(rig.outbox.is_empty());
        assert_eq!(rig.orchestrator.phase(), SyncPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_offline_is_rejected() {
        let rig = rig(false, quiet());
        rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();
        assert!(matches!(
            rig.orchestrator.sync_now().await,
            Err(SyncError::NetworkUnavailable)
        ));
        assert_eq!(rig.transport.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_does_not_block_queue() {
        let rig = rig(true, quiet());
        rig.transport
            .push_reply(Err(TransportError::from_status(422, "missing field")));
        let bad = rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();
        rig.outbox.enqueue("forms", Method::Create, json!({"ok": true})).unwrap();

        let summary = rig.orchestrator.sync_now().await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].id, bad);
        assert_eq!(summary.failures[0].kind, FailureKind::Validation);

        let failed = rig.outbox.get(&bad).unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert_eq!(rig.transport.submit_count_for(&bad), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_payload_reports_serialization() {
        let rig = rig(true, quiet());
        rig.transport
            .push_reply(Err(TransportError::serialization("payload not encodable")));
        let bad = rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();

        let summary = rig.orchestrator.sync_now().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].id, bad);
        assert_eq!(summary.failures[0].kind, FailureKind::Serialization);
        assert_eq!(rig.transport.submit_count_for(&bad), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn canonical_key_rekeys_cache_and_later_ops() {
        let rig = rig(true, quiet());
        rig.transport.push_reply(Ok(ServerResponse::ok()
            .with_key("QR-900")
            .with_payload(json!({"code": "QR-900"}))));

        rig.cache.put_with_policy("qr_codes", "tmp-1", json!({"code": "tmp-1"}));
        rig.outbox
            .enqueue_for("qr_codes", Method::Create, "tmp-1", json!({"code": "tmp-1"}))
            .unwrap();

        rig.orchestrator.sync_now().await.unwrap();
        assert!(rig.cache.get("qr_codes", "tmp-1").is_none());
        assert_eq!(
            rig.cache.get("qr_codes", "QR-900").unwrap().payload,
            json!({"code": "QR-900"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_into_failure() {
        let config = SyncConfig::default().with_retry(
            crate::config::RetryConfig::new(3)
                .with_jitter(false)
                .with_initial_delay(Duration::from_millis(100)),
        );
        let rig = rig(true, config);
        rig.transport.fail_times(5, 503);
        let id = rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();

        let summary = rig.orchestrator.sync_now().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.failures[0].kind, FailureKind::TransientServer);
        assert_eq!(rig.transport.submit_count_for(&id), 3);
        assert_eq!(rig.outbox.get(&id).unwrap().retry_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_timeout_counts_as_retryable() {
        let config = quiet()
            .with_submit_timeout(Duration::from_secs(1))
            .with_retry(crate::config::RetryConfig::new(2).with_jitter(false));
        let rig = rig(true, config);
        rig.transport.set_latency(Duration::from_secs(10));
        let id = rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();

        let summary = rig.orchestrator.sync_now().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, FailureKind::Timeout);
        assert_eq!(rig.transport.submit_count_for(&id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_ignored_before_initialize() {
        let rig = rig(true, quiet());
        rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();
        rig.orchestrator.request(SyncTrigger::Manual);
        rig.orchestrator.wait_idle().await;
        assert_eq!(rig.transport.submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_triggers_pass_and_events() {
        let rig = rig(false, quiet());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            rig.events.subscribe(move |e| seen.lock().push(e.clone()))
        };
        rig.outbox.enqueue("forms", Method::Create, json!({})).unwrap();
        rig.orchestrator.initialize().unwrap();
        assert_eq!(rig.transport.submit_count(), 0);

        rig.monitor.report(true);
        rig.orchestrator.wait_idle().await;

        assert_eq!(rig.transport.submit_count(), 1);
        let events = seen.lock().clone();
        assert_eq!(events[0], SyncEvent::NetworkChange { is_online: true });
        assert_eq!(
            events[1],
            SyncEvent::SyncStart {
                trigger: SyncTrigger::Reconnect
            }
        );
        assert!(matches!(&events[2], SyncEvent::SyncComplete(s) if s.synced == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_waits_for_outbox_of_same_kind() {
        let rig = rig(true, quiet());
        rig.transport.set_fetch(
            "companies",
            vec![crate::transport::FetchedEntity::new("c1", json!({"name": "Acme"}))],
        );
        rig.cache.flag_refresh(RefreshTarget::kind("companies"));

        let summary = rig.orchestrator.sync_now().await.unwrap();
        assert_eq!(summary.refreshed, 1);
        assert_eq!(rig.cache.get("companies", "c1").unwrap().payload["name"], "Acme");
        assert_eq!(rig.orchestrator.stats().refreshes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent_and_blocks_sync() {
        let rig = rig(true, quiet());
        rig.orchestrator.destroy();
        rig.orchestrator.destroy();
        assert!(rig.orchestrator.is_destroyed());
        assert!(matches!(
            rig.orchestrator.initialize(),
            Err(SyncError::Destroyed)
        ));
        assert!(matches!(
            rig.orchestrator.sync_now().await,
            Err(SyncError::Destroyed)
        ));
    }

    #[test]
    fn initialize_needs_runtime() {
        let rig = rig(true, quiet());
        assert!(matches!(
            rig.orchestrator.initialize(),
            Err(SyncError::NoRuntime)
        ));
    }
}
