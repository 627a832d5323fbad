//! The application-facing sync context.
//!
//! A [`SyncContext`] is built once at the application root and handed to
//! screens. It owns every engine component and exposes the small surface
//! screens need: cached reads, queued writes, sync events and lifecycle.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBridge, SyncEvent, SyncSummary, SyncTrigger};
use crate::listeners::Subscription;
use crate::network::NetworkMonitor;
use crate::orchestrator::{SyncOrchestrator, SyncState};
use crate::transport::{ServerResponse, SyncTransport, TransportError};
use fieldsync_core::{
    CacheEntry, CacheLayer, CachePolicy, Clock, Method, MutationOutbox, OperationId, OutboxConfig,
    QueuedOperation, RefreshTarget, ScopeFilter, SystemClock,
};
use fieldsync_storage::PersistentStore;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// How a [`SyncContext::write`] was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server accepted the write directly.
    Applied(ServerResponse),
    /// The write was queued for background delivery.
    Queued(OperationId),
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder<T: SyncTransport> {
    transport: T,
    store: Option<Arc<PersistentStore>>,
    path: Option<PathBuf>,
    clock: Option<Arc<dyn Clock>>,
    cache_policy: CachePolicy,
    outbox_config: OutboxConfig,
    sync_config: SyncConfig,
    online: bool,
}

impl<T: SyncTransport> SyncContextBuilder<T> {
    /// Uses an already opened store.
    #[must_use]
    pub fn store(mut self, store: Arc<PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Opens the store at `path`, falling back to memory if it cannot be
    /// opened.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the clock used for cache ages and operation timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets cache TTLs.
    #[must_use]
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets outbox behaviour. The attempt limit is taken from the retry
    /// configuration.
    #[must_use]
    pub fn outbox_config(mut self, config: OutboxConfig) -> Self {
        self.outbox_config = config;
        self
    }

    /// Sets sync behaviour.
    #[must_use]
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    /// Sets the connectivity assumed until the platform reports otherwise.
    #[must_use]
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Wires the components together.
    pub fn build(self) -> SyncContext<T> {
        let store = match (self.store, self.path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(PersistentStore::open_or_memory(&path)),
            (None, None) => Arc::new(PersistentStore::in_memory()),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = Arc::new(CacheLayer::new(store.clone(), clock.clone(), self.cache_policy));
        let outbox = Arc::new(MutationOutbox::open(
            store.clone(),
            clock.clone(),
            self.outbox_config
                .with_max_attempts(self.sync_config.retry.max_attempts),
        ));
        let monitor = NetworkMonitor::new(self.online, self.sync_config.network_debounce);
        let events = EventBridge::new();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(self.transport),
            store.clone(),
            cache.clone(),
            outbox.clone(),
            monitor.clone(),
            events.clone(),
            self.sync_config,
        );

        debug!(
            pending = outbox.pending_count(),
            cached_kinds = cache.kinds().len(),
            "sync context built"
        );
        SyncContext {
            store,
            clock,
            cache,
            outbox,
            monitor,
            events,
            orchestrator,
        }
    }
}

/// Owns the engine for one application.
///
/// Reads never wait on the network and writes never block on it. Dropping
/// the context destroys it.
///
/// # Example
///
/// ```rust
/// use fieldsync_core::Method;
/// use fieldsync_sync_engine::{MockTransport, SyncContext};
/// use serde_json::json;
///
/// let ctx = SyncContext::builder(MockTransport::new()).build();
/// let id = ctx
///     .write_queued("service_form", Method::Create, None, json!({"answer": "A"}))
///     .unwrap();
/// assert_eq!(ctx.state().pending_count, 1);
/// ctx.cancel_queued(&id).unwrap();
/// assert_eq!(ctx.state().pending_count, 0);
/// ```
pub struct SyncContext<T: SyncTransport> {
    store: Arc<PersistentStore>,
    clock: Arc<dyn Clock>,
    cache: Arc<CacheLayer>,
    outbox: Arc<MutationOutbox>,
    monitor: NetworkMonitor,
    events: EventBridge,
    orchestrator: SyncOrchestrator<T>,
}

impl<T: SyncTransport> SyncContext<T> {
    /// Starts building a context around `transport`.
    pub fn builder(transport: T) -> SyncContextBuilder<T> {
        SyncContextBuilder {
            transport,
            store: None,
            path: None,
            clock: None,
            cache_policy: CachePolicy::default(),
            outbox_config: OutboxConfig::default(),
            sync_config: SyncConfig::default(),
            online: false,
        }
    }

    /// Starts background sync. See [`SyncOrchestrator::initialize`].
    ///
    /// # Errors
    ///
    /// `NoRuntime` outside a tokio runtime, `Destroyed` after `destroy`.
    pub fn initialize(&self) -> SyncResult<()> {
        self.orchestrator.initialize()
    }

    /// Stops background sync and drops every event subscriber. Idempotent.
    pub fn destroy(&self) {
        self.orchestrator.destroy();
    }

    /// Reads one cached entity, flagging it for refresh if stale or missing.
    pub fn read_cache(&self, entity_kind: &str, key: &str) -> Option<CacheEntry> {
        let entry = self.cache.read(entity_kind, key);
        self.refresh_if_flagged();
        entry
    }

    /// Reads a group of cached entities, flagging the group for refresh if
    /// any of them is stale.
    pub fn read_scope(&self, entity_kind: &str, filter: &ScopeFilter) -> Vec<CacheEntry> {
        let entries = self.cache.read_all(entity_kind, filter);
        self.refresh_if_flagged();
        entries
    }

    /// Queues a write and returns immediately.
    ///
    /// With a `key`, the cache is updated optimistically (a delete removes
    /// the entry) and the write is merged with any untried earlier write to
    /// the same entity.
    ///
    /// # Errors
    ///
    /// Returns an error if `entity_kind` is empty.
    pub fn write_queued(
        &self,
        entity_kind: &str,
        method: Method,
        key: Option<&str>,
        payload: Value,
    ) -> SyncResult<OperationId> {
        let id = match key {
            Some(key) => {
                self.apply_optimistic(entity_kind, method, key, &payload);
                self.outbox.enqueue_for(entity_kind, method, key, payload)?
            }
            None => self.outbox.enqueue(entity_kind, method, payload)?,
        };
        self.orchestrator.request(SyncTrigger::Enqueue);
        Ok(id)
    }

    /// Sends a write straight to the server when possible.
    ///
    /// Falls back to the queue (under the same operation id) when offline,
    /// when earlier writes to the same entity are still queued, or when the
    /// attempt fails in a retryable way.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection for a permanent failure, which is not
    /// queued.
    pub async fn write(
        &self,
        entity_kind: &str,
        method: Method,
        key: Option<&str>,
        payload: Value,
    ) -> SyncResult<WriteOutcome> {
        if self.orchestrator.is_destroyed() {
            return Err(SyncError::Destroyed);
        }
        let queued_ahead = key.is_some_and(|k| self.outbox.has_pending_for(entity_kind, k));
        if !self.monitor.is_online() || queued_ahead {
            return self
                .write_queued(entity_kind, method, key, payload)
                .map(WriteOutcome::Queued);
        }

        let op = self.outbox.draft(entity_kind, method, key, payload);
        let timeout = self.orchestrator.config().submit_timeout;
        let transport = self.orchestrator.transport();
        let result = match tokio::time::timeout(timeout, transport.submit(&op)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(timeout)),
        };

        match result {
            Ok(response) => {
                let key = response.canonical_key.as_deref().or(key);
                if let Some(key) = key {
                    match (method, &response.payload) {
                        (Method::Delete, _) => {
                            self.cache.invalidate(entity_kind, key);
                        }
                        (_, Some(server)) => self.cache.put_with_policy(entity_kind, key, server.clone()),
                        (_, None) => self.cache.put_with_policy(entity_kind, key, op.payload.clone()),
                    }
                }
                debug!(op_id = %op.id, entity_kind, "write applied directly");
                Ok(WriteOutcome::Applied(response))
            }
            Err(e) if e.is_retryable() => {
                info!(op_id = %op.id, entity_kind, error = %e, "direct write failed, queueing");
                if let Some(key) = key {
                    self.apply_optimistic(entity_kind, method, key, &op.payload);
                }
                let id = self.outbox.enqueue_draft(op)?;
                self.orchestrator.request(SyncTrigger::Enqueue);
                Ok(WriteOutcome::Queued(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes a queued write before it is sent.
    ///
    /// An optimistic cache entry for a cancelled create is removed; for
    /// other keyed writes the entity is flagged so the server's view is
    /// restored.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `NotCancellable` once submission has
    /// started or the write has failed.
    pub fn cancel_queued(&self, id: &OperationId) -> SyncResult<QueuedOperation> {
        let op = self.outbox.cancel(id)?;
        self.revert_optimistic(&op);
        Ok(op)
    }

    /// Queues a failed write again with its attempt counter reset.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidTransition` unless it failed.
    pub fn retry_failed(&self, id: &OperationId) -> SyncResult<QueuedOperation> {
        let op = self.outbox.retry(id)?;
        self.orchestrator.request(SyncTrigger::Manual);
        Ok(op)
    }

    /// Gives up on a failed write and restores the server's view of its
    /// entity.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `InvalidTransition` unless it failed.
    pub fn discard_failed(&self, id: &OperationId) -> SyncResult<QueuedOperation> {
        let op = self.outbox.discard(id)?;
        self.revert_optimistic(&op);
        Ok(op)
    }

    /// Failed writes awaiting a user decision.
    pub fn failed_writes(&self) -> Vec<QueuedOperation> {
        self.outbox.list_failed()
    }

    /// Flags `target` and requests a refresh pass.
    pub fn request_refresh(&self, target: RefreshTarget) {
        self.cache.flag_refresh(target);
        self.orchestrator.request(SyncTrigger::Refresh);
    }

    /// Subscribes to sync events until the handle is dropped.
    pub fn on_sync_event(&self, handler: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(handler)
    }

    /// Feeds a raw connectivity reading from the platform.
    pub fn report_connectivity(&self, online: bool) {
        self.monitor.report(online);
    }

    /// Requests a pass in the background. No-op while offline.
    pub fn force_sync(&self) {
        self.orchestrator.request(SyncTrigger::Manual);
    }

    /// Runs a pass now and returns its summary.
    ///
    /// # Errors
    ///
    /// See [`SyncOrchestrator::sync_now`].
    pub async fn sync_now(&self) -> SyncResult<SyncSummary> {
        self.orchestrator.sync_now().await
    }

    /// Resolves once no pass is running or scheduled.
    pub async fn wait_idle(&self) {
        self.orchestrator.wait_idle().await;
    }

    /// Status snapshot.
    pub fn state(&self) -> SyncState {
        self.orchestrator.state()
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        self.orchestrator.transport()
    }

    /// The store.
    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// The clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The cache.
    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    /// The outbox.
    pub fn outbox(&self) -> &Arc<MutationOutbox> {
        &self.outbox
    }

    /// The network monitor.
    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// The event bridge.
    pub fn events(&self) -> &EventBridge {
        &self.events
    }

    /// The orchestrator.
    pub fn orchestrator(&self) -> &SyncOrchestrator<T> {
        &self.orchestrator
    }

    fn apply_optimistic(&self, entity_kind: &str, method: Method, key: &str, payload: &Value) {
        match method {
            Method::Delete => {
                self.cache.invalidate(entity_kind, key);
            }
            Method::Create | Method::Update => {
                self.cache.put_with_policy(entity_kind, key, payload.clone());
            }
        }
    }

    fn revert_optimistic(&self, op: &QueuedOperation) {
        let Some(key) = op.local_key.as_deref() else {
            return;
        };
        if op.method == Method::Create && !self.outbox.has_pending_for(&op.entity_kind, key) {
            self.cache.invalidate(&op.entity_kind, key);
        } else {
            self.request_refresh(RefreshTarget::key(op.entity_kind.clone(), key));
        }
    }

    fn refresh_if_flagged(&self) {
        if self.cache.pending_refreshes() > 0 && self.monitor.is_online() {
            self.orchestrator.request(SyncTrigger::Refresh);
        }
    }
}

impl<T: SyncTransport> Drop for SyncContext<T> {
    fn drop(&mut self) {
        self.orchestrator.destroy();
    }
}

impl<T: SyncTransport> fmt::Debug for SyncContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("monitor", &self.monitor)
            .field("orchestrator", &self.orchestrator)
            .field("pending", &self.outbox.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use fieldsync_core::{ManualClock, OperationStatus};
    use serde_json::json;

    fn context(online: bool) -> SyncContext<MockTransport> {
        SyncContext::builder(MockTransport::new())
            .clock(Arc::new(ManualClock::new(0)))
            .sync_config(SyncConfig::default().with_network_debounce(std::time::Duration::ZERO))
            .online(online)
            .build()
    }

    #[test]
    fn queued_write_updates_cache_optimistically() {
        let ctx = context(false);
        ctx.write_queued("companies", Method::Update, Some("c1"), json!({"name": "New"}))
            .unwrap();
        assert_eq!(ctx.cache().get("companies", "c1").unwrap().payload["name"], "New");
        assert_eq!(ctx.state().pending_count, 1);
    }

    #[test]
    fn cancelling_create_removes_optimistic_entry() {
        let ctx = context(false);
        let id = ctx
            .write_queued("appointments", Method::Create, Some("2024-05-01"), json!({}))
            .unwrap();
        ctx.cancel_queued(&id).unwrap();
        assert!(ctx.cache().get("appointments", "2024-05-01").is_none());
        assert_eq!(ctx.state().pending_count, 0);
    }

    #[test]
    fn cancelling_update_flags_refresh() {
        let ctx = context(false);
        let id = ctx
            .write_queued("companies", Method::Update, Some("c1"), json!({"name": "X"}))
            .unwrap();
        ctx.cancel_queued(&id).unwrap();
        assert_eq!(ctx.cache().pending_refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_write_when_online() {
        let ctx = context(true);
        ctx.transport()
            .push_reply(Ok(ServerResponse::ok().with_key("srv-7").with_payload(json!({"id": "srv-7"}))));

        let outcome = ctx
            .write("companies", Method::Create, None, json!({"name": "Acme"}))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(_)));
        assert!(ctx.outbox().is_empty());
        assert_eq!(ctx.cache().get("companies", "srv-7").unwrap().payload["id"], "srv-7");
    }

    #[tokio::test(start_paused = true)]
    async fn direct_write_falls_back_under_same_id() {
        let ctx = context(true);
        ctx.transport().fail_times(1, 503);

        let outcome = ctx
            .write("forms", Method::Create, None, json!({"a": 1}))
            .await
            .unwrap();
        let WriteOutcome::Queued(id) = outcome else {
            panic!("expected queued write");
        };
        let first = ctx.transport().submits()[0].id.clone();
        assert_eq!(first, id);
        assert_eq!(ctx.outbox().get(&id).unwrap().status, OperationStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_write_rejection_is_not_queued() {
        let ctx = context(true);
        ctx.transport().fail_times(1, 400);

        let err = ctx
            .write("forms", Method::Create, None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { status: Some(400), .. }));
        assert!(ctx.outbox().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_offline_is_queued() {
        let ctx = context(false);
        let outcome = ctx
            .write("forms", Method::Create, None, json!({}))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Queued(_)));
        assert_eq!(ctx.transport().submit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_destroy_fails() {
        let ctx = context(true);
        ctx.destroy();
        assert!(matches!(
            ctx.write("forms", Method::Create, None, json!({})).await,
            Err(SyncError::Destroyed)
        ));
    }
}
