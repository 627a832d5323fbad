//! Durable queue of writes waiting for the server.
//!
//! Each operation is one record in the `outbox` bucket, keyed by its id.
//! The in-memory index mirrors the bucket and is ordered by a monotonic
//! sequence number, so submission order survives restarts even when two
//! writes share a millisecond.
//!
//! Writes that target the same local entity are merged at enqueue time
//! while the earlier one has never been attempted:
//!
//! | earlier | later  | result                      |
//! |---------|--------|-----------------------------|
//! | Create  | Update | Create with the newer body  |
//! | Create  | Delete | nothing                     |
//! | Update  | Update | Update with the newer body  |
//! | Update  | Delete | Delete                      |
//!
//! A `Failed` operation holds back every later operation on the same
//! entity until it is retried or discarded.

use crate::clock::Clock;
use crate::codec;
use crate::config::OutboxConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{Method, OperationId, OperationStatus, QueuedOperation};
use fieldsync_storage::{PersistentStore, WriteBatch};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const OUTBOX_BUCKET: &str = "outbox";

#[derive(Default)]
struct OutboxState {
    ops: BTreeMap<u64, QueuedOperation>,
    by_id: HashMap<OperationId, u64>,
    next_sequence: u64,
}

impl OutboxState {
    fn get(&self, id: &OperationId) -> Option<&QueuedOperation> {
        self.by_id.get(id).and_then(|seq| self.ops.get(seq))
    }

    fn get_mut(&mut self, id: &OperationId) -> Option<&mut QueuedOperation> {
        let seq = *self.by_id.get(id)?;
        self.ops.get_mut(&seq)
    }

    fn insert(&mut self, op: QueuedOperation) {
        self.next_sequence = self.next_sequence.max(op.sequence + 1);
        self.by_id.insert(op.id.clone(), op.sequence);
        self.ops.insert(op.sequence, op);
    }

    fn remove(&mut self, id: &OperationId) -> Option<QueuedOperation> {
        let seq = self.by_id.remove(id)?;
        self.ops.remove(&seq)
    }

    fn latest_for(&self, kind: &str, key: &str) -> Option<&QueuedOperation> {
        self.ops.values().rev().find(|op| op.targets(kind, key))
    }
}

enum Merge {
    Keep,
    Drop,
    Replace(Method),
}

fn merge(earlier: Method, later: Method) -> Merge {
    match (earlier, later) {
        (Method::Create, Method::Delete) => Merge::Drop,
        (Method::Create, Method::Update) => Merge::Replace(Method::Create),
        (Method::Update, Method::Update) => Merge::Replace(Method::Update),
        (Method::Update, Method::Delete) => Merge::Replace(Method::Delete),
        _ => Merge::Keep,
    }
}

/// Durable FIFO queue of pending writes.
///
/// `enqueue` never fails because the device is offline; it only records the
/// write. The sync engine moves operations through
/// `Pending -> Submitting -> Synced | Failed` and is the only caller of the
/// `mark_*` methods.
///
/// If the store cannot persist a change, the outbox logs the error and
/// keeps the change in memory so the current session still syncs it.
///
/// # Example
///
/// ```rust
/// use fieldsync_core::{ManualClock, Method, MutationOutbox, OutboxConfig};
/// use fieldsync_storage::PersistentStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let store = Arc::new(PersistentStore::in_memory());
/// let outbox = MutationOutbox::open(store, Arc::new(ManualClock::new(0)), OutboxConfig::default());
///
/// let id = outbox.enqueue("service_form", Method::Create, json!({"answer": "A"})).unwrap();
/// assert_eq!(outbox.pending_count(), 1);
///
/// outbox.cancel(&id).unwrap();
/// assert_eq!(outbox.pending_count(), 0);
/// ```
pub struct MutationOutbox {
    store: Arc<PersistentStore>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    state: RwLock<OutboxState>,
}

impl MutationOutbox {
    /// Loads the outbox from `store`.
    ///
    /// Operations persisted mid-submit are returned to `Pending`; the
    /// server deduplicates by id if the earlier attempt did land.
    pub fn open(store: Arc<PersistentStore>, clock: Arc<dyn Clock>, config: OutboxConfig) -> Self {
        let mut state = OutboxState::default();
        let mut interrupted = Vec::new();

        for (key, bytes) in store.entries(OUTBOX_BUCKET, None) {
            let mut op: QueuedOperation = match codec::decode(&bytes) {
                Ok(op) => op,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable queued operation");
                    continue;
                }
            };
            if op.status == OperationStatus::Submitting {
                op.status = OperationStatus::Pending;
                interrupted.push(op.clone());
            }
            state.insert(op);
        }

        if !interrupted.is_empty() {
            info!(count = interrupted.len(), "resuming operations interrupted mid-submit");
        }
        debug!(operations = state.ops.len(), "outbox loaded");

        let outbox = Self {
            store,
            clock,
            config,
            state: RwLock::new(state),
        };
        for op in &interrupted {
            outbox.persist(op);
        }
        outbox
    }

    /// The retry limits in use.
    #[must_use]
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Queues a write that is not tied to a local entity key.
    ///
    /// # Errors
    ///
    /// Returns an error if `entity_kind` is empty.
    pub fn enqueue(&self, entity_kind: &str, method: Method, payload: Value) -> CoreResult<OperationId> {
        self.enqueue_draft(self.draft(entity_kind, method, None, payload))
    }

    /// Queues a write to the entity `local_key` of `entity_kind`.
    ///
    /// When the previous queued write to the same entity has not been
    /// attempted yet, the two are merged. The returned id is the operation
    /// that will carry the write; when a create is cancelled by a delete,
    /// nothing is queued and the returned id refers to no operation.
    ///
    /// # Errors
    ///
    /// Returns an error if `entity_kind` is empty.
    pub fn enqueue_for(
        &self,
        entity_kind: &str,
        method: Method,
        local_key: &str,
        payload: Value,
    ) -> CoreResult<OperationId> {
        self.enqueue_draft(self.draft(entity_kind, method, Some(local_key), payload))
    }

    /// Builds an operation with a fresh id without queueing it.
    ///
    /// Used for a direct online attempt that falls back to the queue under
    /// the same id, so the server can deduplicate the two.
    #[must_use]
    pub fn draft(
        &self,
        entity_kind: &str,
        method: Method,
        local_key: Option<&str>,
        payload: Value,
    ) -> QueuedOperation {
        QueuedOperation {
            id: OperationId::generate(),
            sequence: 0,
            entity_kind: entity_kind.to_string(),
            method,
            local_key: local_key.map(str::to_string),
            payload,
            created_at: self.clock.now(),
            status: OperationStatus::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Queues a drafted operation, keeping its id and creation time.
    ///
    /// The sequence, status and counters are assigned by the outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity kind is empty or the id is already
    /// queued.
    pub fn enqueue_draft(&self, mut op: QueuedOperation) -> CoreResult<OperationId> {
        if op.entity_kind.is_empty() {
            return Err(CoreError::invalid_argument("entity kind must not be empty"));
        }

        let mut state = self.state.write();
        if state.get(&op.id).is_some() {
            return Err(CoreError::invalid_argument(format!("operation {} is already queued", op.id)));
        }

        if let (true, Some(key)) = (self.config.coalesce, op.local_key.as_deref()) {
            let earlier = state
                .latest_for(&op.entity_kind, key)
                .filter(|prev| prev.status == OperationStatus::Pending && prev.retry_count == 0)
                .map(|prev| (prev.id.clone(), prev.method));

            if let Some((earlier_id, earlier_method)) = earlier {
                match merge(earlier_method, op.method) {
                    Merge::Keep => {}
                    Merge::Drop => {
                        state.remove(&earlier_id);
                        self.remove_persisted(&earlier_id);
                        info!(
                            op_id = %earlier_id,
                            entity_kind = %op.entity_kind,
                            local_key = key,
                            "queued create cancelled by delete before sync"
                        );
                        return Ok(op.id);
                    }
                    Merge::Replace(merged) => {
                        let Some(prev) = state.get_mut(&earlier_id) else {
                            return Err(CoreError::NotFound { id: earlier_id });
                        };
                        prev.method = merged;
                        prev.payload = op.payload;
                        let prev = prev.clone();
                        self.persist(&prev);
                        debug!(
                            op_id = %prev.id,
                            entity_kind = %prev.entity_kind,
                            local_key = key,
                            method = %merged,
                            "queued write merged"
                        );
                        return Ok(prev.id);
                    }
                }
            }
        }

        op.sequence = state.next_sequence;
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.last_error = None;
        self.persist(&op);
        debug!(op_id = %op.id, entity_kind = %op.entity_kind, method = %op.method, "operation queued");
        let id = op.id.clone();
        state.insert(op);
        Ok(id)
    }

    /// Operations waiting to be submitted, oldest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<QueuedOperation> {
        self.filtered(|op| op.status == OperationStatus::Pending)
    }

    /// The oldest `Pending` operation that may be submitted now.
    ///
    /// Operations queued behind a `Failed` one on the same entity wait, so
    /// a retried create still reaches the server before its updates.
    #[must_use]
    pub fn next_ready(&self) -> Option<QueuedOperation> {
        let state = self.state.read();
        let mut held: HashSet<(&str, &str)> = HashSet::new();
        for op in state.ops.values() {
            let target = op.local_key.as_deref().map(|key| (op.entity_kind.as_str(), key));
            match op.status {
                OperationStatus::Failed => held.extend(target),
                OperationStatus::Pending if !target.is_some_and(|t| held.contains(&t)) => {
                    return Some(op.clone());
                }
                _ => {}
            }
        }
        None
    }

    /// Abandoned operations, oldest first.
    #[must_use]
    pub fn list_failed(&self) -> Vec<QueuedOperation> {
        self.filtered(QueuedOperation::is_failed)
    }

    /// Every operation in the outbox, oldest first.
    #[must_use]
    pub fn list_all(&self) -> Vec<QueuedOperation> {
        self.filtered(|_| true)
    }

    /// Looks up an operation by id.
    #[must_use]
    pub fn get(&self, id: &OperationId) -> Option<QueuedOperation> {
        self.state.read().get(id).cloned()
    }

    /// Number of operations not yet delivered (`Pending` or `Submitting`).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.read().ops.values().filter(|op| op.is_pending()).count()
    }

    /// Number of undelivered operations of one kind.
    #[must_use]
    pub fn pending_count_for(&self, entity_kind: &str) -> usize {
        self.state
            .read()
            .ops
            .values()
            .filter(|op| op.is_pending() && op.entity_kind == entity_kind)
            .count()
    }

    /// Whether any undelivered operation targets `kind/key`.
    #[must_use]
    pub fn has_pending_for(&self, entity_kind: &str, local_key: &str) -> bool {
        self.state
            .read()
            .ops
            .values()
            .any(|op| op.is_pending() && op.targets(entity_kind, local_key))
    }

    /// Number of abandoned operations.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.state.read().ops.values().filter(|op| op.is_failed()).count()
    }

    /// Total number of operations held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().ops.len()
    }

    /// Whether the outbox holds no operations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().ops.is_empty()
    }

    /// Marks a pending operation as in flight.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `InvalidTransition` unless
    /// the operation is `Pending`.
    pub fn mark_submitting(&self, id: &OperationId) -> CoreResult<QueuedOperation> {
        self.transition(id, "submit", |op| {
            if op.status != OperationStatus::Pending {
                return false;
            }
            op.status = OperationStatus::Submitting;
            true
        })
    }

    /// Marks an operation as accepted by the server and evicts it.
    ///
    /// Returns the evicted operation with status `Synced`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `InvalidTransition` for an
    /// operation that already failed.
    pub fn mark_synced(&self, id: &OperationId) -> CoreResult<QueuedOperation> {
        let mut state = self.state.write();
        let status = state
            .get(id)
            .map(|op| op.status)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        if status == OperationStatus::Failed {
            return Err(CoreError::InvalidTransition {
                id: id.clone(),
                from: status,
                action: "sync",
            });
        }
        let mut op = state
            .remove(id)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        self.remove_persisted(id);
        op.status = OperationStatus::Synced;
        debug!(op_id = %id, entity_kind = %op.entity_kind, retries = op.retry_count, "operation synced");
        Ok(op)
    }

    /// Records a failed submission.
    ///
    /// A retryable failure increments `retry_count` and returns the
    /// operation to `Pending`, unless the attempt limit is reached, in which
    /// case it is abandoned as `Failed`. A permanent failure abandons the
    /// operation immediately without touching `retry_count`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `InvalidTransition` for an
    /// operation that already failed.
    pub fn mark_failed(
        &self,
        id: &OperationId,
        error: &str,
        retryable: bool,
    ) -> CoreResult<QueuedOperation> {
        let max_attempts = self.config.max_attempts;
        let op = self.transition(id, "fail", |op| {
            if op.status == OperationStatus::Failed {
                return false;
            }
            op.last_error = Some(error.to_string());
            if retryable {
                op.retry_count += 1;
                op.status = if op.retry_count >= max_attempts {
                    OperationStatus::Failed
                } else {
                    OperationStatus::Pending
                };
            } else {
                op.status = OperationStatus::Failed;
            }
            true
        })?;
        if op.is_failed() {
            warn!(
                op_id = %id,
                entity_kind = %op.entity_kind,
                retries = op.retry_count,
                error,
                "operation abandoned"
            );
        }
        Ok(op)
    }

    /// Removes a pending operation without contacting the server.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `NotCancellable` unless the
    /// operation is `Pending`.
    pub fn cancel(&self, id: &OperationId) -> CoreResult<QueuedOperation> {
        let mut state = self.state.write();
        let status = state
            .get(id)
            .map(|op| op.status)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        if status != OperationStatus::Pending {
            return Err(CoreError::NotCancellable {
                id: id.clone(),
                status,
            });
        }
        let op = state
            .remove(id)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        self.remove_persisted(id);
        info!(op_id = %id, entity_kind = %op.entity_kind, "queued operation cancelled");
        Ok(op)
    }

    /// Returns an abandoned operation to the queue with its counters reset.
    ///
    /// It keeps its original position relative to other operations.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `InvalidTransition` unless
    /// the operation is `Failed`.
    pub fn retry(&self, id: &OperationId) -> CoreResult<QueuedOperation> {
        self.transition(id, "retry", |op| {
            if op.status != OperationStatus::Failed {
                return false;
            }
            op.status = OperationStatus::Pending;
            op.retry_count = 0;
            op.last_error = None;
            true
        })
    }

    /// Permanently removes an abandoned operation.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `InvalidTransition` unless
    /// the operation is `Failed`.
    pub fn discard(&self, id: &OperationId) -> CoreResult<QueuedOperation> {
        let mut state = self.state.write();
        let status = state
            .get(id)
            .map(|op| op.status)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        if status != OperationStatus::Failed {
            return Err(CoreError::InvalidTransition {
                id: id.clone(),
                from: status,
                action: "discard",
            });
        }
        let op = state
            .remove(id)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        self.remove_persisted(id);
        info!(op_id = %id, entity_kind = %op.entity_kind, "failed operation discarded");
        Ok(op)
    }

    /// Points every undelivered or failed operation on `kind/old_key` at
    /// `new_key`. Returns the number of operations rewritten.
    pub fn rewrite_local_key(&self, entity_kind: &str, old_key: &str, new_key: &str) -> usize {
        let mut state = self.state.write();
        let mut batch = WriteBatch::new();
        let mut rewritten = 0usize;

        for op in state.ops.values_mut() {
            if op.status == OperationStatus::Synced || !op.targets(entity_kind, old_key) {
                continue;
            }
            op.local_key = Some(new_key.to_string());
            match codec::encode(&*op) {
                Ok(bytes) => batch.put(OUTBOX_BUCKET, op.id.as_str(), bytes),
                Err(e) => error!(op_id = %op.id, error = %e, "queued operation not encoded"),
            }
            rewritten += 1;
        }

        if !batch.is_empty() {
            if let Err(e) = self.store.write_batch(batch) {
                error!(entity_kind, error = %e, "outbox key rewrite not persisted");
            }
        }
        if rewritten > 0 {
            debug!(entity_kind, old_key, new_key, rewritten, "queued operations rekeyed");
        }
        rewritten
    }

    fn filtered(&self, keep: impl Fn(&QueuedOperation) -> bool) -> Vec<QueuedOperation> {
        self.state
            .read()
            .ops
            .values()
            .filter(|op| keep(op))
            .cloned()
            .collect()
    }

    fn transition(
        &self,
        id: &OperationId,
        action: &'static str,
        apply: impl FnOnce(&mut QueuedOperation) -> bool,
    ) -> CoreResult<QueuedOperation> {
        let mut state = self.state.write();
        let op = state
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound { id: id.clone() })?;
        let from = op.status;
        if !apply(op) {
            return Err(CoreError::InvalidTransition {
                id: id.clone(),
                from,
                action,
            });
        }
        let op = op.clone();
        self.persist(&op);
        Ok(op)
    }

    fn persist(&self, op: &QueuedOperation) {
        let bytes = match codec::encode(&*op) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(op_id = %op.id, error = %e, "queued operation not encoded");
                return;
            }
        };
        if let Err(e) = self.store.put(OUTBOX_BUCKET, op.id.as_str(), bytes) {
            error!(op_id = %op.id, error = %e, "queued operation kept in memory only");
        }
    }

    fn remove_persisted(&self, id: &OperationId) {
        if let Err(e) = self.store.delete(OUTBOX_BUCKET, id.as_str()) {
            error!(op_id = %id, error = %e, "outbox removal not persisted");
        }
    }
}

impl fmt::Debug for MutationOutbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOutbox")
            .field("operations", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
