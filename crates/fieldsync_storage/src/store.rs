//! Bucketed key/value store on top of a [`StorageBackend`] log.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use crate::record::{LogRecord, WriteOp, CRC_SIZE, HEADER_SIZE};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Log size below which automatic compaction never runs.
pub const DEFAULT_COMPACTION_THRESHOLD: u64 = 256 * 1024;

/// Health of a [`PersistentStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreHealth {
    /// Writes are durable.
    Healthy,
    /// The backend failed; writes are applied in memory only and will be
    /// lost when the process exits.
    Degraded {
        /// Description of the failure that caused degradation.
        reason: String,
    },
}

impl StoreHealth {
    /// Returns true if writes are currently durable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Size and shape statistics of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of non-empty buckets.
    pub buckets: usize,
    /// Number of live keys across all buckets.
    pub keys: usize,
    /// Number of records in the log.
    pub records: u64,
    /// Size of the log in bytes.
    pub log_bytes: u64,
    /// Bytes the log would occupy after compaction.
    pub live_bytes: u64,
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactStats {
    /// Records before compaction.
    pub records_before: u64,
    /// Records after compaction.
    pub records_after: u64,
    /// Log size before compaction.
    pub bytes_before: u64,
    /// Log size after compaction.
    pub bytes_after: u64,
}

/// Result of scanning a log without applying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Number of intact records.
    pub records: u64,
    /// Number of individual writes in intact records.
    pub writes: u64,
    /// Bytes covered by intact records.
    pub valid_bytes: u64,
    /// Bytes after the last intact record.
    pub trailing_bytes: u64,
    /// Description of the problem that stopped the scan, if any.
    pub error: Option<String>,
}

impl VerifyReport {
    /// Returns true if every byte of the log belongs to an intact record.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.trailing_bytes == 0 && self.error.is_none()
    }
}

/// A group of writes applied atomically.
///
/// After a crash either every write of the batch is visible or none is.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put to the batch.
    pub fn put(&mut self, bucket: impl Into<String>, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put {
            bucket: bucket.into(),
            key: key.into(),
            value,
        });
    }

    /// Adds a delete to the batch.
    pub fn delete(&mut self, bucket: impl Into<String>, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            bucket: bucket.into(),
            key: key.into(),
        });
    }

    /// Returns the number of writes in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Durable bucketed key/value storage.
///
/// The whole key space is held in memory; the backend log exists only to
/// rebuild it after a restart. Every write is appended as one checksummed
/// record and synced before the call returns. A reader running at the same
/// time as a writer observes either the old or the new value of a key,
/// never a partial one.
///
/// # Degraded mode
///
/// If the backend fails a write, the store logs the condition, applies the
/// write in memory anyway, returns the error, and stops touching the
/// backend for the rest of its life. Later writes return
/// [`StorageError::Degraded`] after being applied in memory. Callers can
/// keep working and surface [`PersistentStore::health`] as a warning.
pub struct PersistentStore {
    inner: RwLock<Inner>,
}

struct Inner {
    backend: Box<dyn StorageBackend>,
    buckets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    degraded: Option<String>,
    records: u64,
    log_bytes: u64,
    live_bytes: u64,
    compaction_threshold: Option<u64>,
}

impl PersistentStore {
    /// Opens (or creates) a file-backed store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or locked, or the log
    /// cannot be read.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        info!(path = %path.display(), "opening persistent store");
        Self::with_backend(Box::new(backend))
    }

    /// Opens a file-backed store, falling back to a degraded memory-only
    /// store if the file cannot be used.
    pub fn open_or_memory(path: &Path) -> Self {
        match Self::open(path) {
            Ok(store) => store,
            Err(e) => {
                error!(path = %path.display(), error = %e, "persistent store unavailable, running memory-only");
                let store = Self::in_memory();
                store.inner.write().degraded = Some(e.to_string());
                store
            }
        }
    }

    /// Creates an empty store backed by memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::empty(Box::new(InMemoryBackend::new()))),
        }
    }

    /// Opens a store over an arbitrary backend, replaying its log.
    ///
    /// A torn or corrupted tail is truncated so the next append starts on
    /// a record boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or truncated.
    pub fn with_backend(backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let mut inner = Inner::empty(backend);
        inner.replay()?;
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    /// Sets the log size above which automatic compaction may run.
    /// `None` disables automatic compaction.
    pub fn set_compaction_threshold(&self, threshold: Option<u64>) {
        self.inner.write().compaction_threshold = threshold;
    }

    /// Returns the value stored under `bucket/key`.
    #[must_use]
    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
    }

    /// Stores `value` under `bucket/key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write could not be made durable. The value
    /// is still visible in memory.
    pub fn put(
        &self,
        bucket: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> StorageResult<()> {
        self.write(LogRecord::Single(WriteOp::Put {
            bucket: bucket.into(),
            key: key.into(),
            value,
        }))
    }

    /// Removes `bucket/key`. Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal could not be made durable.
    pub fn delete(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        if self.get(bucket, key).is_none() {
            return Ok(false);
        }
        self.write(LogRecord::Single(WriteOp::Delete {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }))?;
        Ok(true)
    }

    /// Applies every write in `batch` as one durable unit.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable.
    pub fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        match batch.ops.len() {
            0 => Ok(()),
            1 => {
                let mut ops = batch.ops;
                self.write(LogRecord::Single(ops.remove(0)))
            }
            _ => self.write(LogRecord::Batch(batch.ops)),
        }
    }

    /// Lists the keys of `bucket`, optionally restricted to a prefix, in
    /// lexicographic order.
    #[must_use]
    pub fn list_keys(&self, bucket: &str, prefix: Option<&str>) -> Vec<String> {
        self.entries(bucket, prefix)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    /// Returns the key/value pairs of `bucket`, optionally restricted to a
    /// key prefix, in key order.
    #[must_use]
    pub fn entries(&self, bucket: &str, prefix: Option<&str>) -> Vec<(String, Vec<u8>)> {
        let inner = self.inner.read();
        let Some(keys) = inner.buckets.get(bucket) else {
            return Vec::new();
        };
        let prefix = prefix.unwrap_or("");
        keys.range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Lists non-empty bucket names, optionally restricted to a prefix.
    #[must_use]
    pub fn list_buckets(&self, prefix: Option<&str>) -> Vec<String> {
        let prefix = prefix.unwrap_or("");
        self.inner
            .read()
            .buckets
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Returns the current health of the store.
    #[must_use]
    pub fn health(&self) -> StoreHealth {
        match &self.inner.read().degraded {
            None => StoreHealth::Healthy,
            Some(reason) => StoreHealth::Degraded {
                reason: reason.clone(),
            },
        }
    }

    /// Returns size statistics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            buckets: inner.buckets.len(),
            keys: inner.buckets.values().map(BTreeMap::len).sum(),
            records: inner.records,
            log_bytes: inner.log_bytes,
            live_bytes: inner.live_bytes,
        }
    }

    /// Rewrites the log so it contains one record per live key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is degraded or the backend cannot
    /// replace its content. The previous log is kept on error.
    pub fn compact(&self) -> StorageResult<CompactStats> {
        let mut inner = self.inner.write();
        if let Some(reason) = inner.degraded.clone() {
            return Err(StorageError::Degraded(reason));
        }
        inner.compact()
    }

    /// Scans a backend log without applying or repairing it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backend cannot be read.
    pub fn verify_backend(backend: &dyn StorageBackend) -> StorageResult<VerifyReport> {
        let size = backend.size()?;
        let log = backend.read_at(0, size as usize)?;
        let mut report = VerifyReport::default();
        let mut offset = 0usize;

        loop {
            match LogRecord::decode_at(&log, offset) {
                Ok(Some((record, len))) => {
                    report.records += 1;
                    report.writes += record.into_ops().len() as u64;
                    offset += len;
                }
                Ok(None) => {
                    if offset < log.len() {
                        report.error = Some(format!("torn record at offset {offset}"));
                    }
                    break;
                }
                Err(e) => {
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        report.valid_bytes = offset as u64;
        report.trailing_bytes = size - offset as u64;
        Ok(report)
    }

    fn write(&self, record: LogRecord) -> StorageResult<()> {
        let encoded = record.encode()?;
        let mut inner = self.inner.write();

        let result = match inner.degraded.clone() {
            Some(reason) => Err(StorageError::Degraded(reason)),
            None => inner.persist(&encoded),
        };

        if let Err(e) = &result {
            if inner.degraded.is_none() {
                error!(error = %e, "store write failed, degrading to memory-only operation");
                inner.degraded = Some(e.to_string());
            }
        }

        for op in record.into_ops() {
            inner.apply(op);
        }

        if result.is_ok() {
            inner.maybe_compact();
        }
        result
    }
}

impl Inner {
    fn empty(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            buckets: BTreeMap::new(),
            degraded: None,
            records: 0,
            log_bytes: 0,
            live_bytes: 0,
            compaction_threshold: Some(DEFAULT_COMPACTION_THRESHOLD),
        }
    }

    fn replay(&mut self) -> StorageResult<()> {
        let size = self.backend.size()?;
        let log = self.backend.read_at(0, size as usize)?;
        let mut offset = 0usize;

        loop {
            match LogRecord::decode_at(&log, offset) {
                Ok(Some((record, len))) => {
                    for op in record.into_ops() {
                        self.apply(op);
                    }
                    self.records += 1;
                    offset += len;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(offset, error = %e, "discarding corrupted store log tail");
                    break;
                }
            }
        }

        if (offset as u64) < size {
            warn!(
                valid_bytes = offset,
                discarded_bytes = size - offset as u64,
                "truncating incomplete store log tail"
            );
            self.backend.truncate(offset as u64)?;
        }

        self.log_bytes = offset as u64;
        debug!(records = self.records, bytes = self.log_bytes, "store log replayed");
        Ok(())
    }

    fn persist(&mut self, encoded: &[u8]) -> StorageResult<()> {
        self.backend.append(encoded)?;
        self.backend.sync()?;
        self.records += 1;
        self.log_bytes += encoded.len() as u64;
        Ok(())
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Put { bucket, key, value } => {
                let added = framed_size(&bucket, &key, value.len());
                let keys = self.buckets.entry(bucket.clone()).or_default();
                if let Some(old) = keys.insert(key.clone(), value) {
                    self.live_bytes -= framed_size(&bucket, &key, old.len());
                }
                self.live_bytes += added;
            }
            WriteOp::Delete { bucket, key } => {
                if let Some(keys) = self.buckets.get_mut(&bucket) {
                    if let Some(old) = keys.remove(&key) {
                        self.live_bytes -= framed_size(&bucket, &key, old.len());
                    }
                    if keys.is_empty() {
                        self.buckets.remove(&bucket);
                    }
                }
            }
        }
    }

    fn maybe_compact(&mut self) {
        let Some(threshold) = self.compaction_threshold else {
            return;
        };
        let dead = self.log_bytes.saturating_sub(self.live_bytes);
        if self.log_bytes < threshold || dead * 2 < self.log_bytes {
            return;
        }
        if let Err(e) = self.compact() {
            warn!(error = %e, "automatic store compaction failed");
        }
    }

    fn compact(&mut self) -> StorageResult<CompactStats> {
        let mut log = Vec::with_capacity(self.live_bytes as usize);
        let mut records = 0u64;
        for (bucket, keys) in &self.buckets {
            for (key, value) in keys {
                let record = LogRecord::Single(WriteOp::Put {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
                log.extend(record.encode()?);
                records += 1;
            }
        }

        self.backend.replace(&log)?;

        let stats = CompactStats {
            records_before: self.records,
            records_after: records,
            bytes_before: self.log_bytes,
            bytes_after: log.len() as u64,
        };
        info!(
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            "store log compacted"
        );
        self.records = records;
        self.log_bytes = log.len() as u64;
        Ok(stats)
    }
}

fn framed_size(bucket: &str, key: &str, value_len: usize) -> u64 {
    (HEADER_SIZE + 2 + bucket.len() + 2 + key.len() + 4 + value_len + CRC_SIZE) as u64
}
