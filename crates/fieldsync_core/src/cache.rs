//! Cached server entities with per-kind freshness.
//!
//! Every entity kind lives in its own store bucket (`cache:{kind}`), keyed
//! by the entity key. Reads never touch the network: stale data is returned
//! as-is, and the stale-aware [`CacheLayer::read`] family records a
//! [`RefreshTarget`] that the sync engine later fetches in the background.
//!
//! Scope markers in `cache-scope:{kind}` remember when a group of entities
//! (a key prefix, or the whole kind) was last fetched, which is what lets
//! a screen tell "nothing cached yet" apart from "cached, and empty".

use crate::clock::Clock;
use crate::codec;
use crate::config::CachePolicy;
use crate::error::{CoreError, CoreResult};
use crate::types::{CacheEntry, StoredEntry, Timestamp};
use fieldsync_storage::{PersistentStore, WriteBatch};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CACHE_PREFIX: &str = "cache:";
const SCOPE_PREFIX: &str = "cache-scope:";

fn cache_bucket(kind: &str) -> String {
    format!("{CACHE_PREFIX}{kind}")
}

fn scope_bucket(kind: &str) -> String {
    format!("{SCOPE_PREFIX}{kind}")
}

/// An entity type that knows its own cache identity.
pub trait CacheEntity: Serialize + DeserializeOwned {
    /// Entity kind, used as the cache namespace (e.g. `"companies"`).
    const KIND: &'static str;

    /// Unique key of this entity within its kind.
    fn cache_key(&self) -> String;
}

/// A typed cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    /// The decoded value.
    pub value: T,
    /// When it was fetched.
    pub fetched_at: Timestamp,
    /// Whether it had outlived its TTL when read.
    pub stale: bool,
}

/// Which entries of a kind a [`CacheLayer::get_all`] call selects.
#[derive(Clone, Default)]
pub enum ScopeFilter {
    /// Every entry of the kind.
    #[default]
    All,
    /// Entries whose key starts with the prefix.
    Prefix(String),
    /// Entries accepted by a client-side predicate.
    Predicate(Arc<dyn Fn(&CacheEntry) -> bool + Send + Sync>),
}

impl ScopeFilter {
    /// Selects keys starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Selects entries accepted by `predicate`.
    pub fn predicate(predicate: impl Fn(&CacheEntry) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    fn key_prefix(&self) -> Option<&str> {
        match self {
            Self::Prefix(p) => Some(p.as_str()),
            Self::All | Self::Predicate(_) => None,
        }
    }

    fn accepts(&self, entry: &CacheEntry) -> bool {
        match self {
            Self::All | Self::Prefix(_) => true,
            Self::Predicate(f) => f(entry),
        }
    }

    /// The refresh scope that re-fetches everything this filter can select.
    ///
    /// A predicate is opaque to the server, so it widens to the whole kind.
    #[must_use]
    pub fn refresh_scope(&self) -> RefreshScope {
        match self {
            Self::All | Self::Predicate(_) => RefreshScope::All,
            Self::Prefix(p) => RefreshScope::Prefix(p.clone()),
        }
    }
}

impl fmt::Debug for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Prefix(p) => f.debug_tuple("Prefix").field(p).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A group of entities to fetch from the server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefreshScope {
    /// One entity.
    Key(String),
    /// Every entity whose key starts with the prefix.
    Prefix(String),
    /// The whole kind.
    All,
}

impl RefreshScope {
    fn marker_key(&self) -> Option<&str> {
        match self {
            Self::Key(_) => None,
            Self::Prefix(p) => Some(p.as_str()),
            Self::All => Some(""),
        }
    }

    fn contains(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
            Self::All => true,
        }
    }
}

/// A stale (or missing) scope that should be re-fetched.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefreshTarget {
    /// Entity kind.
    pub entity_kind: String,
    /// What to fetch.
    pub scope: RefreshScope,
}

impl RefreshTarget {
    /// Targets a single entity.
    pub fn key(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_kind: kind.into(),
            scope: RefreshScope::Key(key.into()),
        }
    }

    /// Targets a whole kind.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            entity_kind: kind.into(),
            scope: RefreshScope::All,
        }
    }
}

/// Typed access to cached server entities.
///
/// All reads are served from local storage and never block on the network.
/// Writes are best-effort: a storage failure is logged and the entry stays
/// visible in memory for the rest of the process.
///
/// # Example
///
/// ```rust
/// use fieldsync_core::{CacheLayer, CachePolicy, ManualClock};
/// use fieldsync_storage::PersistentStore;
/// use serde_json::json;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let store = Arc::new(PersistentStore::in_memory());
/// let clock = Arc::new(ManualClock::new(0));
/// let cache = CacheLayer::new(store, clock.clone(), CachePolicy::default());
///
/// cache.put("companies", "c1", json!({"name": "Acme"}), Duration::from_secs(300));
/// assert!(!cache.is_stale("companies", "c1"));
///
/// clock.advance(Duration::from_secs(301));
/// assert!(cache.is_stale("companies", "c1"));
/// ```
pub struct CacheLayer {
    store: Arc<PersistentStore>,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    refresh: Mutex<BTreeSet<RefreshTarget>>,
}

impl CacheLayer {
    /// Creates a cache layer over `store`.
    pub fn new(store: Arc<PersistentStore>, clock: Arc<dyn Clock>, policy: CachePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            refresh: Mutex::new(BTreeSet::new()),
        }
    }

    /// The freshness policy in use.
    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Current time according to the cache's clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Returns the entry for `kind/key`, stale or not.
    #[must_use]
    pub fn get(&self, kind: &str, key: &str) -> Option<CacheEntry> {
        let bytes = self.store.get(&cache_bucket(kind), key)?;
        decode_entry(kind, key, &bytes)
    }

    /// Returns every entry of `kind` selected by `filter`, ordered by key.
    ///
    /// An empty result is not an error.
    #[must_use]
    pub fn get_all(&self, kind: &str, filter: &ScopeFilter) -> Vec<CacheEntry> {
        self.store
            .entries(&cache_bucket(kind), filter.key_prefix())
            .into_iter()
            .filter_map(|(key, bytes)| decode_entry(kind, &key, &bytes))
            .filter(|entry| filter.accepts(entry))
            .collect()
    }

    /// Overwrites `kind/key`, stamping `fetched_at = now`.
    pub fn put(&self, kind: &str, key: &str, payload: Value, ttl: Duration) {
        let entry = StoredEntry {
            payload,
            fetched_at: self.clock.now(),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.store_entry(kind, key, &entry);
    }

    /// Overwrites `kind/key` using the policy's TTL for `kind`.
    pub fn put_with_policy(&self, kind: &str, key: &str, payload: Value) {
        self.put(kind, key, payload, self.policy.ttl_for(kind));
    }

    /// Removes `kind/key`. Returns whether it was cached.
    pub fn invalidate(&self, kind: &str, key: &str) -> bool {
        match self.store.delete(&cache_bucket(kind), key) {
            Ok(existed) => existed,
            Err(e) => {
                warn!(entity_kind = kind, key, error = %e, "cache invalidation not persisted");
                true
            }
        }
    }

    /// Removes every entry and scope marker of `kind`. Returns the number of
    /// entries removed.
    pub fn invalidate_kind(&self, kind: &str) -> usize {
        let bucket = cache_bucket(kind);
        let keys = self.store.list_keys(&bucket, None);
        let markers = self.store.list_keys(&scope_bucket(kind), None);

        let mut batch = WriteBatch::new();
        for key in &keys {
            batch.delete(bucket.clone(), key.clone());
        }
        for marker in markers {
            batch.delete(scope_bucket(kind), marker);
        }
        if !batch.is_empty() {
            if let Err(e) = self.store.write_batch(batch) {
                warn!(entity_kind = kind, error = %e, "cache invalidation not persisted");
            }
        }
        keys.len()
    }

    /// Whether `kind/key` is stale. A missing entry counts as stale.
    #[must_use]
    pub fn is_stale(&self, kind: &str, key: &str) -> bool {
        self.get(kind, key)
            .map_or(true, |entry| entry.is_stale_at(self.clock.now()))
    }

    /// Stale-aware read.
    ///
    /// Returns whatever is cached, immediately. If the entry is stale or
    /// missing, the key is flagged for background refresh.
    pub fn read(&self, kind: &str, key: &str) -> Option<CacheEntry> {
        let entry = self.get(kind, key);
        let fresh = entry
            .as_ref()
            .is_some_and(|e| !e.is_stale_at(self.clock.now()));
        if !fresh {
            self.flag_refresh(RefreshTarget::key(kind, key));
        }
        entry
    }

    /// Stale-aware group read.
    ///
    /// The scope is flagged for refresh when any selected entry is stale, or
    /// when the scope has never been fetched.
    pub fn read_all(&self, kind: &str, filter: &ScopeFilter) -> Vec<CacheEntry> {
        let entries = self.get_all(kind, filter);
        let now = self.clock.now();
        let scope = filter.refresh_scope();

        let any_stale = entries.iter().any(|e| e.is_stale_at(now));
        let never_fetched = entries.is_empty() && self.scope_fetched_at(kind, &scope).is_none();
        if any_stale || never_fetched {
            self.flag_refresh(RefreshTarget {
                entity_kind: kind.to_string(),
                scope,
            });
        }
        entries
    }

    /// Typed read of `kind/key`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the cached payload does not decode
    /// as `T`.
    pub fn get_typed<T: DeserializeOwned>(&self, kind: &str, key: &str) -> CoreResult<Option<Cached<T>>> {
        let Some(entry) = self.get(kind, key) else {
            return Ok(None);
        };
        let stale = entry.is_stale_at(self.clock.now());
        Ok(Some(Cached {
            value: entry.decode()?,
            fetched_at: entry.fetched_at,
            stale,
        }))
    }

    /// Typed write of `kind/key` using the policy TTL.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `value` cannot be represented as JSON.
    pub fn put_typed<T: Serialize>(&self, kind: &str, key: &str, value: &T) -> CoreResult<()> {
        let payload =
            serde_json::to_value(value).map_err(|e| CoreError::serialization(e.to_string()))?;
        self.put_with_policy(kind, key, payload);
        Ok(())
    }

    /// Caches an entity under its own kind and key.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the entity cannot be represented as JSON.
    pub fn put_entity<E: CacheEntity>(&self, entity: &E) -> CoreResult<()> {
        self.put_typed(E::KIND, &entity.cache_key(), entity)
    }

    /// Reads an entity by key.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the cached payload does not decode.
    pub fn get_entity<E: CacheEntity>(&self, key: &str) -> CoreResult<Option<Cached<E>>> {
        self.get_typed(E::KIND, key)
    }

    /// Applies an authoritative server response for `scope`.
    ///
    /// Every entry in `entries` is written with a fresh timestamp, entries in
    /// the scope that the server no longer returns are removed, and the
    /// scope marker is updated. The whole change is one atomic storage batch,
    /// so concurrent readers see either the old or the new group.
    ///
    /// Returns the number of entries written.
    pub fn replace_scope(
        &self,
        kind: &str,
        scope: &RefreshScope,
        entries: Vec<(String, Value)>,
    ) -> usize {
        let bucket = cache_bucket(kind);
        let now = self.clock.now();
        let ttl_ms = self.policy.ttl_for(kind).as_millis() as u64;

        let returned: HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        let mut batch = WriteBatch::new();
        let mut removed = 0usize;

        let existing = match scope {
            RefreshScope::Key(key) => vec![key.clone()],
            RefreshScope::Prefix(p) => self.store.list_keys(&bucket, Some(p.as_str())),
            RefreshScope::All => self.store.list_keys(&bucket, None),
        };
        for key in existing {
            if !returned.contains(key.as_str()) && self.store.get(&bucket, &key).is_some() {
                batch.delete(bucket.clone(), key);
                removed += 1;
            }
        }

        let mut written = 0usize;
        for (key, payload) in &entries {
            if !scope.contains(key) {
                debug!(entity_kind = kind, key = %key, "server returned entity outside the requested scope");
            }
            let stored = StoredEntry {
                payload: payload.clone(),
                fetched_at: now,
                ttl_ms,
            };
            match stored.encode() {
                Ok(bytes) => {
                    batch.put(bucket.clone(), key.clone(), bytes);
                    written += 1;
                }
                Err(e) => warn!(entity_kind = kind, key = %key, error = %e, "skipping unencodable entity"),
            }
        }

        if let Some(marker) = scope.marker_key() {
            match codec::encode(&now) {
                Ok(bytes) => batch.put(scope_bucket(kind), marker.to_string(), bytes),
                Err(e) => warn!(entity_kind = kind, error = %e, "scope marker not encoded"),
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.store.write_batch(batch) {
                warn!(entity_kind = kind, error = %e, "cache refresh not persisted");
            }
        }
        debug!(entity_kind = kind, ?scope, written, removed, "cache scope replaced");
        written
    }

    /// When `scope` was last fetched as a group.
    ///
    /// For a single key this is the entry's own `fetched_at`.
    #[must_use]
    pub fn scope_fetched_at(&self, kind: &str, scope: &RefreshScope) -> Option<Timestamp> {
        match scope {
            RefreshScope::Key(key) => self.get(kind, key).map(|e| e.fetched_at),
            RefreshScope::Prefix(_) | RefreshScope::All => {
                let marker = scope.marker_key()?;
                let bytes = self.store.get(&scope_bucket(kind), marker)?;
                codec::decode(&bytes).ok()
            }
        }
    }

    /// Moves the entry at `old_key` to `new_key`, keeping its payload and age.
    ///
    /// Used when the server assigns a permanent key to an entity that was
    /// created offline under a temporary one. Returns whether an entry moved.
    pub fn rekey(&self, kind: &str, old_key: &str, new_key: &str) -> bool {
        if old_key == new_key {
            return false;
        }
        let bucket = cache_bucket(kind);
        let Some(bytes) = self.store.get(&bucket, old_key) else {
            return false;
        };
        let mut batch = WriteBatch::new();
        batch.delete(bucket.clone(), old_key.to_string());
        batch.put(bucket, new_key.to_string(), bytes);
        if let Err(e) = self.store.write_batch(batch) {
            warn!(entity_kind = kind, old_key, new_key, error = %e, "cache rekey not persisted");
        }
        true
    }

    /// Records that `target` should be fetched in the background.
    pub fn flag_refresh(&self, target: RefreshTarget) {
        let mut pending = self.refresh.lock();
        if pending.insert(target.clone()) {
            debug!(entity_kind = %target.entity_kind, scope = ?target.scope, "refresh flagged");
        }
    }

    /// Removes and returns every flagged refresh target.
    pub fn take_refresh_targets(&self) -> Vec<RefreshTarget> {
        std::mem::take(&mut *self.refresh.lock()).into_iter().collect()
    }

    /// Number of flagged refresh targets.
    #[must_use]
    pub fn pending_refreshes(&self) -> usize {
        self.refresh.lock().len()
    }

    /// Entity kinds with at least one cached entry, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.store
            .list_buckets(Some(CACHE_PREFIX))
            .into_iter()
            .filter_map(|b| b.strip_prefix(CACHE_PREFIX).map(str::to_string))
            .collect()
    }

    fn store_entry(&self, kind: &str, key: &str, entry: &StoredEntry) {
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(entity_kind = kind, key, error = %e, "cache entry not encoded");
                return;
            }
        };
        if let Err(e) = self.store.put(cache_bucket(kind), key, bytes) {
            warn!(entity_kind = kind, key, error = %e, "cache write not persisted");
        }
    }
}

impl fmt::Debug for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLayer")
            .field("policy", &self.policy)
            .field("pending_refreshes", &self.pending_refreshes())
            .finish_non_exhaustive()
    }
}

fn decode_entry(kind: &str, key: &str, bytes: &[u8]) -> Option<CacheEntry> {
    match codec::decode::<StoredEntry>(bytes) {
        Ok(stored) => Some(stored.into_entry(kind, key)),
        Err(e) => {
            warn!(entity_kind = kind, key, error = %e, "unreadable cache entry ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use fieldsync_storage::InMemoryBackend;
    use serde::Deserialize;
    use serde_json::json;

    const MINUTE: Duration = Duration::from_secs(60);

    fn setup() -> (CacheLayer, Arc<ManualClock>) {
        let store = Arc::new(PersistentStore::in_memory());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let policy = CachePolicy::default().with_kind_ttl("appointments", MINUTE);
        (CacheLayer::new(store, clock.clone(), policy), clock)
    }

    #[test]
    fn put_then_get() {
        let (cache, clock) = setup();
        cache.put("companies", "c1", json!({"name": "Acme"}), 5 * MINUTE);

        let entry = cache.get("companies", "c1").unwrap();
        assert_eq!(entry.payload, json!({"name": "Acme"}));
        assert_eq!(entry.fetched_at, clock.now());
        assert_eq!(entry.ttl, 5 * MINUTE);
        assert!(cache.get("companies", "c2").is_none());
        assert!(cache.get("contacts", "c1").is_none());
    }

    #[test]
    fn put_overwrites_whole_entry() {
        let (cache, clock) = setup();
        cache.put("companies", "c1", json!({"name": "Acme", "city": "Oslo"}), MINUTE);
        clock.advance(MINUTE);
        cache.put("companies", "c1", json!({"name": "Acme AS"}), 2 * MINUTE);

        let entry = cache.get("companies", "c1").unwrap();
        assert_eq!(entry.payload, json!({"name": "Acme AS"}));
        assert_eq!(entry.fetched_at, clock.now());
        assert_eq!(entry.ttl, 2 * MINUTE);
    }

    #[test]
    fn company_goes_stale_after_five_minutes() {
        let (cache, clock) = setup();
        cache.put("company", "acme", json!({}), 5 * MINUTE);

        clock.advance(4 * MINUTE);
        assert!(!cache.is_stale("company", "acme"));

        clock.advance(2 * MINUTE);
        assert!(cache.is_stale("company", "acme"));
    }

    #[test]
    fn missing_entry_is_stale() {
        let (cache, _) = setup();
        assert!(cache.is_stale("company", "nobody"));
    }

    #[test]
    fn stale_read_returns_value_and_flags_refresh() {
        let (cache, clock) = setup();
        cache.put("company", "acme", json!({"v": 1}), 5 * MINUTE);

        assert!(cache.read("company", "acme").is_some());
        assert_eq!(cache.pending_refreshes(), 0);

        clock.advance(6 * MINUTE);
        let entry = cache.read("company", "acme").unwrap();
        assert_eq!(entry.payload, json!({"v": 1}));
        assert_eq!(
            cache.take_refresh_targets(),
            vec![RefreshTarget::key("company", "acme")]
        );
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[test]
    fn repeated_flags_are_deduplicated() {
        let (cache, _) = setup();
        cache.read("company", "x");
        cache.read("company", "x");
        cache.flag_refresh(RefreshTarget::key("company", "x"));
        assert_eq!(cache.pending_refreshes(), 1);
    }

    #[test]
    fn get_all_by_prefix_and_predicate() {
        let (cache, _) = setup();
        for (key, day) in [("2024-05-01/a", 1), ("2024-05-02/b", 2), ("2024-06-01/c", 1)] {
            cache.put_with_policy("appointments", key, json!({ "day": day }));
        }

        let may = cache.get_all("appointments", &ScopeFilter::prefix("2024-05"));
        let keys: Vec<_> = may.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["2024-05-01/a", "2024-05-02/b"]);

        let firsts = cache.get_all(
            "appointments",
            &ScopeFilter::predicate(|e| e.payload["day"] == json!(1)),
        );
        assert_eq!(firsts.len(), 2);

        assert!(cache.get_all("invoices", &ScopeFilter::All).is_empty());
    }

    #[test]
    fn read_all_distinguishes_never_fetched_from_cached_empty() {
        let (cache, _) = setup();
        let scope = ScopeFilter::prefix("2024-07");

        assert!(cache.read_all("appointments", &scope).is_empty());
        assert_eq!(cache.take_refresh_targets().len(), 1);

        cache.replace_scope("appointments", &RefreshScope::Prefix("2024-07".into()), vec![]);
        assert!(cache
            .scope_fetched_at("appointments", &RefreshScope::Prefix("2024-07".into()))
            .is_some());
        assert!(cache.read_all("appointments", &scope).is_empty());
        assert_eq!(cache.pending_refreshes(), 0);
    }

    #[test]
    fn replace_scope_removes_entries_the_server_dropped() {
        let (cache, _) = setup();
        cache.put_with_policy("appointments", "2024-05-01/a", json!({"v": 1}));
        cache.put_with_policy("appointments", "2024-05-02/b", json!({"v": 1}));
        cache.put_with_policy("appointments", "2024-06-01/c", json!({"v": 1}));

        let written = cache.replace_scope(
            "appointments",
            &RefreshScope::Prefix("2024-05".into()),
            vec![("2024-05-01/a".into(), json!({"v": 2}))],
        );

        assert_eq!(written, 1);
        assert_eq!(cache.get("appointments", "2024-05-01/a").unwrap().payload, json!({"v": 2}));
        assert!(cache.get("appointments", "2024-05-02/b").is_none());
        assert!(cache.get("appointments", "2024-06-01/c").is_some());
    }

    #[test]
    fn replace_single_key_with_nothing_invalidates_it() {
        let (cache, _) = setup();
        cache.put_with_policy("appointments", "a", json!({}));
        cache.replace_scope("appointments", &RefreshScope::Key("a".into()), vec![]);
        assert!(cache.get("appointments", "a").is_none());
    }

    #[test]
    fn invalidate_and_invalidate_kind() {
        let (cache, _) = setup();
        cache.put_with_policy("appointments", "a", json!({}));
        cache.put_with_policy("appointments", "b", json!({}));
        cache.put_with_policy("companies", "c", json!({}));

        assert!(cache.invalidate("appointments", "a"));
        assert!(!cache.invalidate("appointments", "a"));
        assert_eq!(cache.invalidate_kind("appointments"), 1);
        assert!(cache.get_all("appointments", &ScopeFilter::All).is_empty());
        assert_eq!(cache.kinds(), vec!["companies".to_string()]);
    }

    #[test]
    fn rekey_keeps_payload_and_age() {
        let (cache, clock) = setup();
        cache.put_with_policy("appointments", "tmp-1", json!({"date": "D"}));
        let before = cache.get("appointments", "tmp-1").unwrap();
        clock.advance(MINUTE);

        assert!(cache.rekey("appointments", "tmp-1", "srv-9"));
        assert!(cache.get("appointments", "tmp-1").is_none());
        let after = cache.get("appointments", "srv-9").unwrap();
        assert_eq!(after.payload, before.payload);
        assert_eq!(after.fetched_at, before.fetched_at);
        assert!(!cache.rekey("appointments", "tmp-1", "srv-10"));
    }

    #[test]
    fn policy_ttl_per_kind() {
        let (cache, clock) = setup();
        cache.put_with_policy("appointments", "a", json!({}));
        cache.put_with_policy("companies", "c", json!({}));

        clock.advance(2 * MINUTE);
        assert!(cache.is_stale("appointments", "a"));
        assert!(!cache.is_stale("companies", "c"));
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Company {
        id: String,
        name: String,
    }

    impl CacheEntity for Company {
        const KIND: &'static str = "companies";

        fn cache_key(&self) -> String {
            self.id.clone()
        }
    }

    #[test]
    fn typed_entities() {
        let (cache, _) = setup();
        let acme = Company {
            id: "c1".into(),
            name: "Acme".into(),
        };
        cache.put_entity(&acme).unwrap();

        let hit = cache.get_entity::<Company>("c1").unwrap().unwrap();
        assert_eq!(hit.value, acme);
        assert!(!hit.stale);
        assert!(cache.get_entity::<Company>("c2").unwrap().is_none());
    }

    #[test]
    fn typed_mismatch_is_serialization_error() {
        let (cache, _) = setup();
        cache.put_with_policy("companies", "c1", json!([1, 2, 3]));
        let result = cache.get_entity::<Company>("c1");
        assert!(matches!(result, Err(CoreError::Serialization(_))));
    }

    #[test]
    fn entries_survive_restart() {
        let backend = InMemoryBackend::new();
        let clock = Arc::new(ManualClock::new(5_000));
        {
            let store = Arc::new(PersistentStore::with_backend(Box::new(backend.clone())).unwrap());
            let cache = CacheLayer::new(store, clock.clone(), CachePolicy::default());
            cache.put("companies", "c1", json!({"name": "Acme"}), MINUTE);
        }

        let store = Arc::new(PersistentStore::with_backend(Box::new(backend)).unwrap());
        let cache = CacheLayer::new(store, clock, CachePolicy::default());
        let entry = cache.get("companies", "c1").unwrap();
        assert_eq!(entry.payload, json!({"name": "Acme"}));
        assert_eq!(entry.fetched_at, Timestamp::from_millis(5_000));
    }

    mod staleness_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn stale_iff_age_exceeds_ttl(ttl_ms in 1u64..10_000_000, offset in 0u64..20_000_000) {
                let (cache, clock) = setup();
                cache.put("k", "x", json!(null), Duration::from_millis(ttl_ms));
                clock.advance(Duration::from_millis(offset));
                prop_assert_eq!(cache.is_stale("k", "x"), offset > ttl_ms);
            }

            #[test]
            fn boundary_one_ms_each_side(ttl_ms in 1u64..10_000_000) {
                let (cache, clock) = setup();
                cache.put("k", "x", json!(null), Duration::from_millis(ttl_ms));
                clock.advance(Duration::from_millis(ttl_ms - 1));
                prop_assert!(!cache.is_stale("k", "x"));
                clock.advance(Duration::from_millis(2));
                prop_assert!(cache.is_stale("k", "x"));
            }
        }
    }
}
