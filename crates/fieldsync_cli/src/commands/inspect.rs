//! Inspect command implementation.

use super::{format_size, open_store};
use crate::Format;
use fieldsync_core::{CacheLayer, CachePolicy, MutationOutbox, OutboxConfig, ScopeFilter, SystemClock};
use fieldsync_storage::StoreHealth;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Whether writes are durable.
    pub healthy: bool,
    /// Number of buckets.
    pub buckets: usize,
    /// Number of live keys.
    pub keys: usize,
    /// Number of log records.
    pub records: u64,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Size after compaction.
    pub live_bytes: u64,
    /// Queued writes awaiting delivery.
    pub pending_operations: usize,
    /// Abandoned writes.
    pub failed_operations: usize,
    /// Per-kind cache statistics.
    pub kinds: Vec<KindStats>,
}

/// Cache statistics for one entity kind.
#[derive(Debug, Serialize)]
pub struct KindStats {
    /// Entity kind.
    pub kind: String,
    /// Cached entities.
    pub entries: usize,
    /// Entities past their TTL.
    pub stale: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let clock = Arc::new(SystemClock);
    let cache = CacheLayer::new(store.clone(), clock.clone(), CachePolicy::default());
    let outbox = MutationOutbox::open(store.clone(), clock, OutboxConfig::default());

    let stats = store.stats();
    let now = cache.now();
    let kinds = cache
        .kinds()
        .into_iter()
        .map(|kind| {
            let entries = cache.get_all(&kind, &ScopeFilter::All);
            KindStats {
                stale: entries.iter().filter(|e| e.is_stale_at(now)).count(),
                entries: entries.len(),
                kind,
            }
        })
        .collect();

    let result = InspectResult {
        path: path.display().to_string(),
        healthy: store.health() == StoreHealth::Healthy,
        buckets: stats.buckets,
        keys: stats.keys,
        records: stats.records,
        log_bytes: stats.log_bytes,
        live_bytes: stats.live_bytes,
        pending_operations: outbox.pending_count(),
        failed_operations: outbox.failed_count(),
        kinds,
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("FieldSync Store Inspection");
    println!("==========================");
    println!();
    println!("Path:   {}", result.path);
    println!("Health: {}", if result.healthy { "ok" } else { "degraded" });
    println!();
    println!("Storage:");
    println!("  Log size:   {}", format_size(result.log_bytes));
    println!("  Live size:  {}", format_size(result.live_bytes));
    println!("  Records:    {}", result.records);
    println!("  Buckets:    {}", result.buckets);
    println!("  Keys:       {}", result.keys);
    println!();
    println!("Outbox:");
    println!("  Pending:    {}", result.pending_operations);
    println!("  Failed:     {}", result.failed_operations);

    if !result.kinds.is_empty() {
        println!();
        println!("Cache:");
        for kind in &result.kinds {
            println!(
                "  {:<20} {} entries, {} stale",
                kind.kind, kind.entries, kind.stale
            );
        }
    }
}
