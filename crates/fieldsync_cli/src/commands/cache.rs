//! Cache listing.

use super::{format_age, open_store};
use crate::Format;
use fieldsync_core::{CacheLayer, CachePolicy, ScopeFilter, SystemClock};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// One cached entity as shown by the CLI.
#[derive(Debug, Serialize)]
pub struct CacheRow {
    /// Entity kind.
    pub kind: String,
    /// Entity key.
    pub key: String,
    /// Age in seconds.
    pub age_secs: u64,
    /// TTL in seconds.
    pub ttl_secs: u64,
    /// Whether the entry is past its TTL.
    pub stale: bool,
    /// Cached payload.
    pub payload: Value,
}

/// Runs the cache command.
pub fn run(path: &Path, kind: Option<&str>, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let cache = CacheLayer::new(store, Arc::new(SystemClock), CachePolicy::default());
    let now = cache.now();

    let kinds = match kind {
        Some(k) => vec![k.to_string()],
        None => cache.kinds(),
    };
    let rows: Vec<CacheRow> = kinds
        .iter()
        .flat_map(|k| cache.get_all(k, &ScopeFilter::All))
        .map(|entry| CacheRow {
            age_secs: entry.age_at(now).as_secs(),
            ttl_secs: entry.ttl.as_secs(),
            stale: entry.is_stale_at(now),
            kind: entry.entity_kind,
            key: entry.key,
            payload: entry.payload,
        })
        .collect();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Format::Text => {
            if rows.is_empty() {
                println!("No cached entities");
            }
            for row in &rows {
                println!(
                    "{:<20} {:<36} {:>6} {}",
                    row.kind,
                    row.key,
                    format_age(std::time::Duration::from_secs(row.age_secs)),
                    if row.stale { "stale" } else { "fresh" }
                );
            }
        }
    }
    Ok(())
}
