//! Compact command implementation.

use super::{format_size, open_store};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;

    println!("Compacting store at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = store.stats();
    let saved = stats.log_bytes.saturating_sub(stats.live_bytes);
    println!("Compaction Analysis:");
    println!("  Records:     {}", stats.records);
    println!("  Live keys:   {}", stats.keys);
    println!("  Size before: {}", format_size(stats.log_bytes));
    println!("  Size after:  {}", format_size(stats.live_bytes));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(saved),
        if stats.log_bytes > 0 {
            saved as f64 / stats.log_bytes as f64 * 100.0
        } else {
            0.0
        }
    );

    if dry_run {
        return Ok(());
    }
    println!();
    if saved == 0 {
        println!("No compaction needed - log is already minimal");
        return Ok(());
    }
    println!("Performing compaction...");
    let result = store.compact()?;
    println!(
        "✓ Compaction complete: {} -> {} records",
        result.records_before, result.records_after
    );
    Ok(())
}
