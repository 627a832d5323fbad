//! Outbox listing and failed-write resolution.

use super::open_store;
use crate::{Format, StatusFilter};
use fieldsync_core::{MutationOutbox, OperationId, OutboxConfig, QueuedOperation, SystemClock};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn open_outbox(path: &Path) -> Result<MutationOutbox, Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    Ok(MutationOutbox::open(store, Arc::new(SystemClock), OutboxConfig::default()))
}

/// Lists queued operations in delivery order.
pub fn list(
    path: &Path,
    status: Option<StatusFilter>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let outbox = open_outbox(path)?;
    let ops: Vec<QueuedOperation> = match status {
        Some(StatusFilter::Pending) => outbox.list_pending(),
        Some(StatusFilter::Failed) => outbox.list_failed(),
        None => outbox.list_all(),
    };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&ops)?),
        Format::Text => {
            if ops.is_empty() {
                println!("Outbox is empty");
            }
            for op in &ops {
                println!(
                    "{} {:<10} {:<6} {:<20} key={} retries={}",
                    op.id,
                    op.status,
                    op.method,
                    op.entity_kind,
                    op.local_key.as_deref().unwrap_or("-"),
                    op.retry_count
                );
                if let Some(error) = &op.last_error {
                    println!("    last error: {}", error);
                }
            }
        }
    }
    Ok(())
}

/// Resets a failed operation so the app delivers it on its next pass.
pub fn retry(path: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let outbox = open_outbox(path)?;
    let op = outbox.retry(&OperationId::from(id))?;
    info!(id = %op.id, kind = %op.entity_kind, "operation requeued");
    println!("✓ Requeued {}", op.id);
    Ok(())
}

/// Removes a failed operation.
pub fn discard(path: &Path, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let outbox = open_outbox(path)?;
    let op = outbox.discard(&OperationId::from(id))?;
    info!(id = %op.id, kind = %op.entity_kind, "operation discarded");
    println!("✓ Discarded {}", op.id);
    Ok(())
}
