//! CLI command implementations.

pub mod cache;
pub mod compact;
pub mod inspect;
pub mod outbox;
pub mod verify;

use fieldsync_storage::PersistentStore;
use std::path::Path;
use std::sync::Arc;

/// Opens an existing store file. Never creates one.
pub(crate) fn open_store(path: &Path) -> Result<Arc<PersistentStore>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    Ok(Arc::new(PersistentStore::open(path)?))
}

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

pub(crate) fn format_age(age: std::time::Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m", secs / 60),
        3600..=86_399 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sizes_pick_a_readable_unit() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn ages_round_down_to_the_largest_unit() {
        assert_eq!(format_age(Duration::from_secs(42)), "42s");
        assert_eq!(format_age(Duration::from_secs(5 * 60 + 10)), "5m");
        assert_eq!(format_age(Duration::from_secs(26 * 3600)), "1d");
    }

    #[test]
    fn missing_store_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.fsdb");
        assert!(open_store(&path).is_err());
        assert!(!path.exists());
    }
}
