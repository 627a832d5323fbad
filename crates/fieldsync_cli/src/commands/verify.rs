//! Verify command implementation.

use fieldsync_storage::{FileBackend, PersistentStore};
use std::path::Path;

/// Runs the verify command.
///
/// The log is scanned read-only; a torn tail is reported but not repaired.
/// Opening the store normally repairs it.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }
    println!("Verifying store at {}", path.display());
    println!();

    let backend = FileBackend::open(path)?;
    let report = PersistentStore::verify_backend(&backend)?;

    println!(
        "  Records: {}, writes: {}, valid bytes: {}, trailing bytes: {}",
        report.records, report.writes, report.valid_bytes, report.trailing_bytes
    );
    if let Some(error) = &report.error {
        println!("    ERROR: {}", error);
    }

    println!();
    if report.is_clean() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fresh_store_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.fsdb");
        {
            let store = PersistentStore::open(&path).unwrap();
            store.put("outbox", "a", b"{}".to_vec()).unwrap();
        }
        assert!(run(&path).is_ok());
    }

    #[test]
    fn torn_tail_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.fsdb");
        {
            let store = PersistentStore::open(&path).unwrap();
            store.put("outbox", "a", b"{}".to_vec()).unwrap();
        }
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"FSKV\x01").unwrap();
        drop(file);

        assert!(run(&path).is_err());
    }
}
