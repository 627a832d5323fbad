//! # FieldSync Storage
//!
//! Durable key/value storage for the FieldSync offline engine.
//!
//! This crate is the lowest layer of the engine. It provides:
//! - [`StorageBackend`]: an opaque, append-only byte log
//! - [`InMemoryBackend`] and [`FileBackend`] implementations
//! - [`PersistentStore`]: a bucketed key/value store built on a backend
//!
//! ## Design Principles
//!
//! - Every write is framed, checksummed, appended and synced before the
//!   call returns, so a crash right after `put` cannot lose it
//! - A torn tail left by a crash is detected on open and truncated
//! - Reads are served from memory and never touch the backend
//! - A failing backend degrades the store to memory-only operation
//!   instead of taking the caller down
//!
//! ## Example
//!
//! ```rust
//! use fieldsync_storage::PersistentStore;
//!
//! let store = PersistentStore::in_memory();
//! store.put("cache:company", "acme", b"{}".to_vec()).unwrap();
//! assert_eq!(store.get("cache:company", "acme"), Some(b"{}".to_vec()));
//! assert_eq!(store.list_keys("cache:company", None), vec!["acme".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod record;
mod store;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use record::{compute_crc32, LogRecord, RecordType, WriteOp, HEADER_SIZE, LOG_MAGIC};
pub use store::{
    CompactStats, PersistentStore, StoreHealth, StoreStats, VerifyReport, WriteBatch,
    DEFAULT_COMPACTION_THRESHOLD,
};
