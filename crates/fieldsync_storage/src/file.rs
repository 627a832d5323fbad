//! Append-only log file, locked for exclusive use.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A [`StorageBackend`] over a single file.
///
/// Appended bytes survive a process kill once `sync` returns. `replace`
/// stages the new content in a sibling `.compact` file and renames it
/// into place, so a crash mid-compaction leaves the old log intact.
///
/// The file is locked exclusively while the backend lives; a second
/// process opening the same store gets [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use fieldsync_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("store.log")).unwrap();
/// backend.append(b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    log: Mutex<LogFile>,
}

/// The open file together with its logical length. Both change together.
#[derive(Debug)]
struct LogFile {
    file: File,
    len: u64,
}

impl LogFile {
    fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| StorageError::Locked)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl FileBackend {
    /// Opens (or creates) the log at `path` and locks it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another process holds the file,
    /// or an I/O error if it cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(LogFile::open(path)?),
        })
    }

    /// Like [`open`](Self::open), creating missing parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }
        Self::open(path)
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".compact");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut log = self.log.lock();
        let in_bounds = offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= log.len);
        if !in_bounds {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: log.len,
            });
        }

        let mut out = vec![0u8; len];
        if len > 0 {
            log.file.seek(SeekFrom::Start(offset))?;
            log.file.read_exact(&mut out)?;
        }
        Ok(out)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let log = self.log.get_mut();
        let offset = log.len;
        // Opened in append mode, so writes always land at the end.
        log.file.write_all(data)?;
        log.len += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.log.get_mut().file.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.log.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let log = self.log.get_mut();
        log.file.flush()?;
        log.file.sync_data()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let log = self.log.get_mut();
        if new_size > log.len {
            return Err(StorageError::truncate_would_grow(new_size, log.len));
        }
        log.file.set_len(new_size)?;
        log.file.sync_all()?;
        log.len = new_size;
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let staging = self.staging_path();
        {
            let mut staged = File::create(&staging)?;
            staged.write_all(data)?;
            staged.sync_all()?;
        }

        std::fs::rename(&staging, &self.path)?;
        #[cfg(unix)]
        if let Some(dir) = self.path.parent().and_then(|p| File::open(p).ok()) {
            dir.sync_all()?;
        }

        // The old handle (and its lock) now refers to the unlinked file.
        *self.log.get_mut() = LogFile::open(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn appends_are_readable_at_their_offsets() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("store.log")).unwrap();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.read_at(0, 11).unwrap(), b"hello world");
        assert!(matches!(
            backend.read_at(10, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn synced_data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn second_open_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        let _first = FileBackend::open(&path).unwrap();
        assert!(matches!(FileBackend::open(&path), Err(StorageError::Locked)));
    }

    #[test]
    fn truncate_cuts_tail_but_never_grows() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("store.log")).unwrap();
        backend.append(b"hello world").unwrap();

        backend.truncate(5).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        assert!(backend.truncate(50).is_err());
    }

    #[test]
    fn replace_swaps_content_and_keeps_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"old old old").unwrap();
            backend.replace(b"new").unwrap();
            assert_eq!(backend.read_at(0, 3).unwrap(), b"new");

            backend.append(b"!").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.read_at(0, 4).unwrap(), b"new!");
        assert!(!dir.path().join("store.log.compact").exists());
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("store.log");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}
