//! File-based state backend for persistent storage.

use crate::backend::StateBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// A file-based state backend.
///
/// The snapshot lives in a single file. Writes go to a sibling temporary
/// file which is fsynced and then renamed over the target, so a crash
/// leaves either the previous or the new snapshot on disk.
///
/// An advisory lock on `<path>.lock` is held for the lifetime of the
/// backend; a second open of the same path fails with
/// [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use stocksync_storage::{StateBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("state/pending_queue.cbor")).unwrap();
/// backend.store(b"snapshot").unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    tmp_path: PathBuf,
    // Serializes writers within this process; the lock file covers others.
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl FileBackend {
    /// Opens the state slot at `path`, creating parent directories.
    ///
    /// The snapshot file itself is created lazily by the first `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created, the lock file
    /// cannot be opened, or another process holds the lock.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = sibling(path, "lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path: sibling(path, "tmp"),
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    /// Returns the path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sync_parent_dir(&self) -> StorageResult<()> {
        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        Ok(Some(buffer))
    }

    fn store(&self, data: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.lock();

        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.tmp_path)?;
            tmp.write_all(data)?;
            tmp.sync_all()?;
        }

        fs::rename(&self.tmp_path, &self.path)?;
        self.sync_parent_dir()
    }

    fn clear(&self) -> StorageResult<()> {
        let _guard = self.write_lock.lock();

        match fs::remove_file(&self.path) {
            Ok(()) => self.sync_parent_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}
