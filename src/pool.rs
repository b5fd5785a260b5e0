//! Pooled file handles.
//!
//! Every open file in the storage core goes through the process-wide
//! [`FilePool`]. The pool deduplicates redundant opens of the same path,
//! reference-counts users, keeps a bounded set of idle handles open for
//! reuse, and supports closing every handle of a path synchronously (needed
//! before renaming or deleting a file that readers may still hold).
//!
//! A [`PooledFile`] serializes seek+IO pairs under an internal mutex, so a
//! single ReadWrite handle can be shared by several writers. Once
//! force-closed, a handle keeps existing but every operation on it fails
//! with [`PoolError::Closed`]; callers holding a stale `Arc` cannot touch
//! the old file descriptor again.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::constants::{MAX_IDLE_POOLED_FILES, POOLED_FILE_IDLE_TIMEOUT};

/// Errors from pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The host filesystem refused the open.
    #[error("unable to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The handle was force-closed while the caller still held it.
    #[error("file handle has been closed")]
    Closed,

    /// Seek, read, write or resize failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Access mode of a pooled handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An open file owned by the pool.
///
/// All IO goes through methods that lock the internal mutex for the whole
/// seek+IO pair, so interleaved users never observe a foreign seek.
pub struct PooledFile {
    path: PathBuf,
    mode: OpenMode,
    io: Mutex<Option<std::fs::File>>,
}

impl PooledFile {
    fn new(path: PathBuf, mode: OpenMode, file: std::fs::File) -> Self {
        Self {
            path,
            mode,
            io: Mutex::new(Some(file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Returns `true` once the handle has been closed by the pool.
    pub fn is_closed(&self) -> bool {
        self.io.lock().is_none()
    }

    /// Reads up to `buf.len()` bytes at `offset`. Short only at end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PoolError> {
        let mut guard = self.io.lock();
        let file = guard.as_mut().ok_or(PoolError::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    /// Writes the whole buffer at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), PoolError> {
        let mut guard = self.io.lock();
        let file = guard.as_mut().ok_or(PoolError::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Sets the file length.
    pub fn resize(&self, len: u64) -> Result<(), PoolError> {
        let guard = self.io.lock();
        let file = guard.as_ref().ok_or(PoolError::Closed)?;
        file.set_len(len)?;
        Ok(())
    }

    /// Runs `f` against the raw file, for platform-specific operations.
    pub fn with_file<T>(
        &self,
        f: impl FnOnce(&std::fs::File) -> std::io::Result<T>,
    ) -> Result<T, PoolError> {
        let guard = self.io.lock();
        let file = guard.as_ref().ok_or(PoolError::Closed)?;
        Ok(f(file)?)
    }

    /// Drops the underlying descriptor. Blocks until in-flight IO finishes.
    fn close(&self) {
        self.io.lock().take();
    }
}

struct PoolEntry {
    file: Arc<PooledFile>,
    refs: u32,
    released_at: Instant,
}

/// Process-wide pool of open file handles, keyed by (path, mode).
pub struct FilePool {
    entries: Mutex<Vec<PoolEntry>>,
}

impl FilePool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Opens `path` in `mode`, reusing a pooled handle when one exists.
    ///
    /// For `ReadWrite`, a missing file is created and the second element of
    /// the returned pair is `true`. At most one ReadWrite handle per path is
    /// ever pooled; additional openers share it.
    ///
    /// # Errors
    ///
    /// [`PoolError::Open`] when the filesystem refuses.
    pub fn open(
        &self,
        path: &Path,
        mode: OpenMode,
    ) -> Result<(Arc<PooledFile>, bool), PoolError> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.file.mode == mode && e.file.path == path && !e.file.is_closed())
        {
            entry.refs += 1;
            return Ok((entry.file.clone(), false));
        }

        let (file, created) = match mode {
            OpenMode::ReadOnly => {
                let file = std::fs::File::open(path).map_err(|source| PoolError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;
                (file, false)
            }
            OpenMode::ReadWrite => {
                match OpenOptions::new().read(true).write(true).open(path) {
                    Ok(file) => (file, false),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        let file = OpenOptions::new()
                            .read(true)
                            .write(true)
                            .create_new(true)
                            .open(path)
                            .map_err(|source| PoolError::Open {
                                path: path.to_path_buf(),
                                source,
                            })?;
                        (file, true)
                    }
                    Err(source) => {
                        return Err(PoolError::Open {
                            path: path.to_path_buf(),
                            source,
                        })
                    }
                }
            }
        };

        debug!(path = %path.display(), ?mode, created, "pooled a new file handle");

        let pooled = Arc::new(PooledFile::new(path.to_path_buf(), mode, file));
        entries.push(PoolEntry {
            file: pooled.clone(),
            refs: 1,
            released_at: Instant::now(),
        });
        Ok((pooled, created))
    }

    /// Decrements the use count of `handle`.
    ///
    /// With `force_close` the handle is closed and dropped from the pool at
    /// once; otherwise a fully released handle stays pooled for reuse until
    /// the idle cap or [`evict_idle`](Self::evict_idle) reclaims it.
    pub fn release(&self, handle: &Arc<PooledFile>, force_close: bool) {
        let mut entries = self.entries.lock();

        if let Some(pos) = entries.iter().position(|e| Arc::ptr_eq(&e.file, handle)) {
            let entry = &mut entries[pos];
            entry.refs = entry.refs.saturating_sub(1);
            if force_close {
                let entry = entries.remove(pos);
                entry.file.close();
            } else if entry.refs == 0 {
                entry.released_at = Instant::now();
                Self::enforce_idle_cap(&mut entries);
            }
        } else if force_close {
            // Already removed from the pool (e.g. by force_release_all).
            handle.close();
        }
    }

    /// Closes every pooled handle for `path`, whatever its use count.
    ///
    /// Synchronous: when this returns, no IO can proceed on the old handles.
    /// Callers still holding references get [`PoolError::Closed`].
    pub fn force_release_all(&self, path: &Path) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| {
            if entry.file.path == path {
                entry.file.close();
                false
            } else {
                true
            }
        });
    }

    /// Closes handles that have been fully released for longer than
    /// [`POOLED_FILE_IDLE_TIMEOUT`].
    pub fn evict_idle(&self) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| {
            if entry.refs == 0 && entry.released_at.elapsed() > POOLED_FILE_IDLE_TIMEOUT {
                entry.file.close();
                false
            } else {
                true
            }
        });
    }

    /// Number of handles currently pooled, idle ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_idle_cap(entries: &mut Vec<PoolEntry>) {
        let idle = entries.iter().filter(|e| e.refs == 0).count();
        if idle <= MAX_IDLE_POOLED_FILES {
            return;
        }
        if let Some(pos) = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.refs == 0)
            .min_by_key(|(_, e)| e.released_at)
            .map(|(pos, _)| pos)
        {
            let entry = entries.remove(pos);
            entry.file.close();
        }
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new()
    }
}
