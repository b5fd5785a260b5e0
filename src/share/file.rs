use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, warn};

use crate::config::StorageConfig;
use crate::constants::CHUNK_SIZE;
use crate::hash::Hash;
use crate::persistence::FileRecord;
use crate::pool::OpenMode;

use super::chunk::Chunk;
use super::directory::Directory;
use super::entry::{CacheHooks, Entry, EntryRef};
use super::error::ShareError;

struct FileMeta {
    name: String,
    date_last_modified_ms: i64,
    complete: bool,
    chunks: Vec<Arc<Chunk>>,
}

struct WriteState {
    handle: Option<Arc<crate::pool::PooledFile>>,
    writers: u32,
}

struct ReadState {
    handle: Option<Arc<crate::pool::PooledFile>>,
    readers: u32,
}

/// A physical file in a shared tree.
///
/// A file is either complete or unfinished; an unfinished file's name ends
/// with the configured suffix and its chunks are still being filled by
/// downloads. Reader and writer access goes through scoped [`DataReader`]
/// and [`DataWriter`] guards: the first acquisition of each kind pulls a
/// handle from the [`FilePool`](crate::pool::FilePool), the last release
/// returns it.
///
/// Three locks guard a file, acquired in this order when nested: `meta`
/// (name, size, completion flag, chunk vector), then the write state, then
/// the read state. [`File::set_as_complete`] temporarily drops `meta` while
/// force-closing handles, which on some devices can block for seconds.
pub struct File {
    hooks: Weak<dyn CacheHooks>,
    dir: RwLock<Weak<Directory>>,
    size: AtomicU64,
    meta: Mutex<FileMeta>,
    write: Mutex<WriteState>,
    read: Mutex<ReadState>,
}

impl File {
    /// Creates a file entity inside `dir` and links it into the tree.
    ///
    /// `hashes` seeds the chunk hashes; it may be shorter than the chunk
    /// count, missing or null entries stay unknown. With `create_physically`
    /// the name gains the unfinished suffix (for a nonzero size) and a
    /// sparse file of the full size is allocated on disk.
    ///
    /// # Errors
    ///
    /// [`ShareError::UnableToCreateNewFile`] when the physical allocation
    /// fails or would drop the volume below the free-space floor; the
    /// entity is not linked into the tree in that case.
    pub fn new(
        dir: &Arc<Directory>,
        name: &str,
        size: u64,
        date_last_modified_ms: i64,
        hashes: &[Hash],
        create_physically: bool,
    ) -> Result<Arc<File>, ShareError> {
        let hooks_weak = dir.hooks();
        let hooks = hooks_weak.upgrade();
        let (suffix, minimum_free_space) = match &hooks {
            Some(h) => {
                let config = h.storage_config();
                (config.unfinished_suffix.clone(), config.minimum_free_space)
            }
            None => {
                let config = StorageConfig::default();
                (config.unfinished_suffix, config.minimum_free_space)
            }
        };

        let stored_name = if create_physically && size > 0 {
            format!("{name}{suffix}")
        } else {
            name.to_string()
        };
        let complete = !stored_name.ends_with(&suffix);

        let file = Arc::new(File {
            hooks: hooks_weak,
            dir: RwLock::new(Arc::downgrade(dir)),
            size: AtomicU64::new(size),
            meta: Mutex::new(FileMeta {
                name: stored_name,
                date_last_modified_ms,
                complete,
                chunks: Vec::new(),
            }),
            write: Mutex::new(WriteState {
                handle: None,
                writers: 0,
            }),
            read: Mutex::new(ReadState {
                handle: None,
                readers: 0,
            }),
        });

        debug!(path = %file.full_path().display(), size, create_physically, "new file");

        if create_physically {
            let path = file.full_path();
            let mtime = create_physical_file(&path, size, minimum_free_space)?;
            file.meta.lock().date_last_modified_ms = mtime;
        }

        let to_register = {
            let mut meta = file.meta.lock();
            seed_chunks(&file, &mut meta, size, hashes)
        };
        if let Some(h) = &hooks {
            for chunk in &to_register {
                h.chunk_hash_known(chunk);
            }
        }

        dir.add_file(file.clone());
        Ok(file)
    }

    fn hooks_arc(&self) -> Option<Arc<dyn CacheHooks>> {
        self.hooks.upgrade()
    }

    fn unfinished_suffix(&self) -> String {
        match self.hooks_arc() {
            Some(h) => h.storage_config().unfinished_suffix.clone(),
            None => StorageConfig::default().unfinished_suffix,
        }
    }

    /// The owning directory, while the file is attached to a tree.
    pub fn dir(&self) -> Option<Arc<Directory>> {
        self.dir.read().upgrade()
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Wall-clock modification time in milliseconds since the epoch.
    pub fn date_last_modified_ms(&self) -> i64 {
        self.meta.lock().date_last_modified_ms
    }

    /// A file is complete when every chunk is full and the unfinished
    /// suffix has been removed.
    pub fn is_complete(&self) -> bool {
        self.meta.lock().complete
    }

    /// Snapshot of the chunk vector.
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.meta.lock().chunks.clone()
    }

    pub fn chunk(&self, index: usize) -> Option<Arc<Chunk>> {
        self.meta.lock().chunks.get(index).cloned()
    }

    pub fn num_chunks(&self) -> usize {
        num_chunks(self.size())
    }

    pub fn full_path(&self) -> PathBuf {
        let name = self.name();
        match self.dir() {
            Some(dir) => dir.full_path().join(name),
            None => PathBuf::from(name),
        }
    }

    /// Directory part of the path relative to the shared root, `"/"` for a
    /// file sitting directly under it.
    pub fn relative_path(&self) -> String {
        match self.dir() {
            Some(dir) => dir.relative_path(),
            None => "/".to_string(),
        }
    }

    pub fn root_dir(&self) -> Option<Arc<Directory>> {
        self.dir()?.root_dir()
    }

    /// `true` when the size and (optionally) the modification date match
    /// the given on-disk metadata.
    pub fn corresponds_to(&self, size: u64, date_last_modified_ms: i64, check_date: bool) -> bool {
        self.size() == size
            && (!check_date || self.date_last_modified_ms() == date_last_modified_ms)
    }

    /// `true` when every chunk has a hash. A zero-byte file has none.
    pub fn has_all_hashes(&self) -> bool {
        if self.size() == 0 {
            return false;
        }
        self.meta.lock().chunks.iter().all(|c| c.has_hash())
    }

    pub fn has_one_or_more_hashes(&self) -> bool {
        self.meta.lock().chunks.iter().any(|c| c.has_hash())
    }

    /// Acquires a scoped writer; dropping it releases the slot.
    ///
    /// # Errors
    ///
    /// [`ShareError::UnableToOpenFileInWriteMode`] when the pool refuses,
    /// [`ShareError::FileReset`] when the open recreated a file that was
    /// expected to exist: all previously known bytes have been voided and
    /// the acquisition is rolled back so the caller can retry cleanly.
    pub fn data_writer(self: &Arc<Self>) -> Result<DataWriter, ShareError> {
        self.writer_acquired()?;
        Ok(DataWriter { file: self.clone() })
    }

    /// Acquires a scoped reader; dropping it releases the slot.
    ///
    /// # Errors
    ///
    /// [`ShareError::UnableToOpenFileInReadMode`] when the pool refuses.
    pub fn data_reader(self: &Arc<Self>) -> Result<DataReader, ShareError> {
        self.reader_acquired()?;
        Ok(DataReader { file: self.clone() })
    }

    fn writer_acquired(&self) -> Result<(), ShareError> {
        let hooks = self
            .hooks_arc()
            .ok_or_else(|| ShareError::Io(std::io::Error::other("storage cache is gone")))?;
        let pool = hooks.file_pool();
        let path = self.full_path();
        let size = self.size();
        let chunks = self.chunks();

        let mut write = self.write.lock();
        write.writers += 1;
        if write.writers > 1 {
            return Ok(());
        }

        let (handle, created) = match pool.open(&path, OpenMode::ReadWrite) {
            Ok(pair) => pair,
            Err(err) => {
                write.writers -= 1;
                return Err(ShareError::UnableToOpenFileInWriteMode(err));
            }
        };

        if created {
            if let Err(err) = handle.resize(size) {
                pool.release(&handle, true);
                write.writers -= 1;
                return Err(ShareError::UnableToOpenFileInWriteMode(err));
            }
            if let Err(err) = handle.with_file(mark_sparse) {
                warn!(path = %path.display(), %err, "could not mark the recreated file as sparse");
            }

            // The physical file vanished under us, e.g. an unfinished file
            // deleted between two sessions. Void all recorded progress.
            let mut reset = false;
            for chunk in &chunks {
                if chunk.known_bytes() != 0 {
                    chunk.set_known_bytes(0);
                    hooks.chunk_removed(chunk);
                    reset = true;
                }
            }
            if reset {
                write.writers -= 1;
                pool.release(&handle, false);
                return Err(ShareError::FileReset);
            }
        }

        write.handle = Some(handle);
        Ok(())
    }

    fn reader_acquired(&self) -> Result<(), ShareError> {
        let hooks = self
            .hooks_arc()
            .ok_or_else(|| ShareError::Io(std::io::Error::other("storage cache is gone")))?;
        let pool = hooks.file_pool();
        let path = self.full_path();

        let mut read = self.read.lock();
        read.readers += 1;
        if read.readers > 1 {
            return Ok(());
        }
        match pool.open(&path, OpenMode::ReadOnly) {
            Ok((handle, _)) => {
                read.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                read.readers -= 1;
                Err(ShareError::UnableToOpenFileInReadMode(err))
            }
        }
    }

    fn writer_released(&self) {
        let mut write = self.write.lock();
        if write.writers == 0 {
            return;
        }
        write.writers -= 1;
        if write.writers == 0 {
            if let (Some(handle), Some(hooks)) = (write.handle.take(), self.hooks_arc()) {
                hooks.file_pool().release(&handle, false);
            }
        }
    }

    fn reader_released(&self) {
        let mut read = self.read.lock();
        if read.readers == 0 {
            return;
        }
        read.readers -= 1;
        if read.readers == 0 {
            if let (Some(handle), Some(hooks)) = (read.handle.take(), self.hooks_arc()) {
                hooks.file_pool().release(&handle, false);
            }
        }
    }

    /// Writes `buf` at `offset`, returning the bytes written.
    ///
    /// Writing past the declared size is clipped; the file is never grown
    /// by a write. Requires an open writer.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<u64, ShareError> {
        let write = self.write.lock();
        let handle = write
            .handle
            .as_ref()
            .ok_or_else(|| ShareError::Io(std::io::Error::other("write handle is not open")))?;
        let size = self.size();
        if offset >= size {
            return Err(ShareError::Io(std::io::Error::other(
                "write offset beyond end of file",
            )));
        }
        let len = buf.len().min((size - offset) as usize);
        handle.write_at(offset, &buf[..len])?;
        Ok(len as u64)
    }

    /// Fills `buf` from `offset`, returning the bytes read.
    ///
    /// Reading at or past the end of file (or without an open reader)
    /// yields 0; short reads happen at end of file.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, ShareError> {
        let read = self.read.lock();
        let Some(handle) = read.handle.as_ref() else {
            return Ok(0);
        };
        if offset >= self.size() {
            return Ok(0);
        }
        Ok(handle.read_at(offset, buf)?)
    }

    /// Called by a chunk whose last byte just landed.
    ///
    /// Registers the chunk's hash and, when every chunk is complete, runs
    /// the unfinished→complete transition.
    pub fn chunk_complete(self: &Arc<Self>, chunk: &Arc<Chunk>) {
        let hooks = self.hooks_arc();
        let became_complete = {
            let mut meta = self.meta.lock();
            if chunk.has_hash() {
                if let Some(h) = &hooks {
                    h.chunk_hash_known(chunk);
                }
            }
            let all_complete =
                !meta.chunks.is_empty() && meta.chunks.iter().all(|c| c.is_complete());
            if all_complete {
                File::set_as_complete_locked(self, &mut meta)
            } else {
                false
            }
        };
        if became_complete {
            if let Some(h) = &hooks {
                h.entry_added(&EntryRef::File(self.clone()));
            }
        }
    }

    /// Marks the file as complete: removes the unfinished suffix both in
    /// memory and on disk and re-registers the entry.
    ///
    /// A rename failure (typically a file already carrying the target name)
    /// is logged and leaves the file unfinished; the caller may retry after
    /// resolving the clash.
    pub fn set_as_complete(self: &Arc<Self>) {
        let became_complete = {
            let mut meta = self.meta.lock();
            File::set_as_complete_locked(self, &mut meta)
        };
        if became_complete {
            if let Some(h) = self.hooks_arc() {
                h.entry_added(&EntryRef::File(self.clone()));
            }
        }
    }

    fn set_as_complete_locked(self: &Arc<Self>, meta: &mut MutexGuard<'_, FileMeta>) -> bool {
        let hooks = self.hooks_arc();
        let suffix = self.unfinished_suffix();
        if !meta.name.ends_with(&suffix) {
            return false;
        }

        let dir_path = match self.dir() {
            Some(dir) => dir.full_path(),
            None => PathBuf::new(),
        };
        let old_path = dir_path.join(&meta.name);
        debug!(path = %old_path.display(), "file set as complete");

        let accessors_active =
            self.write.lock().writers > 0 || self.read.lock().readers > 0;
        if accessors_active {
            if let Some(h) = &hooks {
                let pool = h.file_pool();
                // Closing handles can block for seconds on some devices
                // (external drives flushing on close); drop the metadata
                // lock so browsing stays responsive meanwhile.
                MutexGuard::unlocked(meta, || {
                    let mut write = self.write.lock();
                    let mut read = self.read.lock();
                    pool.force_release_all(&old_path);
                    write.handle = None;
                    read.handle = None;
                });
            }
        }

        // The name may have changed during the unlock window.
        if !meta.name.ends_with(&suffix) {
            return false;
        }
        let new_name = meta.name[..meta.name.len() - suffix.len()].to_string();
        let new_path = dir_path.join(&new_name);

        if new_path.exists() {
            error!(
                from = %old_path.display(),
                to = %new_path.display(),
                "unable to rename the completed file, target already exists"
            );
            return false;
        }
        if let Err(err) = std::fs::rename(&old_path, &new_path) {
            error!(
                from = %old_path.display(),
                to = %new_path.display(),
                %err,
                "unable to rename the completed file"
            );
            return false;
        }

        // Drop the suffixed name from the entry index while it is still
        // current; the caller re-adds the entry under the final name.
        if let Some(h) = &hooks {
            MutexGuard::unlocked(meta, || {
                h.entry_removed(&EntryRef::File(self.clone()));
            });
        }

        meta.complete = true;
        meta.date_last_modified_ms =
            mtime_ms(&new_path).unwrap_or(meta.date_last_modified_ms);
        meta.name = new_name;
        true
    }

    /// Puts a finished file back into the unfinished state for a
    /// re-download.
    ///
    /// The entry leaves the name index, the name regains the suffix, all
    /// chunks are discarded and re-seeded from `hashes`, and a fresh sparse
    /// file of `new_size` bytes is allocated. The previous physical file is
    /// left alone; it is only replaced by the next successful
    /// [`set_as_complete`](File::set_as_complete) rename.
    pub fn set_to_unfinished(
        self: &Arc<Self>,
        new_size: u64,
        hashes: &[Hash],
    ) -> Result<(), ShareError> {
        let hooks = self.hooks_arc();
        let (suffix, minimum_free_space) = match &hooks {
            Some(h) => {
                let config = h.storage_config();
                (config.unfinished_suffix.clone(), config.minimum_free_space)
            }
            None => {
                let config = StorageConfig::default();
                (config.unfinished_suffix, config.minimum_free_space)
            }
        };
        debug!(path = %self.full_path().display(), new_size, "set file to unfinished");

        if let Some(h) = &hooks {
            h.entry_removed(&EntryRef::File(self.clone()));
        }

        let mut meta = self.meta.lock();
        meta.complete = false;
        meta.name.push_str(&suffix);
        meta.date_last_modified_ms = now_ms();

        let old_size = self.size.swap(new_size, Ordering::SeqCst);
        if let Some(dir) = self.dir() {
            dir.file_size_changed(old_size, new_size);
        }

        let old_chunks = std::mem::take(&mut meta.chunks);
        for chunk in &old_chunks {
            chunk.file_deleted();
            if let Some(h) = &hooks {
                h.chunk_removed(chunk);
            }
        }

        let to_register = seed_chunks(self, &mut meta, new_size, hashes);
        if let Some(h) = &hooks {
            for chunk in &to_register {
                h.chunk_hash_known(chunk);
            }
        }

        let path = match self.dir() {
            Some(dir) => dir.full_path().join(&meta.name),
            None => PathBuf::from(&meta.name),
        };
        let mtime = create_physical_file(&path, new_size, minimum_free_space)?;
        meta.date_last_modified_ms = mtime;
        Ok(())
    }

    /// Restores chunk hashes and known bytes from a persisted record.
    ///
    /// Returns `true` only when the record matches on-disk reality: size,
    /// filename and chunk count must agree, and for finished files the
    /// modification date as well (unfinished files skip the date check
    /// because an active download keeps touching them). Restored chunks
    /// carrying a hash and at least one known byte re-enter the hash index.
    pub fn restore_from_record(&self, record: &FileRecord) -> bool {
        let to_register = {
            let meta = self.meta.lock();
            if record.size != self.size()
                || record.filename != meta.name
                || record.chunks.len() != meta.chunks.len()
            {
                return false;
            }
            if meta.complete && record.date_last_modified != meta.date_last_modified_ms {
                return false;
            }
            debug!(name = %meta.name, "restoring file from the hash cache");

            let mut to_register = Vec::new();
            for (chunk, rec) in meta.chunks.iter().zip(&record.chunks) {
                chunk.restore_from_record(rec);
                if chunk.has_hash() && chunk.known_bytes() > 0 {
                    to_register.push(chunk.clone());
                }
            }
            to_register
        };
        if let Some(h) = self.hooks_arc() {
            for chunk in &to_register {
                h.chunk_hash_known(chunk);
            }
        }
        true
    }

    /// Fills a persistence record from the current state.
    pub fn populate_record(&self) -> FileRecord {
        let meta = self.meta.lock();
        FileRecord {
            filename: meta.name.clone(),
            size: self.size(),
            date_last_modified: meta.date_last_modified_ms,
            chunks: meta.chunks.iter().map(|c| c.populate_record()).collect(),
            extra: Default::default(),
        }
    }

    /// Renames the file in memory and re-registers it in the entry index.
    pub fn rename(self: &Arc<Self>, new_name: &str) {
        let hooks = self.hooks_arc();
        if let Some(h) = &hooks {
            h.entry_removed(&EntryRef::File(self.clone()));
        }
        self.meta.lock().name = new_name.to_string();
        match self.dir() {
            Some(dir) => dir.file_name_changed(self),
            None => {
                if let Some(h) = &hooks {
                    h.entry_added(&EntryRef::File(self.clone()));
                }
            }
        }
    }

    /// Moves the file under another directory of the same cache.
    pub fn move_into(self: &Arc<Self>, dest: &Arc<Directory>) {
        if let Some(current) = self.dir() {
            if Arc::ptr_eq(&current, dest) {
                return;
            }
            current.file_deleted(self);
        }
        *self.dir.write() = Arc::downgrade(dest);
        dest.add_file(self.clone());
    }

    /// `true` if `dir` is this file's directory or one of its ancestors.
    pub fn has_parent_dir(&self, dir: &Arc<Directory>) -> bool {
        match self.dir() {
            Some(current) => Arc::ptr_eq(&current, dir) || current.is_child_of(dir),
            None => false,
        }
    }

    /// Physically removes the unfinished file, closing every handle first.
    /// Complete files are left alone.
    pub fn remove_unfinished_files(&self) {
        let meta = self.meta.lock();
        if meta.complete {
            return;
        }
        let path = match self.dir() {
            Some(dir) => dir.full_path().join(&meta.name),
            None => PathBuf::from(&meta.name),
        };
        if let Some(hooks) = self.hooks_arc() {
            let pool = hooks.file_pool();
            let mut write = self.write.lock();
            let mut read = self.read.lock();
            pool.force_release_all(&path);
            write.handle = None;
            read.handle = None;
        }
        if let Err(err) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), %err, "unable to delete an unfinished file");
        }
    }

    /// Removes the unfinished physical file and the entity itself when the
    /// file is not complete. Returns `true` when a deletion happened.
    pub fn delete_if_incomplete(self: &Arc<Self>) -> bool {
        if self.is_complete() {
            return false;
        }
        self.remove_unfinished_files();
        self.delete();
        true
    }

    /// Detaches the entity: unlinks it from its directory, orphans and
    /// unregisters every chunk, and force-releases both handles. The
    /// physical file is not touched.
    pub fn delete(self: &Arc<Self>) {
        debug!(name = %self.name(), "file deleted");
        if let Some(dir) = self.dir() {
            dir.file_deleted(self);
        }
        *self.dir.write() = Weak::new();

        let chunks = std::mem::take(&mut self.meta.lock().chunks);
        let hooks = self.hooks_arc();
        for chunk in &chunks {
            chunk.file_deleted();
            if let Some(h) = &hooks {
                h.chunk_removed(chunk);
            }
        }

        if let Some(h) = &hooks {
            let pool = h.file_pool();
            let mut write = self.write.lock();
            if let Some(handle) = write.handle.take() {
                pool.release(&handle, true);
            }
            write.writers = 0;
            let mut read = self.read.lock();
            if let Some(handle) = read.handle.take() {
                pool.release(&handle, true);
            }
            read.readers = 0;
        }
    }

    /// Projection handed to the hashing worker during initial indexing.
    pub fn as_hasher(self: &Arc<Self>) -> FileForHasher {
        FileForHasher { file: self.clone() }
    }
}

impl Entry for File {
    fn name(&self) -> String {
        File::name(self)
    }

    fn size(&self) -> u64 {
        File::size(self)
    }

    fn full_path(&self) -> PathBuf {
        File::full_path(self)
    }

    fn relative_path(&self) -> String {
        File::relative_path(self)
    }

    fn root_dir(&self) -> Option<Arc<Directory>> {
        File::root_dir(self)
    }
}

/// Scoped writer over a [`File`]; dropping it releases the writer slot.
pub struct DataWriter {
    file: Arc<File>,
}

impl DataWriter {
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<u64, ShareError> {
        self.file.write(buf, offset)
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl Drop for DataWriter {
    fn drop(&mut self) {
        self.file.writer_released();
    }
}

/// Scoped reader over a [`File`]; dropping it releases the reader slot.
pub struct DataReader {
    file: Arc<File>,
}

impl DataReader {
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, ShareError> {
        self.file.read(buf, offset)
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl Drop for DataReader {
    fn drop(&mut self) {
        self.file.reader_released();
    }
}

/// View of a [`File`] for the hash-computation worker.
///
/// Only the hasher mutates size and the chunk vector directly; everything
/// else goes through the regular `File` surface.
pub struct FileForHasher {
    file: Arc<File>,
}

impl FileForHasher {
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    /// Adjusts the size, propagating the change up the directory tree.
    pub fn set_size(&self, new_size: u64) {
        let old_size = self.file.size.swap(new_size, Ordering::SeqCst);
        if old_size != new_size {
            if let Some(dir) = self.file.dir() {
                dir.file_size_changed(old_size, new_size);
            }
        }
    }

    pub fn update_date_last_modified(&self, date_ms: i64) {
        self.file.meta.lock().date_last_modified_ms = date_ms;
    }

    /// Appends a freshly hashed chunk; complete hash-bearing chunks enter
    /// the hash index.
    pub fn add_chunk(&self, chunk: Arc<Chunk>) {
        let register = chunk.has_hash() && chunk.known_bytes() > 0;
        self.file.meta.lock().chunks.push(chunk.clone());
        if register {
            if let Some(h) = self.file.hooks_arc() {
                h.chunk_hash_known(&chunk);
            }
        }
    }

    /// Pops the last chunk, unregistering it from the hash index.
    pub fn remove_last_chunk(&self) -> Option<Arc<Chunk>> {
        let chunk = self.file.meta.lock().chunks.pop();
        if let Some(chunk) = &chunk {
            if let Some(h) = self.file.hooks_arc() {
                h.chunk_removed(chunk);
            }
        }
        chunk
    }
}

fn seed_chunks(
    file: &Arc<File>,
    meta: &mut MutexGuard<'_, FileMeta>,
    size: u64,
    hashes: &[Hash],
) -> Vec<Arc<Chunk>> {
    let complete = meta.complete;
    let count = num_chunks(size);
    let mut to_register = Vec::new();
    for index in 0..count {
        let capacity = chunk_capacity(size, index);
        let known = if complete { capacity } else { 0 };
        let hash = hashes.get(index).copied().filter(|h| !h.is_null());
        let chunk = Chunk::new(file, index, capacity, known, hash);
        if chunk.has_hash() {
            to_register.push(chunk.clone());
        }
        meta.chunks.push(chunk);
    }
    to_register
}

pub(crate) fn num_chunks(size: u64) -> usize {
    if size == 0 {
        0
    } else {
        size.div_ceil(CHUNK_SIZE) as usize
    }
}

pub(crate) fn chunk_capacity(size: u64, index: usize) -> u64 {
    if index + 1 == num_chunks(size) && size % CHUNK_SIZE != 0 {
        size % CHUNK_SIZE
    } else {
        CHUNK_SIZE
    }
}

/// Allocates a sparse file of `size` bytes at `path`.
///
/// Refused when the volume would drop below the free-space floor. Returns
/// the modification time of the created file.
fn create_physical_file(
    path: &Path,
    size: u64,
    minimum_free_space: u64,
) -> Result<i64, ShareError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        match fs2::available_space(parent) {
            Ok(available) => {
                if available < size.saturating_add(minimum_free_space) {
                    return Err(ShareError::UnableToCreateNewFile {
                        path: path.to_path_buf(),
                        reason: format!("insufficient free space, {available} bytes available"),
                    });
                }
            }
            Err(err) => {
                warn!(path = %parent.display(), %err, "could not determine the available space");
            }
        }
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| ShareError::UnableToCreateNewFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;

    if let Err(err) = mark_sparse(&file) {
        warn!(path = %path.display(), %err, "could not mark the file as sparse");
    }
    if let Err(err) = file.set_len(size) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(ShareError::UnableToCreateNewFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        });
    }

    mtime_ms(path).map_err(ShareError::Io)
}

/// Marks a file as sparse so extending it does not zero-fill the interior.
#[cfg(unix)]
fn mark_sparse(_file: &std::fs::File) -> std::io::Result<()> {
    // POSIX filesystems allocate sparsely by default.
    Ok(())
}

/// Marks a file as sparse so extending it does not zero-fill the interior.
#[cfg(not(unix))]
fn mark_sparse(_file: &std::fs::File) -> std::io::Result<()> {
    debug!("sparse marking is not available on this platform, the interior may be zero-filled");
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn mtime_ms(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0))
}
