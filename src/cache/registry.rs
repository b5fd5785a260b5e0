use std::path::Path;
use std::sync::{Arc, Weak};

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::hash::Hash;
use crate::persistence::{
    self, DirRecord, HashCacheRecord, PersistenceError, SharedDirRecord,
};
use crate::pool::FilePool;
use crate::share::{
    CacheHooks, Chunk, Directory, EntryRef, File, ShareError, SharedDirectory,
};

use super::events::CacheEvent;

enum WeakEntryRef {
    File(Weak<File>),
    Directory(Weak<Directory>),
}

impl WeakEntryRef {
    fn from_entry(entry: &EntryRef) -> Self {
        match entry {
            EntryRef::File(f) => WeakEntryRef::File(Arc::downgrade(f)),
            EntryRef::Directory(d) => WeakEntryRef::Directory(Arc::downgrade(d)),
        }
    }

    fn upgrade(&self) -> Option<EntryRef> {
        match self {
            WeakEntryRef::File(w) => w.upgrade().map(EntryRef::File),
            WeakEntryRef::Directory(w) => w.upgrade().map(EntryRef::Directory),
        }
    }

    fn is(&self, entry: &EntryRef) -> bool {
        match (self, entry) {
            (WeakEntryRef::File(w), EntryRef::File(a)) => {
                std::ptr::eq(w.as_ptr(), Arc::as_ptr(a))
            }
            (WeakEntryRef::Directory(w), EntryRef::Directory(a)) => {
                std::ptr::eq(w.as_ptr(), Arc::as_ptr(a))
            }
            _ => false,
        }
    }
}

/// Top-level registry of everything shared.
///
/// Owns the shared-directory roots and the file pool, and maintains two
/// indices: hash → chunk (weak, lazily pruned) and normalized name →
/// entries. Cross-file mutations such as moving entries or adding and
/// removing roots serialize on an internal topology lock; the indices themselves
/// are sharded and may be read concurrently with mutation.
pub struct Cache {
    config: StorageConfig,
    pool: FilePool,
    topology: Mutex<()>,
    roots: RwLock<Vec<Arc<Directory>>>,
    chunks_by_hash: DashMap<Hash, Weak<Chunk>>,
    entries_by_name: DashMap<String, Vec<WeakEntryRef>>,
    subscribers: Mutex<Vec<Sender<CacheEvent>>>,
}

impl Cache {
    pub fn new(config: StorageConfig) -> Arc<Cache> {
        Arc::new(Cache {
            config,
            pool: FilePool::new(),
            topology: Mutex::new(()),
            roots: RwLock::new(Vec::new()),
            chunks_by_hash: DashMap::new(),
            entries_by_name: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn file_pool(&self) -> &FilePool {
        &self.pool
    }

    fn hooks_weak(self: &Arc<Self>) -> Weak<dyn CacheHooks> {
        let hooks: Arc<dyn CacheHooks> = self.clone();
        Arc::downgrade(&hooks)
    }

    /// Scans `path` and starts sharing it.
    ///
    /// The whole tree is walked, building directory and file entities;
    /// files are created without hashes (the hasher fills them in later)
    /// and on-disk unfinished leftovers come back as incomplete files with
    /// zero known bytes. Scanning an already shared path returns the
    /// existing root.
    pub fn add_shared_directory(
        self: &Arc<Self>,
        path: &Path,
    ) -> Result<SharedDirectory, ShareError> {
        let _topology = self.topology.lock();

        if let Some(existing) = self
            .roots
            .read()
            .iter()
            .find(|r| r.share_path() == Some(path))
        {
            return Ok(SharedDirectory::new(existing.clone()));
        }

        let id = Hash::random();
        let root = Directory::new_root(self.hooks_weak(), path, id);
        scan_into(&root, path)?;
        self.roots.write().push(root.clone());

        self.emit(CacheEvent::SharedDirectoryAdded {
            id,
            path: path.to_path_buf(),
        });
        Ok(SharedDirectory::new(root))
    }

    /// Stops sharing the directory with the given id, tearing its subtree
    /// down: unfinished physical files are deleted, chunks leave the hash
    /// index, handles are force-released.
    pub fn remove_shared_directory(&self, id: &Hash) -> bool {
        let _topology = self.topology.lock();

        let root = {
            let mut roots = self.roots.write();
            match roots.iter().position(|r| r.id() == Some(*id)) {
                Some(pos) => roots.remove(pos),
                None => return false,
            }
        };
        root.delete_recursive();
        self.emit(CacheEvent::SharedDirectoryRemoved { id: *id });
        true
    }

    /// The currently shared roots.
    pub fn shared_directories(&self) -> Vec<SharedDirectory> {
        self.roots
            .read()
            .iter()
            .cloned()
            .map(SharedDirectory::new)
            .collect()
    }

    /// Resolves a chunk by its content hash.
    ///
    /// Dead index entries (the owning file has been deleted) are pruned on
    /// the way.
    pub fn lookup_by_hash(&self, hash: &Hash) -> Option<Arc<Chunk>> {
        let found = self
            .chunks_by_hash
            .get(hash)
            .and_then(|entry| entry.value().upgrade());
        if found.is_none() {
            self.chunks_by_hash
                .remove_if(hash, |_, weak| weak.upgrade().is_none());
        }
        found
    }

    /// Entries whose normalized name contains every whitespace-separated
    /// token of `query`.
    pub fn search(&self, query: &str) -> Vec<EntryRef> {
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(normalize)
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut results = Vec::new();
        for entry in self.entries_by_name.iter() {
            if tokens.iter().all(|t| entry.key().contains(t.as_str())) {
                results.extend(entry.value().iter().filter_map(WeakEntryRef::upgrade));
            }
        }
        results
    }

    /// Moves `file` under `dest`, which must belong to this cache.
    pub fn move_file(&self, file: &Arc<File>, dest: &Arc<Directory>) {
        let _topology = self.topology.lock();
        file.move_into(dest);
    }

    /// Subscribes to the event stream. Every subscriber sees every event
    /// emitted after the call; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<CacheEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: CacheEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Writes the hash cache for every shared directory to the configured
    /// path, atomically.
    pub fn save_hash_cache(&self) -> Result<(), PersistenceError> {
        let mut record = HashCacheRecord::new();
        for root in self.roots.read().iter() {
            let Some(id) = root.id() else { continue };
            let path = root
                .share_path()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            record.shared_dirs.push(SharedDirRecord {
                id,
                path,
                root: build_dir_record(root),
            });
        }
        persistence::write_record(&self.config.hash_cache_path, &record)
    }

    /// Loads the hash cache written by a previous run and restores chunk
    /// state into the already scanned tree.
    ///
    /// Any failure is logged and swallowed: the worst case is re-hashing.
    pub fn load_hash_cache(&self) {
        match persistence::read_record(&self.config.hash_cache_path) {
            Ok(record) => self.restore_from_record(&record),
            Err(err) => {
                warn!(%err, "could not load the hash cache, files will be re-hashed");
            }
        }
    }

    /// Restores chunk state from `record` into the scanned tree.
    ///
    /// Shared directories are matched by mount path and re-adopt their
    /// persisted id; files that fail the match rules are skipped and will
    /// be re-hashed.
    pub fn restore_from_record(&self, record: &HashCacheRecord) {
        for shared in &record.shared_dirs {
            let root = self
                .roots
                .read()
                .iter()
                .find(|r| r.share_path() == Some(Path::new(&shared.path)))
                .cloned();
            match root {
                Some(root) => {
                    root.set_id(shared.id);
                    restore_dir(&root, &shared.root);
                }
                None => {
                    debug!(path = %shared.path, "hash cache entry for a directory no longer shared");
                }
            }
        }
    }
}

impl CacheHooks for Cache {
    fn storage_config(&self) -> &StorageConfig {
        &self.config
    }

    fn file_pool(&self) -> &FilePool {
        &self.pool
    }

    fn entry_added(&self, entry: &EntryRef) {
        let name = entry.name();
        self.entries_by_name
            .entry(normalize(&name))
            .or_default()
            .push(WeakEntryRef::from_entry(entry));
        self.emit(CacheEvent::EntryAdded {
            name,
            path: entry.relative_path(),
        });
    }

    fn entry_removed(&self, entry: &EntryRef) {
        let name = entry.name();
        let key = normalize(&name);
        if let Some(mut slot) = self.entries_by_name.get_mut(&key) {
            slot.value_mut()
                .retain(|weak| !weak.is(entry) && weak.upgrade().is_some());
        }
        self.entries_by_name.remove_if(&key, |_, v| v.is_empty());
        self.emit(CacheEvent::EntryRemoved {
            name,
            path: entry.relative_path(),
        });
    }

    fn chunk_hash_known(&self, chunk: &Arc<Chunk>) {
        let Some(hash) = chunk.hash() else { return };
        self.chunks_by_hash.insert(hash, Arc::downgrade(chunk));
        self.emit(CacheEvent::ChunkHashKnown { hash });
    }

    fn chunk_removed(&self, chunk: &Arc<Chunk>) {
        let Some(hash) = chunk.hash() else { return };
        self.chunks_by_hash.remove_if(&hash, |_, weak| {
            weak.upgrade().map_or(true, |c| Arc::ptr_eq(&c, chunk))
        });
        self.emit(CacheEvent::ChunkRemoved { hash });
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
}

fn scan_into(dir: &Arc<Directory>, path: &Path) -> Result<(), ShareError> {
    let mut entries: Vec<_> = std::fs::read_dir(path)?
        .filter_map(Result::ok)
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(err) => {
                warn!(path = %entry.path().display(), %err, "skipping unreadable entry");
                continue;
            }
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            let sub = Directory::new(dir, &name);
            scan_into(&sub, &entry.path())?;
        } else if file_type.is_file() {
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %entry.path().display(), %err, "skipping unreadable file");
                    continue;
                }
            };
            let mtime = crate::share::file_mtime_ms(&entry.path()).unwrap_or(0);
            File::new(dir, &name, metadata.len(), mtime, &[], false)?;
        }
    }
    Ok(())
}

fn build_dir_record(dir: &Arc<Directory>) -> DirRecord {
    DirRecord {
        name: dir.name(),
        dirs: dir.subdirs().iter().map(build_dir_record).collect(),
        files: dir.files().iter().map(|f| f.populate_record()).collect(),
    }
}

fn restore_dir(dir: &Arc<Directory>, record: &DirRecord) {
    for file_record in &record.files {
        match dir.find_file(&file_record.filename) {
            Some(file) => {
                if !file.restore_from_record(file_record) {
                    debug!(name = %file_record.filename, "hash cache mismatch, file will be re-hashed");
                }
            }
            None => {
                debug!(name = %file_record.filename, "hash cache entry for a vanished file");
            }
        }
    }
    for dir_record in &record.dirs {
        if let Some(sub) = dir.find_subdir(&dir_record.name) {
            restore_dir(&sub, dir_record);
        }
    }
}
