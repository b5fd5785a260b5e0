use std::path::PathBuf;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::pool::FilePool;

use super::chunk::Chunk;
use super::directory::Directory;
use super::file::File;

/// Common surface of files and directories.
pub trait Entry {
    /// Path component of this entry. Unfinished files keep their suffix.
    fn name(&self) -> String;

    /// Byte size; for directories, the sum of all children.
    fn size(&self) -> u64;

    /// Absolute on-disk path.
    fn full_path(&self) -> PathBuf;

    /// Path relative to the enclosing shared directory, `/`-separated.
    ///
    /// An entry sitting directly under a shared root reports `"/"`; the
    /// root's own name never appears in relative paths.
    fn relative_path(&self) -> String;

    /// The enclosing shared root, if the entry is still attached to one.
    fn root_dir(&self) -> Option<Arc<Directory>>;
}

/// A strong reference to either kind of entry.
#[derive(Clone)]
pub enum EntryRef {
    File(Arc<File>),
    Directory(Arc<Directory>),
}

impl EntryRef {
    pub fn name(&self) -> String {
        match self {
            EntryRef::File(f) => f.name(),
            EntryRef::Directory(d) => d.name(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            EntryRef::File(f) => f.size(),
            EntryRef::Directory(d) => d.size(),
        }
    }

    pub fn full_path(&self) -> PathBuf {
        match self {
            EntryRef::File(f) => f.full_path(),
            EntryRef::Directory(d) => d.full_path(),
        }
    }

    pub fn relative_path(&self) -> String {
        match self {
            EntryRef::File(f) => f.relative_path(),
            EntryRef::Directory(d) => d.relative_path(),
        }
    }

    pub fn as_file(&self) -> Option<&Arc<File>> {
        match self {
            EntryRef::File(f) => Some(f),
            EntryRef::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&Arc<Directory>> {
        match self {
            EntryRef::Directory(d) => Some(d),
            EntryRef::File(_) => None,
        }
    }
}

/// Capability set the cache exposes to the entities it owns.
///
/// Entities hold this as `Weak<dyn CacheHooks>`; a dead reference simply
/// mutes notifications. Implementations must not call back into the
/// mutating entity from these methods.
pub trait CacheHooks: Send + Sync {
    /// Storage configuration shared by every entity.
    fn storage_config(&self) -> &StorageConfig;

    /// The process-wide file handle pool.
    fn file_pool(&self) -> &FilePool;

    /// A new entry exists or an existing one got a new name.
    fn entry_added(&self, entry: &EntryRef);

    /// An entry is about to disappear or lose its current name.
    fn entry_removed(&self, entry: &EntryRef);

    /// `chunk` carries a hash worth indexing.
    fn chunk_hash_known(&self, chunk: &Arc<Chunk>);

    /// `chunk` must no longer be reachable through the hash index.
    fn chunk_removed(&self, chunk: &Arc<Chunk>);
}
