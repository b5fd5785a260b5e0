use std::path::PathBuf;

use crate::hash::Hash;

/// A mutation observed on the cache.
///
/// Events are enqueued synchronously from inside the mutating operation;
/// receivers drain them on their own threads and must not call back into
/// the cache from a mutating path.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A file or directory entered the tree or took a new name.
    EntryAdded { name: String, path: String },
    /// A file or directory left the tree or lost its current name.
    EntryRemoved { name: String, path: String },
    /// A chunk with the given hash became reachable through the index.
    ChunkHashKnown { hash: Hash },
    /// A chunk with the given hash left the index.
    ChunkRemoved { hash: Hash },
    /// A new shared directory is being served.
    SharedDirectoryAdded { id: Hash, path: PathBuf },
    /// A shared directory was removed along with its whole subtree.
    SharedDirectoryRemoved { id: Hash },
}
