//! lanshare - storage core for a decentralized LAN file-sharing system
//!
//! Peers on a local network share directory trees and transfer files split
//! into fixed-size content-addressed chunks. This crate is the storage side
//! of such a peer: the entity graph (shared directories → directories →
//! files → chunks), the unfinished→complete rename protocol for in-progress
//! downloads, sparse file allocation, pooled file handles, hash indexing
//! and the persistent hash cache. Discovery, transfer scheduling and the
//! wire protocol are collaborators that call into this crate.
//!
//! # Modules
//!
//! - [`hash`] - 20-byte content identity
//! - [`pool`] - Pooled, reference-counted file handles
//! - [`share`] - Directories, files and chunks
//! - [`cache`] - Top-level registry, indices, search, events
//! - [`persistence`] - On-disk hash cache records
//! - [`config`] - Storage configuration
//! - [`constants`] - Chunk size and tuning parameters
//!
//! # Example
//!
//! ```no_run
//! use lanshare::cache::Cache;
//! use lanshare::config::StorageConfig;
//! use std::path::Path;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Cache::new(StorageConfig::default());
//!
//! // Start sharing a directory and restore hashes from a previous run.
//! let shared = cache.add_shared_directory(Path::new("/home/me/music"))?;
//! cache.load_hash_cache();
//!
//! // A peer asks for a chunk by hash.
//! if let Some(chunk) = cache.lookup_by_hash(&lanshare::hash::Hash::digest(b"...")) {
//!     let bytes = chunk.read(0, 64 * 1024)?;
//!     // ... send bytes to the peer
//! }
//!
//! println!("sharing {} bytes", shared.directory().size());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod hash;
pub mod persistence;
pub mod pool;
pub mod share;

pub use cache::{Cache, CacheEvent};
pub use config::StorageConfig;
pub use constants::CHUNK_SIZE;
pub use hash::{Hash, HashError};
pub use persistence::{
    ChunkRecord, DirRecord, FileRecord, HashCacheRecord, PersistenceError, SharedDirRecord,
};
pub use pool::{FilePool, OpenMode, PoolError, PooledFile};
pub use share::{
    CacheHooks, Chunk, DataReader, DataWriter, Directory, Entry, EntryRef, File, FileForHasher,
    ShareError, SharedDirectory,
};
