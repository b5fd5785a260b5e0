//! Shared entities: directories, files and chunks.
//!
//! This module holds the in-memory tree of everything a peer shares. A
//! [`Directory`] owns subdirectories and [`File`]s; a `File` owns an ordered
//! vector of [`Chunk`]s, each spanning [`CHUNK_SIZE`](crate::constants::CHUNK_SIZE)
//! bytes except possibly the last. Files move between two states:
//!
//! - **unfinished**: the on-disk name carries a configured suffix and not
//!   every chunk has all of its bytes; downloads write into it.
//! - **complete**: every chunk is full; the suffix has been removed from
//!   the name both in memory and on disk.
//!
//! The transition runs through [`File::set_as_complete`], which renames the
//! physical file and re-registers the entry. The reverse transition,
//! [`File::set_to_unfinished`], re-seeds the chunk vector and allocates a
//! fresh sparse file for a re-download.
//!
//! Entities report index-relevant changes through the [`CacheHooks`]
//! capability set, implemented by [`Cache`](crate::cache::Cache) and held as
//! a non-owning reference. Parents own children; every back-pointer
//! (file→directory, chunk→file, entity→cache) is weak.

mod chunk;
mod directory;
mod entry;
mod error;
mod file;

pub use chunk::Chunk;
pub use directory::{Directory, SharedDirectory};
pub use entry::{CacheHooks, Entry, EntryRef};
pub use error::ShareError;
pub use file::{DataReader, DataWriter, File, FileForHasher};

pub(crate) use file::mtime_ms as file_mtime_ms;

#[cfg(test)]
mod tests;
