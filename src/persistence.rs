//! On-disk hash cache.
//!
//! Persists per-file chunk hashes and known-byte counts so a restart can
//! skip re-hashing unchanged files. One record per shared directory, keyed
//! by its stable id, all collected in a single JSON document written
//! atomically (temp file + rename).
//!
//! The format is forward compatible: unknown fields are ignored on load,
//! and file records carry them through a round-trip. Failing to load is
//! never fatal to the caller: the affected files are simply re-hashed.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::constants::{HASH_CACHE_VERSION, TEMP_FILE_SUFFIX};
use crate::hash::Hash;

/// Errors from reading or writing the hash cache.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed hash cache: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The record was written by a newer version of the software.
    #[error("unsupported hash cache version {0}")]
    UnsupportedVersion(u32),
}

/// Persisted state of one chunk: its hash, if ever computed, and how many
/// of its bytes were known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
    #[serde(default)]
    pub known_bytes: u64,
}

/// Persisted state of one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub size: u64,
    /// Milliseconds since the epoch.
    pub date_last_modified: i64,
    #[serde(default)]
    pub chunks: Vec<ChunkRecord>,
    /// Fields written by other versions, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Persisted state of one directory subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirRecord {
    pub name: String,
    #[serde(default)]
    pub dirs: Vec<DirRecord>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

/// Persisted state of one shared directory, keyed by its stable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDirRecord {
    pub id: Hash,
    pub path: String,
    pub root: DirRecord,
}

/// The whole hash cache document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashCacheRecord {
    pub version: u32,
    #[serde(default)]
    pub shared_dirs: Vec<SharedDirRecord>,
    /// Fields written by other versions, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HashCacheRecord {
    pub fn new() -> Self {
        Self {
            version: HASH_CACHE_VERSION,
            shared_dirs: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Default for HashCacheRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `record` to `path` atomically: the document lands in a temporary
/// sibling first and is renamed over the target.
pub fn write_record(path: &Path, record: &HashCacheRecord) -> Result<(), PersistenceError> {
    let data = serde_json::to_vec_pretty(record)?;

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(TEMP_FILE_SUFFIX);
    let temp_path = Path::new(&temp_name);

    std::fs::write(temp_path, &data)?;
    if let Err(err) = std::fs::rename(temp_path, path) {
        let _ = std::fs::remove_file(temp_path);
        return Err(err.into());
    }
    debug!(path = %path.display(), dirs = record.shared_dirs.len(), "hash cache written");
    Ok(())
}

/// Reads a record back from `path`.
///
/// # Errors
///
/// IO and parse failures, plus [`PersistenceError::UnsupportedVersion`] for
/// records written by a newer format.
pub fn read_record(path: &Path) -> Result<HashCacheRecord, PersistenceError> {
    let data = std::fs::read(path)?;
    let record: HashCacheRecord = serde_json::from_slice(&data)?;
    if record.version > HASH_CACHE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(record.version));
    }
    Ok(record)
}
