//! Tuning parameters and protocol-level constants.
//!
//! Every peer on the network must agree on [`CHUNK_SIZE`]; the remaining
//! values only tune local resource usage.

use std::time::Duration;

// ============================================================================
// Chunks
// ============================================================================

/// Size of one chunk in bytes. A file of `n` bytes has `ceil(n / CHUNK_SIZE)`
/// chunks; the last chunk may be smaller.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

// ============================================================================
// File pool
// ============================================================================

/// How long a released handle may sit unused in the pool before
/// [`FilePool::evict_idle`](crate::pool::FilePool::evict_idle) closes it.
pub const POOLED_FILE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of fully released handles kept open for reuse. Beyond this
/// the least recently released handle is closed on the spot.
pub const MAX_IDLE_POOLED_FILES: usize = 32;

// ============================================================================
// Hash cache
// ============================================================================

/// On-disk hash cache format version. Records with a newer version are
/// rejected and the affected files are re-hashed.
pub const HASH_CACHE_VERSION: u32 = 1;

/// Suffix of the temporary file used for atomic hash cache writes.
pub const TEMP_FILE_SUFFIX: &str = ".tmp";
