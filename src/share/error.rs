use std::path::PathBuf;

use thiserror::Error;

use crate::pool::PoolError;

/// Errors from operations on shared entities.
#[derive(Debug, Error)]
pub enum ShareError {
    /// Physical allocation of a new unfinished file failed or was refused.
    #[error("unable to create new file {path}: {reason}")]
    UnableToCreateNewFile { path: PathBuf, reason: String },

    /// The pool could not provide a ReadOnly handle.
    #[error("unable to open file in read mode: {0}")]
    UnableToOpenFileInReadMode(#[source] PoolError),

    /// The pool could not provide a ReadWrite handle.
    #[error("unable to open file in write mode: {0}")]
    UnableToOpenFileInWriteMode(#[source] PoolError),

    /// Opening for write recreated the physical file from scratch; all
    /// previously known bytes have been voided.
    #[error("file was recreated from scratch, previously known bytes are void")]
    FileReset,

    /// Seek, read or write failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// IO through a pooled handle failed.
    #[error("io error on pooled handle: {0}")]
    Pool(#[from] PoolError),

    /// The chunk's owning file was deleted while the caller held a
    /// reference to the chunk.
    #[error("chunk's owning file has been deleted")]
    ChunkOrphaned,
}
