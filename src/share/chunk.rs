use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::constants::CHUNK_SIZE;
use crate::hash::Hash;
use crate::persistence::ChunkRecord;

use super::error::ShareError;
use super::file::File;

struct ChunkState {
    known_bytes: u64,
    hash: Option<Hash>,
}

/// One fixed-size span of a file, the unit the network layer addresses.
///
/// A chunk tracks how many of its bytes are known locally and, once
/// computed or restored, its content hash. The back-reference to the owning
/// file is weak; after the file is deleted every IO operation fails with
/// [`ShareError::ChunkOrphaned`].
pub struct Chunk {
    file: RwLock<Weak<File>>,
    index: usize,
    capacity: u64,
    state: Mutex<ChunkState>,
}

impl Chunk {
    /// Creates a chunk owned by `file` at position `index`.
    ///
    /// `capacity` is the chunk's span in bytes: [`CHUNK_SIZE`] except for a
    /// possibly smaller last chunk. A null `hash` is stored as absent.
    pub fn new(
        file: &Arc<File>,
        index: usize,
        capacity: u64,
        known_bytes: u64,
        hash: Option<Hash>,
    ) -> Arc<Chunk> {
        Arc::new(Chunk {
            file: RwLock::new(Arc::downgrade(file)),
            index,
            capacity,
            state: Mutex::new(ChunkState {
                known_bytes: known_bytes.min(capacity),
                hash: hash.filter(|h| !h.is_null()),
            }),
        })
    }

    /// 0-based position in the owning file.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Full span of this chunk in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of bytes known locally, `0 ..= capacity`.
    pub fn known_bytes(&self) -> u64 {
        self.state.lock().known_bytes
    }

    /// Updates the known-byte count, clamped to the chunk capacity.
    ///
    /// Not monotonic: the reset path puts a chunk back to zero. When the
    /// count reaches the capacity the owning file is notified, which may
    /// trigger the whole-file completion transition.
    pub fn set_known_bytes(self: &Arc<Self>, n: u64) {
        let became_complete = {
            let mut state = self.state.lock();
            let before = state.known_bytes;
            state.known_bytes = n.min(self.capacity);
            before != self.capacity && state.known_bytes == self.capacity
        };
        if became_complete {
            if let Some(file) = self.file() {
                file.chunk_complete(self);
            }
        }
    }

    pub fn hash(&self) -> Option<Hash> {
        self.state.lock().hash
    }

    pub fn has_hash(&self) -> bool {
        self.state.lock().hash.is_some()
    }

    /// Sets the content hash, computed by the hasher or given by a remote
    /// source. A null hash clears it.
    pub fn set_hash(&self, hash: Hash) {
        self.state.lock().hash = Some(hash).filter(|h| !h.is_null());
    }

    /// `true` once every byte of the chunk is known.
    pub fn is_complete(&self) -> bool {
        self.state.lock().known_bytes == self.capacity
    }

    /// The owning file, if it still exists.
    pub fn file(&self) -> Option<Arc<File>> {
        self.file.read().upgrade()
    }

    /// Severs the back-reference; subsequent IO fails with
    /// [`ShareError::ChunkOrphaned`].
    pub(crate) fn file_deleted(&self) {
        *self.file.write() = Weak::new();
    }

    /// Offset of this chunk within the owning file.
    pub fn file_offset(&self) -> u64 {
        self.index as u64 * CHUNK_SIZE
    }

    /// Reads up to `max_bytes` starting at a chunk-local offset.
    ///
    /// Reading at or past the chunk capacity yields empty bytes; reads are
    /// short at end of file.
    pub fn read(&self, offset_in_chunk: u64, max_bytes: usize) -> Result<Bytes, ShareError> {
        let file = self.file().ok_or(ShareError::ChunkOrphaned)?;
        if offset_in_chunk >= self.capacity {
            return Ok(Bytes::new());
        }
        let len = (self.capacity - offset_in_chunk).min(max_bytes as u64) as usize;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf, self.file_offset() + offset_in_chunk)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Writes `data` at a chunk-local offset, returning the bytes written.
    ///
    /// The write never spills into the next chunk. The known-byte count
    /// grows to cover the written range; reaching the capacity notifies the
    /// owning file.
    pub fn write(self: &Arc<Self>, data: &[u8], offset_in_chunk: u64) -> Result<u64, ShareError> {
        let file = self.file().ok_or(ShareError::ChunkOrphaned)?;
        if offset_in_chunk >= self.capacity {
            return Err(ShareError::Io(std::io::Error::other(
                "write offset outside the chunk",
            )));
        }
        let len = (self.capacity - offset_in_chunk).min(data.len() as u64) as usize;
        let written = file.write(&data[..len], self.file_offset() + offset_in_chunk)?;

        let became_complete = {
            let mut state = self.state.lock();
            let before = state.known_bytes;
            state.known_bytes = state
                .known_bytes
                .max(offset_in_chunk + written)
                .min(self.capacity);
            before != self.capacity && state.known_bytes == self.capacity
        };
        if became_complete {
            file.chunk_complete(self);
        }
        Ok(written)
    }

    /// Fills a persistence record from the current state.
    pub fn populate_record(&self) -> ChunkRecord {
        let state = self.state.lock();
        ChunkRecord {
            hash: state.hash,
            known_bytes: state.known_bytes,
        }
    }

    /// Restores hash and known-byte count from a persisted record.
    pub fn restore_from_record(&self, record: &ChunkRecord) {
        let mut state = self.state.lock();
        state.hash = record.hash.filter(|h| !h.is_null());
        state.known_bytes = record.known_bytes.min(self.capacity);
    }
}
