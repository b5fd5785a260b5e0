use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tempfile::TempDir;

use super::*;
use crate::config::StorageConfig;
use crate::constants::CHUNK_SIZE;
use crate::hash::Hash;
use crate::pool::FilePool;
use crate::share::file_mtime_ms;

/// Records every hook invocation so entity behavior can be asserted
/// without a full cache.
struct MockHooks {
    config: StorageConfig,
    pool: FilePool,
    known_hashes: Mutex<HashSet<Hash>>,
    added_entries: Mutex<Vec<String>>,
    removed_entries: Mutex<Vec<String>>,
}

impl MockHooks {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            config: StorageConfig {
                minimum_free_space: 0,
                ..Default::default()
            },
            pool: FilePool::new(),
            known_hashes: Mutex::new(HashSet::new()),
            added_entries: Mutex::new(Vec::new()),
            removed_entries: Mutex::new(Vec::new()),
        })
    }

    fn knows(&self, hash: &Hash) -> bool {
        self.known_hashes.lock().contains(hash)
    }
}

impl CacheHooks for MockHooks {
    fn storage_config(&self) -> &StorageConfig {
        &self.config
    }

    fn file_pool(&self) -> &FilePool {
        &self.pool
    }

    fn entry_added(&self, entry: &EntryRef) {
        self.added_entries.lock().push(entry.name());
    }

    fn entry_removed(&self, entry: &EntryRef) {
        self.removed_entries.lock().push(entry.name());
    }

    fn chunk_hash_known(&self, chunk: &Arc<Chunk>) {
        if let Some(hash) = chunk.hash() {
            self.known_hashes.lock().insert(hash);
        }
    }

    fn chunk_removed(&self, chunk: &Arc<Chunk>) {
        if let Some(hash) = chunk.hash() {
            self.known_hashes.lock().remove(&hash);
        }
    }
}

struct Fixture {
    _temp: TempDir,
    hooks: Arc<MockHooks>,
    root: Arc<Directory>,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let hooks = MockHooks::new();
    let weak: Weak<dyn CacheHooks> = {
        let arc: Arc<dyn CacheHooks> = hooks.clone();
        Arc::downgrade(&arc)
    };
    let root = Directory::new_root(weak, temp.path(), Hash::digest(b"root"));
    Fixture {
        _temp: temp,
        hooks,
        root,
    }
}

#[test]
fn created_file_is_unfinished_and_sparse_allocated() {
    let fx = fixture();
    let size = 3 * CHUNK_SIZE + 100;

    let file = File::new(&fx.root, "movie.mkv", size, 0, &[], true).unwrap();

    assert_eq!(file.name(), "movie.mkv.unfinished");
    assert!(!file.is_complete());
    assert_eq!(
        std::fs::metadata(fx.root.full_path().join("movie.mkv.unfinished"))
            .unwrap()
            .len(),
        size
    );

    let chunks = file.chunks();
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[3].capacity(), 100);
    for chunk in &chunks {
        assert_eq!(chunk.known_bytes(), 0);
        assert!(!chunk.has_hash());
    }
}

#[test]
fn zero_size_file_has_no_chunks() {
    let fx = fixture();
    let file = File::new(&fx.root, "empty.txt", 0, 0, &[], false).unwrap();
    assert!(file.chunks().is_empty());
    assert_eq!(file.num_chunks(), 0);
}

#[test]
fn chunk_capacities_cover_the_size() {
    let fx = fixture();
    let size = 2 * CHUNK_SIZE;
    let file = File::new(&fx.root, "aligned.bin", size, 0, &[], false).unwrap();
    let chunks = file.chunks();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.capacity() == CHUNK_SIZE));
    assert_eq!(chunks.iter().map(|c| c.capacity()).sum::<u64>(), size);
}

#[test]
fn completing_every_chunk_completes_the_file() {
    let fx = fixture();
    let size = 3 * CHUNK_SIZE + 100;
    let file = File::new(&fx.root, "movie.mkv", size, 0, &[], true).unwrap();

    let hashes: Vec<Hash> = (0..4u8)
        .map(|i| Hash::digest(&[i]))
        .collect();
    for (chunk, hash) in file.chunks().iter().zip(&hashes) {
        chunk.set_hash(*hash);
        chunk.set_known_bytes(chunk.capacity());
    }

    assert!(file.is_complete());
    assert_eq!(file.name(), "movie.mkv");
    let dir_path = fx.root.full_path();
    assert!(dir_path.join("movie.mkv").exists());
    assert!(!dir_path.join("movie.mkv.unfinished").exists());
    for hash in &hashes {
        assert!(fx.hooks.knows(hash));
    }
    // The completed file was re-registered under its final name.
    assert!(fx
        .hooks
        .added_entries
        .lock()
        .iter()
        .any(|n| n == "movie.mkv"));
}

#[test]
fn file_reset_when_the_physical_file_vanished() {
    let fx = fixture();
    let size = 3 * CHUNK_SIZE + 100;
    let file = File::new(&fx.root, "movie.mkv", size, 0, &[], true).unwrap();

    let hash = Hash::digest(b"chunk-0");
    let chunk = file.chunk(0).unwrap();
    chunk.set_hash(hash);
    chunk.set_known_bytes(CHUNK_SIZE);
    assert!(fx.hooks.knows(&hash));

    // The user deleted the unfinished file behind our back.
    std::fs::remove_file(file.full_path()).unwrap();

    let result = file.data_writer();
    assert!(matches!(result, Err(ShareError::FileReset)));
    assert_eq!(chunk.known_bytes(), 0);
    assert!(!fx.hooks.knows(&hash));

    // The acquisition was rolled back; a retry starts clean.
    let writer = file.data_writer().unwrap();
    drop(writer);
}

#[test]
fn set_to_unfinished_reseeds_chunks_and_keeps_the_old_file() {
    let fx = fixture();
    let dir_path = fx.root.full_path();
    let content = vec![7u8; 2000];
    std::fs::write(dir_path.join("song.mp3"), &content).unwrap();
    let mtime = file_mtime_ms(&dir_path.join("song.mp3")).unwrap();

    let file = File::new(&fx.root, "song.mp3", 2000, mtime, &[], false).unwrap();
    assert!(file.is_complete());

    let old_hash = Hash::digest(b"old");
    let chunk = file.chunk(0).unwrap();
    chunk.set_hash(old_hash);
    file.chunk_complete(&chunk);
    assert!(fx.hooks.knows(&old_hash));

    let new_hash = Hash::digest(b"new");
    file.set_to_unfinished(4000, &[new_hash]).unwrap();

    assert_eq!(file.name(), "song.mp3.unfinished");
    assert!(!file.is_complete());
    assert_eq!(file.size(), 4000);
    assert!(dir_path.join("song.mp3").exists());
    assert_eq!(
        std::fs::metadata(dir_path.join("song.mp3.unfinished"))
            .unwrap()
            .len(),
        4000
    );
    assert!(!fx.hooks.knows(&old_hash));
    assert!(fx.hooks.knows(&new_hash));
    let new_chunk = file.chunk(0).unwrap();
    assert_eq!(new_chunk.known_bytes(), 0);
    assert_eq!(new_chunk.hash(), Some(new_hash));
}

#[test]
fn rename_clash_leaves_the_file_unfinished_until_retried() {
    let fx = fixture();
    let dir_path = fx.root.full_path();
    let file = File::new(&fx.root, "clash.bin", 500, 0, &[], true).unwrap();

    // A file already carries the target name.
    std::fs::write(dir_path.join("clash.bin"), b"squatter").unwrap();

    file.chunk(0).unwrap().set_known_bytes(500);
    assert!(!file.is_complete());
    assert_eq!(file.name(), "clash.bin.unfinished");

    // Once the clash is resolved the transition goes through.
    std::fs::remove_file(dir_path.join("clash.bin")).unwrap();
    file.set_as_complete();
    assert!(file.is_complete());
    assert_eq!(file.name(), "clash.bin");
    assert!(dir_path.join("clash.bin").exists());
}

#[test]
fn write_and_read_round_trip() {
    let fx = fixture();
    let file = File::new(&fx.root, "data.bin", 100, 0, &[], true).unwrap();

    let writer = file.data_writer().unwrap();
    assert_eq!(writer.write(b"hello world", 10).unwrap(), 11);
    drop(writer);

    let reader = file.data_reader().unwrap();
    let mut buf = [0u8; 11];
    assert_eq!(reader.read(&mut buf, 10).unwrap(), 11);
    assert_eq!(&buf, b"hello world");
}

#[test]
fn writes_never_grow_the_file() {
    let fx = fixture();
    let file = File::new(&fx.root, "data.bin", 100, 0, &[], true).unwrap();

    let writer = file.data_writer().unwrap();
    // Only 5 bytes fit between offset 95 and the declared size.
    assert_eq!(writer.write(&[1u8; 64], 95).unwrap(), 5);
    assert!(matches!(
        writer.write(b"x", 100),
        Err(ShareError::Io(_))
    ));
    drop(writer);

    assert_eq!(std::fs::metadata(file.full_path()).unwrap().len(), 100);
}

#[test]
fn read_past_the_end_returns_zero() {
    let fx = fixture();
    std::fs::write(fx.root.full_path().join("small.txt"), b"abc").unwrap();
    let file = File::new(&fx.root, "small.txt", 3, 0, &[], false).unwrap();

    let reader = file.data_reader().unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(reader.read(&mut buf, 3).unwrap(), 0);
    assert_eq!(reader.read(&mut buf, 1000).unwrap(), 0);
}

#[test]
fn chunk_io_translates_offsets() {
    let fx = fixture();
    let size = CHUNK_SIZE + 500;
    let file = File::new(&fx.root, "two.bin", size, 0, &[], true).unwrap();

    let writer = file.data_writer().unwrap();
    let reader = file.data_reader().unwrap();

    let second = file.chunk(1).unwrap();
    assert_eq!(second.write(b"payload", 100).unwrap(), 7);
    assert_eq!(second.known_bytes(), 107);

    let bytes = second.read(100, 7).unwrap();
    assert_eq!(bytes.as_ref(), b"payload");

    // Chunk-local reads never cross into the next chunk.
    let first = file.chunk(0).unwrap();
    let tail = first.read(CHUNK_SIZE - 4, 100).unwrap();
    assert_eq!(tail.len(), 4);

    drop(writer);
    drop(reader);
}

#[test]
fn chunk_write_completing_the_chunk_notifies_the_file() {
    let fx = fixture();
    let file = File::new(&fx.root, "tiny.bin", 8, 0, &[], true).unwrap();
    let chunk = file.chunk(0).unwrap();
    chunk.set_hash(Hash::digest(b"tiny"));

    let writer = file.data_writer().unwrap();
    assert_eq!(chunk.write(&[9u8; 8], 0).unwrap(), 8);
    drop(writer);

    assert!(chunk.is_complete());
    assert!(file.is_complete());
    assert_eq!(file.name(), "tiny.bin");
}

#[test]
fn orphaned_chunk_fails_cleanly() {
    let fx = fixture();
    let file = File::new(&fx.root, "gone.bin", 100, 0, &[], true).unwrap();
    let chunk = file.chunk(0).unwrap();

    file.delete();

    assert!(matches!(
        chunk.read(0, 10),
        Err(ShareError::ChunkOrphaned)
    ));
    assert!(matches!(
        chunk.write(b"x", 0),
        Err(ShareError::ChunkOrphaned)
    ));
}

#[test]
fn concurrent_readers_on_a_complete_file() {
    let fx = fixture();
    let content = vec![42u8; 4096];
    std::fs::write(fx.root.full_path().join("shared.bin"), &content).unwrap();
    let file = File::new(&fx.root, "shared.bin", 4096, 0, &[], false).unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let file = file.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let reader = file.data_reader().expect("reader");
                let mut buf = [0u8; 256];
                let n = reader.read(&mut buf, 1024).expect("read");
                assert_eq!(n, 256);
                assert!(buf.iter().all(|&b| b == 42));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn releasing_the_last_accessor_returns_the_handle() {
    let fx = fixture();
    let file = File::new(&fx.root, "data.bin", 64, 0, &[], true).unwrap();

    let first = file.data_writer().unwrap();
    let second = file.data_writer().unwrap();
    drop(first);
    // Still one writer out; the handle must stay usable.
    assert_eq!(second.write(&[1u8; 8], 0).unwrap(), 8);
    drop(second);

    // The pooled handle is idle now and reused by the next writer.
    assert_eq!(fx.hooks.pool.len(), 1);
    let again = file.data_writer().unwrap();
    drop(again);
}

#[test]
fn delete_if_incomplete_removes_the_physical_file() {
    let fx = fixture();
    let file = File::new(&fx.root, "partial.bin", 256, 0, &[], true).unwrap();
    let path = file.full_path();
    assert!(path.exists());

    assert!(file.delete_if_incomplete());
    assert!(!path.exists());
    assert!(fx.root.files().is_empty());
}

#[test]
fn complete_files_survive_delete_if_incomplete() {
    let fx = fixture();
    std::fs::write(fx.root.full_path().join("keep.txt"), b"data").unwrap();
    let file = File::new(&fx.root, "keep.txt", 4, 0, &[], false).unwrap();

    assert!(!file.delete_if_incomplete());
    assert!(fx.root.full_path().join("keep.txt").exists());
    assert_eq!(fx.root.files().len(), 1);
}

#[test]
fn directory_sizes_track_children() {
    let fx = fixture();
    let sub_path = fx.root.full_path().join("sub");
    std::fs::create_dir(&sub_path).unwrap();
    let sub = Directory::new(&fx.root, "sub");

    File::new(&fx.root, "a.bin", 1000, 0, &[], true).unwrap();
    let b = File::new(&sub, "b.bin", 500, 0, &[], true).unwrap();

    assert_eq!(sub.size(), 500);
    assert_eq!(fx.root.size(), 1500);

    b.delete();
    assert_eq!(sub.size(), 0);
    assert_eq!(fx.root.size(), 1000);
}

#[test]
fn hasher_projection_resizes_through_the_tree() {
    let fx = fixture();
    let file = File::new(&fx.root, "grow.bin", 100, 0, &[], false).unwrap();
    assert_eq!(fx.root.size(), 100);

    let hasher = file.as_hasher();
    hasher.set_size(300);
    assert_eq!(file.size(), 300);
    assert_eq!(fx.root.size(), 300);

    let chunk = Chunk::new(&file, 0, 300, 300, Some(Hash::digest(b"h")));
    hasher.add_chunk(chunk.clone());
    assert!(fx.hooks.knows(&Hash::digest(b"h")));

    let popped = hasher.remove_last_chunk().unwrap();
    assert!(Arc::ptr_eq(&popped, &chunk));
    assert!(!fx.hooks.knows(&Hash::digest(b"h")));
}

#[test]
fn relative_paths_omit_the_shared_root_name() {
    let fx = fixture();
    std::fs::create_dir(fx.root.full_path().join("sub")).unwrap();
    let sub = Directory::new(&fx.root, "sub");

    let top = File::new(&fx.root, "top.txt", 0, 0, &[], false).unwrap();
    let nested = File::new(&sub, "nested.txt", 0, 0, &[], false).unwrap();

    assert_eq!(fx.root.relative_path(), "/");
    assert_eq!(top.relative_path(), "/");
    assert_eq!(sub.relative_path(), "/sub/");
    assert_eq!(nested.relative_path(), "/sub/");
    assert!(nested.has_parent_dir(&fx.root));
    assert!(sub.is_child_of(&fx.root));
    assert!(Arc::ptr_eq(&nested.root_dir().unwrap(), &fx.root));
}

#[test]
fn completion_flag_always_matches_the_suffix() {
    let fx = fixture();
    let unfinished = File::new(&fx.root, "a.bin", 100, 0, &[], true).unwrap();
    assert_eq!(
        unfinished.is_complete(),
        !unfinished.name().ends_with(".unfinished")
    );

    std::fs::write(fx.root.full_path().join("b.bin"), b"xx").unwrap();
    let complete = File::new(&fx.root, "b.bin", 2, 0, &[], false).unwrap();
    assert_eq!(
        complete.is_complete(),
        !complete.name().ends_with(".unfinished")
    );

    // A scanned leftover keeps its suffix and comes back incomplete.
    std::fs::write(fx.root.full_path().join("c.bin.unfinished"), b"xx").unwrap();
    let leftover = File::new(&fx.root, "c.bin.unfinished", 2, 0, &[], false).unwrap();
    assert!(!leftover.is_complete());
}

#[test]
fn restore_round_trip_at_the_file_level() {
    let fx = fixture();
    let dir_path = fx.root.full_path();
    std::fs::write(dir_path.join("stable.bin"), vec![1u8; 2048]).unwrap();
    let mtime = file_mtime_ms(&dir_path.join("stable.bin")).unwrap();

    let original = File::new(&fx.root, "stable.bin", 2048, mtime, &[], false).unwrap();
    original.chunk(0).unwrap().set_hash(Hash::digest(b"stable"));
    let record = original.populate_record();

    // A fresh scan of the same on-disk state.
    let rescanned = File::new(&fx.root, "stable.bin", 2048, mtime, &[], false).unwrap();
    assert!(rescanned.restore_from_record(&record));
    assert_eq!(
        rescanned.chunk(0).unwrap().hash(),
        Some(Hash::digest(b"stable"))
    );
    assert_eq!(rescanned.chunk(0).unwrap().known_bytes(), 2048);
    assert!(fx.hooks.knows(&Hash::digest(b"stable")));
}

#[test]
fn restore_rejects_mismatches() {
    let fx = fixture();
    let dir_path = fx.root.full_path();
    std::fs::write(dir_path.join("f.bin"), vec![1u8; 100]).unwrap();
    let mtime = file_mtime_ms(&dir_path.join("f.bin")).unwrap();
    let file = File::new(&fx.root, "f.bin", 100, mtime, &[], false).unwrap();

    let mut record = file.populate_record();
    record.size = 101;
    assert!(!file.restore_from_record(&record));

    let mut record = file.populate_record();
    record.filename = "other.bin".to_string();
    assert!(!file.restore_from_record(&record));

    // A finished file must also match on the date.
    let mut record = file.populate_record();
    record.date_last_modified += 1;
    assert!(!file.restore_from_record(&record));

    let record = file.populate_record();
    assert!(file.restore_from_record(&record));
}

#[test]
fn moving_a_file_updates_both_directories() {
    let fx = fixture();
    std::fs::create_dir(fx.root.full_path().join("dest")).unwrap();
    let dest = Directory::new(&fx.root, "dest");
    let file = File::new(&fx.root, "moved.bin", 700, 0, &[], true).unwrap();
    assert_eq!(fx.root.size(), 700);

    file.move_into(&dest);

    assert!(fx.root.find_file("moved.bin.unfinished").is_none());
    assert!(dest.find_file("moved.bin.unfinished").is_some());
    assert_eq!(dest.size(), 700);
    assert_eq!(fx.root.size(), 700);
    assert!(Arc::ptr_eq(&file.dir().unwrap(), &dest));
}

#[test]
fn free_space_floor_refuses_the_allocation() {
    let temp = TempDir::new().unwrap();
    let hooks = Arc::new(MockHooks {
        config: StorageConfig {
            minimum_free_space: u64::MAX,
            ..Default::default()
        },
        pool: FilePool::new(),
        known_hashes: Mutex::new(HashSet::new()),
        added_entries: Mutex::new(Vec::new()),
        removed_entries: Mutex::new(Vec::new()),
    });
    let weak: Weak<dyn CacheHooks> = {
        let arc: Arc<dyn CacheHooks> = hooks.clone();
        Arc::downgrade(&arc)
    };
    let root = Directory::new_root(weak, temp.path(), Hash::digest(b"root"));

    let result = File::new(&root, "huge.bin", 1024, 0, &[], true);
    assert!(matches!(
        result,
        Err(ShareError::UnableToCreateNewFile { .. })
    ));
    assert!(root.files().is_empty());
    assert!(!temp.path().join("huge.bin.unfinished").exists());
}

#[test]
fn full_path_assembles_through_the_tree() {
    let fx = fixture();
    std::fs::create_dir(fx.root.full_path().join("sub")).unwrap();
    let sub = Directory::new(&fx.root, "sub");
    let file = File::new(&sub, "deep.txt", 0, 0, &[], false).unwrap();

    let expected: &Path = &fx.root.full_path().join("sub").join("deep.txt");
    assert_eq!(file.full_path(), expected);
}
