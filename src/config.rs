//! Storage configuration.
//!
//! Groups the tunables that collaborators may want to override. Everything
//! has a sensible default; `CHUNK_SIZE` is deliberately *not* here because it
//! is a network-wide compile-time agreement (see [`crate::constants`]).

use std::path::PathBuf;

/// Configuration for the storage core.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Suffix appended to the filename of an in-progress download.
    pub unfinished_suffix: String,
    /// Refuse to allocate a new unfinished file if the target volume would
    /// drop below this many free bytes.
    pub minimum_free_space: u64,
    /// Where the hash cache record is stored.
    pub hash_cache_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            unfinished_suffix: ".unfinished".to_string(),
            minimum_free_space: 50 * 1024 * 1024, // 50 MiB
            hash_cache_path: PathBuf::from("hash_cache.json"),
        }
    }
}

impl StorageConfig {
    /// Returns `true` if `name` carries the unfinished suffix.
    pub fn is_unfinished(&self, name: &str) -> bool {
        name.ends_with(&self.unfinished_suffix)
    }

    /// Strips the unfinished suffix from `name`, if present.
    pub fn without_suffix<'a>(&self, name: &'a str) -> &'a str {
        name.strip_suffix(&self.unfinished_suffix).unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_handling() {
        let config = StorageConfig::default();
        assert!(config.is_unfinished("movie.mkv.unfinished"));
        assert!(!config.is_unfinished("movie.mkv"));
        assert_eq!(config.without_suffix("movie.mkv.unfinished"), "movie.mkv");
        assert_eq!(config.without_suffix("movie.mkv"), "movie.mkv");
    }
}
