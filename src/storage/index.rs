//! Fragment index - process-wide mapping of fragment id to absolute path
//!
//! Populated at startup by scanning each storage path's remote directory,
//! mutated by download/delete commands. Lookup is the only hot-path
//! operation; writes are rare and serialized under the mutex.

use super::StorageError;
use crate::config::StoragePathConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Subdirectory under each configured storage path that holds fragments.
/// File names inside it are fragment ids.
pub const REMOTE_DIR: &str = "p2p-node-remote";

/// Shared fragment id -> absolute path mapping
pub struct FragmentIndex {
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl FragmentIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build the index by scanning every configured storage path.
    ///
    /// Creates the remote directory when absent and refuses paths that share
    /// a filesystem mount.
    pub fn scan(paths: &[StoragePathConfig]) -> Result<Self, StorageError> {
        super::probe::ensure_distinct_mounts(paths)?;

        let mut entries = HashMap::new();
        for entry in paths {
            let remote = remote_dir(&entry.path);
            std::fs::create_dir_all(&remote)?;

            for dirent in std::fs::read_dir(&remote)? {
                let dirent = dirent?;
                if !dirent.file_type()?.is_file() {
                    continue;
                }
                let Some(name) = dirent.file_name().to_str().map(str::to_owned) else {
                    tracing::warn!(path = %dirent.path().display(), "skipping non-UTF8 fragment name");
                    continue;
                };
                entries.insert(name, dirent.path());
            }
        }

        tracing::info!(fragments = entries.len(), "fragment index built");
        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    /// Resolve a fragment id to its absolute path
    pub fn resolve(&self, fragment_id: &str) -> Option<PathBuf> {
        self.entries.lock().unwrap().get(fragment_id).cloned()
    }

    /// Register a fragment after a successful download
    pub fn insert(&self, fragment_id: String, path: PathBuf) {
        self.entries.lock().unwrap().insert(fragment_id, path);
    }

    /// Remove a fragment from the index, returning its path
    pub fn remove(&self, fragment_id: &str) -> Option<PathBuf> {
        self.entries.lock().unwrap().remove(fragment_id)
    }

    /// Snapshot of all entries, sorted by id for stable reporting
    pub fn snapshot(&self) -> Vec<(String, PathBuf)> {
        let mut all: Vec<(String, PathBuf)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, path)| (id.clone(), path.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for FragmentIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// The remote directory for a configured storage path
pub fn remote_dir(storage_path: &Path) -> PathBuf {
    storage_path.join(REMOTE_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Vec<StoragePathConfig> {
        vec![StoragePathConfig {
            path: dir.path().to_path_buf(),
            threshold: 100,
        }]
    }

    #[test]
    fn test_scan_creates_remote_dir() {
        let dir = TempDir::new().unwrap();
        let index = FragmentIndex::scan(&config_for(&dir)).unwrap();

        assert!(index.is_empty());
        assert!(remote_dir(dir.path()).is_dir());
    }

    #[test]
    fn test_scan_picks_up_existing_fragments() {
        let dir = TempDir::new().unwrap();
        let remote = remote_dir(dir.path());
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::write(remote.join("frag-001"), b"data").unwrap();
        std::fs::write(remote.join("frag-002"), b"more").unwrap();
        // Subdirectories are not fragments
        std::fs::create_dir(remote.join("not-a-fragment")).unwrap();

        let index = FragmentIndex::scan(&config_for(&dir)).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.resolve("frag-001"), Some(remote.join("frag-001")));
        assert!(index.resolve("not-a-fragment").is_none());
    }

    #[test]
    fn test_insert_remove() {
        let index = FragmentIndex::new();
        index.insert("frag-x".into(), PathBuf::from("/tmp/frag-x"));

        assert_eq!(index.resolve("frag-x"), Some(PathBuf::from("/tmp/frag-x")));
        assert_eq!(index.remove("frag-x"), Some(PathBuf::from("/tmp/frag-x")));
        assert!(index.resolve("frag-x").is_none());
        assert!(index.remove("frag-x").is_none());
    }

    #[test]
    fn test_index_agrees_with_disk_after_scan() {
        let dir = TempDir::new().unwrap();
        let remote = remote_dir(dir.path());
        std::fs::create_dir_all(&remote).unwrap();
        for id in ["a", "b", "c"] {
            std::fs::write(remote.join(id), id).unwrap();
        }

        let index = FragmentIndex::scan(&config_for(&dir)).unwrap();

        // Every indexed id refers to an existing file
        for (id, path) in index.snapshot() {
            assert!(path.is_file(), "missing file for {id}");
        }
        // Every on-disk fragment is indexed
        for dirent in std::fs::read_dir(&remote).unwrap() {
            let name = dirent.unwrap().file_name().into_string().unwrap();
            assert!(index.resolve(&name).is_some(), "unindexed file {name}");
        }
    }
}
