use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::entities::OmittableString;

/// A compiled program owned by the cache and shared with live submissions.
/// The backing directory is deleted when the last reference goes away, so
/// eviction never removes files a testcase is still copying or mounting.
#[derive(Debug)]
pub struct BinaryArtifact {
    /// Content hash of the compile task that produced this binary.
    pub task_hash: String,

    pub message: OmittableString,

    /// Directory under the binary cache store, named by a random uuid. The
    /// task hash cannot name it: an entry may be re-inserted while a prior
    /// incarnation is still referenced.
    pub directory: PathBuf,

    pub size: u64,

    pub extra_info: Option<String>,
}

impl Drop for BinaryArtifact {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.directory) {
            warn!(directory = %self.directory.display(), "Error removing binary directory: {err:#}");
        }
    }
}

/// Weight-based lru over compiled binaries; the weight of an entry is its
/// directory size in bytes and `max_size` is a soft cap.
pub struct BinaryCache {
    max_size: u64,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    /// Insertion order doubles as recency order: a hit re-inserts its entry
    /// at the back.
    entries: IndexMap<String, Arc<BinaryArtifact>>,
    total_size: u64,
}

impl BinaryCache {
    pub fn new(max_size: u64) -> Self {
        Self { max_size, state: Mutex::new(CacheState::default()) }
    }

    pub fn get(&self, task_hash: &str) -> Option<Arc<BinaryArtifact>> {
        let mut state = self.state.lock().unwrap();
        let artifact = state.entries.shift_remove(task_hash)?;
        state.entries.insert(task_hash.to_string(), artifact.clone());
        Some(artifact)
    }

    pub fn insert(&self, task_hash: String, artifact: Arc<BinaryArtifact>) {
        let mut state = self.state.lock().unwrap();

        if let Some(previous) = state.entries.shift_remove(&task_hash) {
            state.total_size -= previous.size;
        }

        state.total_size += artifact.size;
        state.entries.insert(task_hash, artifact);

        while state.total_size > self.max_size && state.entries.len() > 1 {
            let (evicted_hash, evicted) = state.entries.shift_remove_index(0).unwrap();
            state.total_size -= evicted.size;
            debug!(task_hash = evicted_hash, size = evicted.size, "Evicting a cached binary");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::{BinaryArtifact, BinaryCache};

    fn make_artifact(root: &Path, name: &str, size: u64) -> Arc<BinaryArtifact> {
        let directory = root.join(name);
        std::fs::create_dir_all(&directory).unwrap();
        Arc::new(BinaryArtifact {
            task_hash: name.to_string(),
            message: Default::default(),
            directory,
            size,
            extra_info: None,
        })
    }

    #[test]
    fn test_lru_eviction_by_weight() {
        let root = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new(100);

        cache.insert("a".to_string(), make_artifact(root.path(), "a", 60));
        cache.insert("b".to_string(), make_artifact(root.path(), "b", 30));
        assert!(cache.get("a").is_some());

        // "b" is now the least recently used entry and gets evicted.
        cache.insert("c".to_string(), make_artifact(root.path(), "c", 40));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_deletion_deferred_until_release() {
        let root = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new(100);

        let artifact = make_artifact(root.path(), "a", 80);
        let directory = artifact.directory.clone();
        cache.insert("a".to_string(), artifact.clone());

        // Evict "a" while a live user still holds a reference.
        cache.insert("b".to_string(), make_artifact(root.path(), "b", 80));
        assert!(cache.get("a").is_none());
        assert!(directory.exists());

        drop(artifact);
        assert!(!directory.exists());
    }

    #[test]
    fn test_reinsert_while_referenced() {
        let root = tempfile::tempdir().unwrap();
        let cache = BinaryCache::new(1000);

        let first = make_artifact(root.path(), "gen1", 10);
        cache.insert("key".to_string(), first.clone());

        let second = make_artifact(root.path(), "gen2", 10);
        cache.insert("key".to_string(), second);

        // The replaced incarnation lives on while referenced.
        assert!(first.directory.exists());
        assert_eq!(cache.get("key").unwrap().directory, root.path().join("gen2"));

        drop(first);
        assert!(!root.path().join("gen1").exists());
        assert!(root.path().join("gen2").exists());
    }
}
