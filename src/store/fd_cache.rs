//! Bounded LRU cache of open object files.
//!
//! Eviction closes the descriptor; reopening is always permitted, so a
//! miss is never an error.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

struct CacheEntry {
    file: Arc<File>,
    last_used: u64,
}

/// LRU file cache keyed by path.
pub struct FdCache {
    capacity: usize,
    inner: Mutex<CacheState>,
}

struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    tick: u64,
}

impl FdCache {
    /// Cache holding up to `capacity` open files.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    /// Look up an open file, refreshing its recency.
    pub fn get(&self, path: &Path) -> Option<Arc<File>> {
        let mut state = self.inner.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(path)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.file))
    }

    /// Insert an open file, evicting the least recently used on overflow.
    pub fn insert(&self, path: &Path, file: Arc<File>) {
        let mut state = self.inner.lock();
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                file,
                last_used: tick,
            },
        );
        while state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(p, _)| p.clone());
            match oldest {
                Some(path) => {
                    state.entries.remove(&path);
                }
                None => break,
            }
        }
    }

    /// Drop a cached file, if present.
    pub fn invalidate(&self, path: &Path) {
        self.inner.lock().entries.remove(path);
    }

    /// Drop every cached file under a directory (rename, destroy).
    pub fn invalidate_dir(&self, dir: &Path) {
        self.inner
            .lock()
            .entries
            .retain(|path, _| !path.starts_with(dir));
    }

    /// Number of cached descriptors.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path, name: &str) -> Arc<File> {
        Arc::new(File::create(dir.join(name)).unwrap())
    }

    #[test]
    fn test_hit_and_miss() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(4);
        let file = open(dir.path(), "a");
        cache.insert(&dir.path().join("a"), file);
        assert!(cache.get(&dir.path().join("a")).is_some());
        assert!(cache.get(&dir.path().join("b")).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(2);
        for name in ["a", "b"] {
            cache.insert(&dir.path().join(name), open(dir.path(), name));
        }
        // Refresh "a", then overflow; "b" is now the oldest.
        cache.get(&dir.path().join("a"));
        cache.insert(&dir.path().join("c"), open(dir.path(), "c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&dir.path().join("a")).is_some());
        assert!(cache.get(&dir.path().join("b")).is_none());
        assert!(cache.get(&dir.path().join("c")).is_some());
    }

    #[test]
    fn test_invalidate_dir() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("coll");
        std::fs::create_dir(&sub).unwrap();
        let cache = FdCache::new(8);
        cache.insert(&sub.join("x"), Arc::new(File::create(sub.join("x")).unwrap()));
        cache.insert(&dir.path().join("y"), open(dir.path(), "y"));

        cache.invalidate_dir(&sub);
        assert!(cache.get(&sub.join("x")).is_none());
        assert!(cache.get(&dir.path().join("y")).is_some());
    }
}
