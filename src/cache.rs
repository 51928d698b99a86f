//! Read-through cache for static file bodies.
//!
//! Keyed by absolute path and validated by `(mtime, size)`: an entry whose
//! validator no longer matches the file on disk is treated as a miss, so
//! stale content is never served. Insertion is best-effort within a total
//! byte capacity.

use bytes::Bytes;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

#[derive(Clone)]
struct Entry {
    mtime: i64,
    data: Bytes,
}

struct CacheState {
    map: HashMap<PathBuf, Entry>,
    used: u64,
}

pub(crate) struct FileCache {
    capacity: u64,
    state: RwLock<CacheState>,
}

impl FileCache {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: RwLock::new(CacheState {
                map: HashMap::new(),
                used: 0,
            }),
        }
    }

    /// Returns the cached body for `path` when the validator matches.
    pub(crate) fn get(&self, path: &Path, mtime: i64, size: u64) -> Option<Bytes> {
        let state = self.state.read();
        let entry = state.map.get(path)?;
        if entry.mtime != mtime || entry.data.len() as u64 != size {
            return None;
        }
        Some(entry.data.clone())
    }

    /// Best-effort insert. Oversized bodies are skipped; otherwise arbitrary
    /// entries are evicted until the capacity bound holds.
    pub(crate) fn set(&self, path: &Path, mtime: i64, data: Bytes) {
        let len = data.len() as u64;
        if len > self.capacity {
            return;
        }
        let mut state = self.state.write();
        if let Some(old) = state.map.remove(path) {
            state.used -= old.data.len() as u64;
        }
        while state.used + len > self.capacity {
            let Some(victim) = state.map.keys().next().cloned() else {
                break;
            };
            if let Some(old) = state.map.remove(&victim) {
                state.used -= old.data.len() as u64;
            }
        }
        state.used += len;
        state.map.insert(path.to_owned(), Entry { mtime, data });
    }

    #[cfg(test)]
    fn used(&self) -> u64 {
        self.state.read().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> PathBuf {
        PathBuf::from(format!("/srv/{name}"))
    }

    #[test]
    fn hit_requires_matching_validator() {
        let cache = FileCache::new(1024);
        cache.set(&path("a.html"), 100, Bytes::from_static(b"hello"));

        assert_eq!(
            cache.get(&path("a.html"), 100, 5),
            Some(Bytes::from_static(b"hello"))
        );
        // changed mtime or size forces a miss
        assert_eq!(cache.get(&path("a.html"), 101, 5), None);
        assert_eq!(cache.get(&path("a.html"), 100, 6), None);
        assert_eq!(cache.get(&path("b.html"), 100, 5), None);
    }

    #[test]
    fn capacity_bound_holds_under_eviction() {
        let cache = FileCache::new(10);
        cache.set(&path("a"), 1, Bytes::from_static(b"aaaa"));
        cache.set(&path("b"), 1, Bytes::from_static(b"bbbb"));
        cache.set(&path("c"), 1, Bytes::from_static(b"cccc"));
        assert!(cache.used() <= 10);
    }

    #[test]
    fn oversized_body_is_not_cached() {
        let cache = FileCache::new(3);
        cache.set(&path("big"), 1, Bytes::from_static(b"toolarge"));
        assert_eq!(cache.get(&path("big"), 1, 8), None);
        assert_eq!(cache.used(), 0);
    }

    #[test]
    fn reinsert_replaces_entry_accounting() {
        let cache = FileCache::new(16);
        cache.set(&path("a"), 1, Bytes::from_static(b"12345678"));
        cache.set(&path("a"), 2, Bytes::from_static(b"1234"));
        assert_eq!(cache.used(), 4);
        assert_eq!(cache.get(&path("a"), 2, 4), Some(Bytes::from_static(b"1234")));
    }
}
