//! Bounded cache of materialized delta bases.
//!
//! Resolving several objects that delta against the same base re-inflates
//! and re-applies that base's own chain every time unless the result is kept
//! around. This cache holds recently materialized `(pack, offset)` objects,
//! bounded by total bytes rather than entry count since bases vary wildly in
//! size; eviction is least-recently-used.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git_object::ObjectType;

/// Identifies a specific pack entry: the pack's on-disk path plus its byte offset.
type CacheKey = (PathBuf, u64);

struct Entry {
    obj_type: ObjectType,
    data: Vec<u8>,
}

struct Inner {
    entries: HashMap<CacheKey, Entry>,
    /// Least-recently-used order, oldest first.
    order: Vec<CacheKey>,
    total_bytes: usize,
}

/// A byte-bounded LRU cache of materialized (fully resolved) pack objects.
pub struct DeltaBaseCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
}

impl DeltaBaseCache {
    /// Create a cache that holds at most `max_bytes` of materialized object data.
    /// A budget of 0 disables caching entirely.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                total_bytes: 0,
            }),
            max_bytes,
        }
    }

    /// Look up a materialized object by pack path and offset, promoting it to
    /// most-recently-used on a hit.
    pub fn get(&self, pack_path: &Path, offset: u64) -> Option<(ObjectType, Vec<u8>)> {
        if self.max_bytes == 0 {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let key = (pack_path.to_path_buf(), offset);
        let found = inner.entries.get(&key).map(|e| (e.obj_type, e.data.clone()));
        if found.is_some() {
            inner.touch(&key);
        }
        found
    }

    /// Insert a materialized object, evicting least-recently-used entries as
    /// needed to stay within the byte budget. A no-op if the object alone
    /// exceeds the budget, or the cache is disabled.
    pub fn insert(&self, pack_path: &Path, offset: u64, obj_type: ObjectType, data: Vec<u8>) {
        if self.max_bytes == 0 || data.len() > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let key = (pack_path.to_path_buf(), offset);
        if inner.entries.contains_key(&key) {
            inner.touch(&key);
            return;
        }
        inner.total_bytes += data.len();
        inner.entries.insert(key.clone(), Entry { obj_type, data });
        inner.order.push(key);
        inner.evict_to_budget(self.max_bytes);
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
        inner.total_bytes = 0;
    }

    /// Total bytes currently held.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }
}

impl Inner {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn evict_to_budget(&mut self, max_bytes: usize) {
        while self.total_bytes > max_bytes && !self.order.is_empty() {
            let evicted = self.order.remove(0);
            if let Some(entry) = self.entries.remove(&evicted) {
                self.total_bytes -= entry.data.len();
            }
        }
    }
}
