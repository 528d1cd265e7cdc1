//! LRU deduplication cache for trigger fires
//!
//! Each entity keeps its own cache. A dedupe key seen again within the
//! retention window returns the cached outcome instead of re-appending.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Default number of dedupe keys retained per entity
pub const DEFAULT_DEDUPE_CAPACITY: usize = 1024;

/// Per-entity LRU cache of recently seen dedupe keys
pub struct DedupeCache<V> {
    cache: LruCache<String, V>,
}

impl<V> std::fmt::Debug for DedupeCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupeCache")
            .field("len", &self.cache.len())
            .field("capacity", &self.cache.cap())
            .finish()
    }
}

impl<V: Clone> DedupeCache<V> {
    /// Create a cache with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_DEDUPE_CAPACITY)
    }

    /// Create a cache retaining up to `capacity` keys
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Look up a key, refreshing its recency
    pub fn get(&mut self, key: &str) -> Option<V> {
        self.cache.get(key).cloned()
    }

    /// Record the outcome observed for a key
    pub fn insert(&mut self, key: impl Into<String>, outcome: V) {
        self.cache.put(key.into(), outcome);
    }

    /// Number of keys currently retained
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl<V: Clone> Default for DedupeCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
