use std::sync::Arc;
use std::time::{Duration, Instant};

/// A value stored under `key`, stamped with the clock reading at insert time.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: Arc<V>,
    pub inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    /// An entry is expired once strictly more than `ttl` has elapsed.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
        }
    }
}

/// Snapshot of cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found an entry past its TTL.
    pub expired: u64,
    pub inserts: u64,
    pub current_size: usize,
}
