use crate::clock::Clock;
use crate::traits::{CacheEntry, CacheStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

type Shard<V> = RwLock<HashMap<String, CacheEntry<V>>>;

/// Thread-safe TTL cache.
///
/// Keys are spread across 64 independent shards, each behind its own
/// `RwLock`. Hits take a read lock on one shard; puts and expiry removals
/// take a write lock on one shard.
///
/// Expiry is lazy: `get` refuses any entry older than the TTL at lookup
/// time. `purge_expired` only reclaims memory and can run on any schedule.
///
/// There is no coordination between concurrent fetches of the same key.
/// Two writers for one key both land and the later `put` wins.
pub struct TtlCache<V> {
    shards: Box<[Shard<V>]>,
    clock: Arc<dyn Clock>,
    ttl_ms: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    inserts: AtomicU64,
}

impl<V: Send + Sync> TtlCache<V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let shards: Vec<Shard<V>> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            clock,
            ttl_ms: AtomicU64::new(duration_to_ms(ttl)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    /// Hash a key and return the shard index.
    #[inline]
    fn shard_index(key: &str) -> usize {
        let hash = ahash::RandomState::with_seeds(1, 2, 3, 4).hash_one(key);
        (hash & SHARD_MASK) as usize
    }

    /// Look up a live entry.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let now = self.clock.now();
        let ttl = self.ttl();
        let shard = &self.shards[Self::shard_index(key)];

        {
            let guard = shard.read();
            match guard.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !entry.is_expired(now, ttl) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.clone());
                }
                Some(_) => {}
            }
        }

        // Re-check under the write lock: a fresh put may have replaced it.
        let mut guard = shard.write();
        if guard.get(key).is_some_and(|e| e.is_expired(now, ttl)) {
            guard.remove(key);
        }
        self.expired.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Look up a live value.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Store `value` under `key`, replacing any previous entry outright.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            value: Arc::new(value),
            inserted_at: self.clock.now(),
        };
        let idx = Self::shard_index(&key);
        self.shards[idx].write().insert(key, entry);
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, entry| !entry.is_expired(now, ttl));
            removed += before - guard.len();
        }
        removed
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Change the TTL. Applies to existing entries on their next lookup.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(duration_to_ms(ttl), Ordering::Relaxed);
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            current_size: self.len(),
        }
    }
}

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use bytes::Bytes;

    const TTL: Duration = Duration::from_secs(1800);

    fn cache_with_clock() -> (TtlCache<Bytes>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (TtlCache::new(TTL, clock.clone()), clock)
    }

    #[test]
    fn put_then_get() {
        let (cache, _) = cache_with_clock();

        cache.put("https://example.com/", Bytes::from_static(b"<html>"));
        assert_eq!(
            cache.get("https://example.com/").as_deref(),
            Some(&Bytes::from_static(b"<html>"))
        );
        assert!(cache.get("https://missing.example/").is_none());
    }

    #[test]
    fn entry_carries_key_and_insert_time() {
        let (cache, clock) = cache_with_clock();
        let t0 = clock.now();

        cache.put("k", Bytes::from_static(b"v"));
        let entry = cache.get_entry("k").unwrap();
        assert_eq!(entry.key, "k");
        assert_eq!(entry.inserted_at, t0);
    }

    #[test]
    fn served_up_to_ttl_then_rejected() {
        let (cache, clock) = cache_with_clock();
        cache.put("k", Bytes::from_static(b"v"));

        clock.advance(TTL);
        assert!(cache.get("k").is_some());

        clock.advance(Duration::from_millis(1));
        assert!(cache.get("k").is_none());
        // Lazy expiry also removed it.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn later_put_supersedes_and_restamps() {
        let (cache, clock) = cache_with_clock();
        cache.put("k", Bytes::from_static(b"old"));

        clock.advance(Duration::from_secs(1700));
        cache.put("k", Bytes::from_static(b"new"));

        clock.advance(Duration::from_secs(200));
        assert_eq!(
            cache.get("k").as_deref(),
            Some(&Bytes::from_static(b"new"))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn purge_removes_only_expired() {
        let (cache, clock) = cache_with_clock();
        cache.put("old", Bytes::from_static(b"1"));
        clock.advance(Duration::from_secs(1000));
        cache.put("fresh", Bytes::from_static(b"2"));
        clock.advance(Duration::from_secs(1000));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("fresh").is_some());
    }

    #[test]
    fn set_ttl_applies_to_existing_entries() {
        let (cache, clock) = cache_with_clock();
        cache.put("k", Bytes::from_static(b"v"));
        clock.advance(Duration::from_secs(120));
        assert!(cache.get("k").is_some());

        cache.set_ttl(Duration::from_secs(60));
        assert_eq!(cache.ttl(), Duration::from_secs(60));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn distributes_across_shards() {
        let (cache, _) = cache_with_clock();

        for i in 0..200 {
            cache.put(format!("https://example.com/{}", i), Bytes::new());
        }

        assert_eq!(cache.len(), 200);

        let nonempty_shards = cache
            .shards
            .iter()
            .filter(|s| !s.read().is_empty())
            .count();
        assert!(
            nonempty_shards > 1,
            "expected keys distributed across multiple shards, got {}",
            nonempty_shards
        );
    }

    #[test]
    fn stats_track_lookups() {
        let (cache, clock) = cache_with_clock();
        cache.put("a", Bytes::new());
        cache.put("b", Bytes::new());
        cache.get("a"); // hit
        cache.get("z"); // miss
        clock.advance(TTL + Duration::from_secs(1));
        cache.get("b"); // expired

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn concurrent_access() {
        use std::thread;

        let cache = Arc::new(TtlCache::new(TTL, Arc::new(SystemClock)));

        for i in 0..1000 {
            cache.put(format!("key-{}", i), Bytes::new());
        }

        let mut handles = vec![];
        for t in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    let key = format!("key-{}", (t * 1000 + i) % 2000);
                    if i % 3 == 0 {
                        cache.put(key, Bytes::new());
                    } else {
                        cache.get(&key);
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert!(cache.len() <= 2000);
        let stats = cache.stats();
        assert!(stats.hits + stats.misses > 0);
    }

    #[test]
    fn is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TtlCache<Bytes>>();
    }
}
