//! Bounded TTL cache
//!
//! O(1) amortized get/set over an `lru::LruCache`, with per-entry TTL and
//! hit/miss counters. Expired entries are removed on `get` and count as a
//! miss; `set` on an existing key refreshes recency. Eviction beyond
//! `max_size` follows the configured strategy (LRU by access recency, or
//! FIFO by insertion order).

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::config::{CacheConfig, CacheStrategy};

// ============================================================================
// STATS
// ============================================================================

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Successful, unexpired gets
    pub hits: u64,
    /// Absent or expired gets
    pub misses: u64,
    /// Entries evicted by capacity
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Current entry count
    pub size: usize,
    /// Capacity
    pub max_size: usize,
}

impl CacheStats {
    /// `hits / (hits + misses)`; zero when nothing was asked yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ============================================================================
// CACHE
// ============================================================================

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Inner<K: Hash + Eq, V> {
    map: LruCache<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Bounded TTL cache, safe for concurrent readers and writers.
///
/// The lock is held only for the O(1) map operation, never across I/O.
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    default_ttl: Option<Duration>,
    strategy: CacheStrategy,
    max_size: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    /// Build from config. `ttl_ms == 0` means entries never expire.
    pub fn from_config(config: &CacheConfig) -> Self {
        let default_ttl =
            (config.ttl_ms > 0).then(|| Duration::from_millis(config.ttl_ms));
        Self::new(config.max_size, default_ttl, config.strategy)
    }

    /// Build with explicit capacity, default TTL, and strategy.
    pub fn new(max_size: usize, default_ttl: Option<Duration>, strategy: CacheStrategy) -> Self {
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            default_ttl,
            strategy,
            max_size: max_size.max(1),
        }
    }

    /// Look up a key. Expired entries are removed and counted as a miss.
    /// Under the LRU strategy a hit refreshes recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let expired = match inner.map.peek(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.map.pop(key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        let value = match self.strategy {
            // FIFO never reorders on access
            CacheStrategy::Fifo => inner.map.peek(key).map(|e| e.value.clone()),
            CacheStrategy::Lru => inner.map.get(key).map(|e| e.value.clone()),
        };
        value
    }

    /// Insert or replace. `ttl` of `None` uses the configured default;
    /// existing keys have their recency refreshed.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.or(self.default_ttl).map(|d| Instant::now() + d);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let replaced = inner.map.contains(&key);
        let at_capacity = inner.map.len() == self.max_size;
        inner.map.push(key, Entry { value, expires_at });
        if !replaced && at_capacity {
            inner.evictions += 1;
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.map.pop(key).is_some()
    }

    /// Drop every entry. Counters survive.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.map.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.map.len(),
            max_size: self.max_size,
        }
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).map.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn lru_cache(max: usize) -> TtlCache<String, i64> {
        TtlCache::new(max, None, CacheStrategy::Lru)
    }

    #[test]
    fn set_get_roundtrip() {
        let cache = lru_cache(4);
        cache.set("k".into(), 42, None);
        assert_eq!(cache.get(&"k".to_string()), Some(42));
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 0));
    }

    #[test]
    fn miss_counts() {
        let cache = lru_cache(4);
        assert_eq!(cache.get(&"absent".to_string()), None);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_zero_when_untouched() {
        let cache = lru_cache(4);
        assert_eq!(cache.stats().hit_rate(), 0.0);
    }

    #[test]
    fn evicts_exactly_one_past_capacity() {
        let cache = lru_cache(3);
        for i in 0..3 {
            cache.set(format!("k{i}"), i, None);
        }
        // At capacity: nothing evicted yet
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.len(), 3);

        cache.set("k3".into(), 3, None);
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 3);
        // First-inserted key is gone
        assert_eq!(cache.get(&"k0".to_string()), None);
        assert_eq!(cache.get(&"k3".to_string()), Some(3));
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = lru_cache(2);
        cache.set("a".into(), 1, None);
        cache.set("b".into(), 2, None);
        // Touch "a" so "b" becomes least-recently used
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.set("c".into(), 3, None);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn set_on_existing_key_refreshes_recency() {
        let cache = lru_cache(2);
        cache.set("a".into(), 1, None);
        cache.set("b".into(), 2, None);
        cache.set("a".into(), 10, None);
        cache.set("c".into(), 3, None);
        assert_eq!(cache.get(&"a".to_string()), Some(10));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn ttl_expiry_counts_as_miss_and_removes() {
        let cache: TtlCache<String, i64> = TtlCache::new(4, None, CacheStrategy::Lru);
        cache.set("k".into(), 1, Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&"k".to_string()), None);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn delete_and_clear() {
        let cache = lru_cache(4);
        cache.set("a".into(), 1, None);
        assert!(cache.delete(&"a".to_string()));
        assert!(!cache.delete(&"a".to_string()));
        cache.set("b".into(), 2, None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn fifo_evicts_by_insertion_order() {
        let cache: TtlCache<String, i64> = TtlCache::new(2, None, CacheStrategy::Fifo);
        cache.set("a".into(), 1, None);
        cache.set("b".into(), 2, None);
        // Access does not protect "a" under FIFO
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.set("c".into(), 3, None);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(2));
    }
}
