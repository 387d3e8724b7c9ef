//! In-process cache with size and lifetime eviction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::lock::scoped_key;
use super::{encode_key, Cache, CacheConfig, CacheKey, CacheStats, CacheValue, KeyLockGuard, LocalLockManager};
use crate::error::CacheError;
use crate::metrics;

/// Shards used by unbounded caches.
const UNBOUNDED_SHARDS: usize = 16;

struct Entry<V> {
    value: V,
    size: usize,
    created: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, lifetime: Option<Duration>, now: Instant) -> bool {
        lifetime.is_some_and(|l| now.duration_since(self.created) > l)
    }
}

struct Shard<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    size: usize,
    limit: Option<usize>,
}

impl<K: Hash + Eq, V> Shard<K, V> {
    fn take(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.pop(key)?;
        self.size = self.size.saturating_sub(entry.size);
        Some(entry)
    }

    /// Evict least-recently-used entries until the shard is back under 90%
    /// of its limit.
    fn evict_to_fit(&mut self) -> u64 {
        let Some(limit) = self.limit else {
            return 0;
        };
        if self.size <= limit {
            return 0;
        }
        let target = limit / 10 * 9;
        let mut evicted = 0;
        while self.size > target {
            match self.entries.pop_lru() {
                Some((_, entry)) => {
                    self.size = self.size.saturating_sub(entry.size);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

/// Cache held in this process only.
///
/// Bounded caches keep a single LRU list so eviction order is exact.
/// Unbounded caches are split into shards so unrelated keys never contend.
pub struct LocalCache<K: CacheKey, V: CacheValue> {
    name: String,
    config: CacheConfig,
    shards: Vec<Mutex<Shard<K, V>>>,
    locks: Arc<LocalLockManager>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: CacheKey, V: CacheValue> LocalCache<K, V> {
    pub fn new(name: &str, config: CacheConfig, locks: Arc<LocalLockManager>) -> Self {
        let (count, limit) = if config.max_size < 0 {
            (UNBOUNDED_SHARDS, None)
        } else {
            (1, Some(config.max_size as usize))
        };
        let shards = (0..count)
            .map(|_| {
                Mutex::new(Shard {
                    entries: LruCache::unbounded(),
                    size: 0,
                    limit,
                })
            })
            .collect();

        debug!(cache = name, max_size = config.max_size, "Created local cache");
        Self {
            name: name.to_string(),
            config,
            shards,
            locks,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
            metrics::record_evictions(&self.name, count);
            debug!(cache = %self.name, count, "Evicted cache entries");
        }
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for LocalCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        let lifetime = self.config.max_lifetime();
        let mut shard = self.shard(key).lock();
        let expired = match shard.entries.peek(key) {
            Some(entry) => entry.is_expired(lifetime, Instant::now()),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            shard.take(key);
            drop(shard);
            self.record_evictions(1);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        shard.entries.get(key).map(|e| e.value.clone())
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        let size = key.cached_size() + value.cached_size();
        let mut shard = self.shard(&key).lock();

        if let Some(limit) = shard.limit {
            if size > limit / 10 * 9 {
                warn!(
                    cache = %self.name,
                    size,
                    limit,
                    "Cache entry too large to be cached"
                );
                return shard.take(&key).map(|e| e.value);
            }
        }

        let previous = shard.entries.put(
            key,
            Entry {
                value,
                size,
                created: Instant::now(),
            },
        );
        if let Some(previous) = &previous {
            shard.size = shard.size.saturating_sub(previous.size);
        }
        shard.size += size;
        let evicted = shard.evict_to_fit();
        drop(shard);
        self.record_evictions(evicted);

        previous.map(|e| e.value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).lock().take(key).map(|e| e.value)
    }

    fn contains_key(&self, key: &K) -> bool {
        let lifetime = self.config.max_lifetime();
        self.shard(key)
            .lock()
            .entries
            .peek(key)
            .is_some_and(|e| !e.is_expired(lifetime, Instant::now()))
    }

    fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.size = 0;
        }
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    fn entries(&self) -> Vec<(K, V)> {
        let lifetime = self.config.max_lifetime();
        let now = Instant::now();
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            out.extend(
                shard
                    .entries
                    .iter()
                    .filter(|(_, e)| !e.is_expired(lifetime, now))
                    .map(|(k, e)| (k.clone(), e.value.clone())),
            );
        }
        out
    }

    fn lock(&self, key: &K) -> Result<KeyLockGuard, CacheError> {
        let key = encode_key(key)?;
        Ok(self.locks.acquire(scoped_key(&self.name, &key)))
    }

    fn max_size(&self) -> i64 {
        self.config.max_size
    }

    fn max_lifetime(&self) -> Option<Duration> {
        self.config.max_lifetime()
    }

    fn purge_expired(&self) -> usize {
        let Some(lifetime) = self.config.max_lifetime() else {
            return 0;
        };
        let now = Instant::now();
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let expired: Vec<K> = shard
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(Some(lifetime), now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                shard.take(&key);
                purged += 1;
            }
        }
        self.record_evictions(purged as u64);
        purged
    }

    fn stats(&self) -> CacheStats {
        let (entries, size) = self.shards.iter().fold((0, 0), |(n, s), shard| {
            let shard = shard.lock();
            (n + shard.entries.len(), s + shard.size)
        });
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cacheable;

    fn cache(max_size: i64, lifetime_ms: i64) -> LocalCache<String, String> {
        LocalCache::new(
            "Test",
            CacheConfig {
                max_size,
                max_lifetime_ms: lifetime_ms,
                min_size: -1,
            },
            LocalLockManager::new(),
        )
    }

    fn value(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn test_put_get_remove() {
        let cache = cache(-1, -1);
        assert_eq!(cache.put("a".into(), "1".into()), None);
        assert_eq!(cache.put("a".into(), "2".into()), Some("1".to_string()));
        assert_eq!(cache.get(&"a".to_string()), Some("2".to_string()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove(&"a".to_string()), Some("2".to_string()));
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_size_eviction_drops_least_recently_used() {
        let entry = "k0".to_string().cached_size() + value(100).cached_size();
        let cache = cache((entry * 3) as i64, -1);

        cache.put("k0".into(), value(100));
        cache.put("k1".into(), value(100));
        cache.put("k2".into(), value(100));
        // Touch k0 so k1 becomes the eviction candidate.
        assert!(cache.get(&"k0".to_string()).is_some());
        cache.put("k3".into(), value(100));

        assert!(cache.get(&"k1".to_string()).is_none());
        assert!(cache.get(&"k3".to_string()).is_some());
        assert!(cache.stats().size <= entry * 3);
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_oversized_entry_is_not_cached() {
        let cache = cache(64, -1);
        cache.put("big".into(), value(1000));
        assert!(!cache.contains_key(&"big".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_expiry() {
        let cache = cache(-1, 1_000);
        cache.put("a".into(), "1".into());
        cache.put("b".into(), "2".into());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cache.get(&"a".to_string()).is_some());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(cache.get(&"a".to_string()).is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lock_uses_shared_manager() {
        let locks = LocalLockManager::new();
        let cache: LocalCache<String, String> =
            LocalCache::new("Locked", CacheConfig::unbounded(), Arc::clone(&locks));

        let guard = cache.lock(&"alice@example.com".to_string()).unwrap();
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);
    }
}
