//! Cluster-backed caches.
//!
//! Entries are stored as JSON text in a [`ClusterBackend`] shared by every
//! node, stamped with the time they were written. Backend failures on reads
//! and writes degrade to a logged miss so stanza delivery keeps going; lock
//! failures are returned to the caller.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::lock::scoped_key;
use super::{encode_key, Cache, CacheConfig, CacheKey, CacheStats, CacheValue, KeyLockGuard, LocalLockManager};
use crate::error::CacheError;
use crate::metrics;

/// Distributed storage and lock service shared by cluster members.
pub trait ClusterBackend: Send + Sync {
    fn get(&self, cache: &str, key: &str) -> Result<Option<String>, CacheError>;

    fn put(&self, cache: &str, key: &str, value: String) -> Result<Option<String>, CacheError>;

    fn remove(&self, cache: &str, key: &str) -> Result<Option<String>, CacheError>;

    fn entries(&self, cache: &str) -> Result<Vec<(String, String)>, CacheError>;

    fn len(&self, cache: &str) -> Result<usize, CacheError>;

    fn clear(&self, cache: &str) -> Result<(), CacheError>;

    /// Acquire the cluster-wide lock for `key` in `cache`.
    fn lock(&self, cache: &str, key: &str) -> Result<KeyLockGuard, CacheError>;
}

/// Stored form of a clustered entry.
#[derive(Serialize, Deserialize)]
struct Stamped<V> {
    /// Write time, milliseconds since the epoch
    at: i64,
    value: V,
}

/// Write time of a stored entry, read without decoding its value.
#[derive(Deserialize)]
struct Stamp {
    at: i64,
}

/// Cache whose entries live in the cluster backend.
///
/// Every node enforces the configured lifetime when reading. Size is
/// measured as stored text and enforced by the writer, which drops the
/// oldest entries until the cache is back under 90% of its limit.
pub struct ClusteredCache<K: CacheKey, V: CacheValue> {
    name: String,
    config: CacheConfig,
    backend: Arc<dyn ClusterBackend>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K: CacheKey, V: CacheValue> ClusteredCache<K, V> {
    pub fn new(name: &str, config: CacheConfig, backend: Arc<dyn ClusterBackend>) -> Self {
        Self {
            name: name.to_string(),
            config,
            backend,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            _types: PhantomData,
        }
    }

    fn key(&self, key: &K) -> Option<String> {
        encode_key(key)
            .map_err(|e| warn!(cache = %self.name, error = %e, "Unable to encode cache key"))
            .ok()
    }

    fn decode(&self, raw: Option<String>) -> Option<Stamped<V>> {
        let raw = raw?;
        serde_json::from_str(&raw)
            .map_err(|e| warn!(cache = %self.name, error = %e, "Unable to decode cache value"))
            .ok()
    }

    fn degraded<T>(&self, op: &str, result: Result<T, CacheError>) -> Option<T> {
        result
            .map_err(|e| warn!(cache = %self.name, op, error = %e, "Cluster cache unavailable"))
            .ok()
    }

    fn is_expired(&self, at: i64, now: i64) -> bool {
        self.config.max_lifetime_ms > 0 && now.saturating_sub(at) > self.config.max_lifetime_ms
    }

    /// Live value stored under an encoded key. Expired entries are removed.
    fn fetch(&self, key: &str) -> Option<V> {
        let raw = self.degraded("get", self.backend.get(&self.name, key)).flatten();
        let stamped = self.decode(raw)?;
        if self.is_expired(stamped.at, Utc::now().timestamp_millis()) {
            if self.degraded("expire", self.backend.remove(&self.name, key)).is_some() {
                self.record_evictions(1);
            }
            return None;
        }
        Some(stamped.value)
    }

    fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
            metrics::record_evictions(&self.name, count);
            debug!(cache = %self.name, count, "Evicted cache entries");
        }
    }

    /// Drop the oldest entries, never `keep`, while the cache is over its
    /// size limit.
    fn evict_to_fit(&self, keep: &str) {
        let Ok(limit) = usize::try_from(self.config.max_size) else {
            return;
        };
        let Some(stored) = self.degraded("entries", self.backend.entries(&self.name)) else {
            return;
        };
        let mut total: usize = stored.iter().map(|(k, v)| k.len() + v.len()).sum();
        if total <= limit {
            return;
        }

        let mut candidates: Vec<(i64, String, usize)> = stored
            .into_iter()
            .filter(|(k, _)| k != keep)
            .map(|(k, v)| {
                let at = serde_json::from_str::<Stamp>(&v).map(|s| s.at).unwrap_or(i64::MIN);
                let size = k.len() + v.len();
                (at, k, size)
            })
            .collect();
        candidates.sort();

        let target = limit / 10 * 9;
        let mut evicted = 0;
        for (_, key, size) in candidates {
            if total <= target {
                break;
            }
            if self.degraded("evict", self.backend.remove(&self.name, &key)).is_some() {
                total = total.saturating_sub(size);
                evicted += 1;
            }
        }
        self.record_evictions(evicted);
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for ClusteredCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        let key = self.key(key)?;
        let value = self.fetch(&key);
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        let key = self.key(&key)?;
        let stamped = Stamped {
            at: Utc::now().timestamp_millis(),
            value,
        };
        let raw = match serde_json::to_string(&stamped) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(cache = %self.name, error = %e, "Unable to encode cache value");
                return None;
            }
        };
        let previous = self
            .degraded("put", self.backend.put(&self.name, &key, raw))
            .flatten();
        self.evict_to_fit(&key);
        self.decode(previous).map(|s| s.value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        let key = self.key(key)?;
        let previous = self
            .degraded("remove", self.backend.remove(&self.name, &key))
            .flatten();
        self.decode(previous).map(|s| s.value)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.key(key).is_some_and(|key| self.fetch(&key).is_some())
    }

    fn clear(&self) {
        self.degraded("clear", self.backend.clear(&self.name));
    }

    fn len(&self) -> usize {
        self.degraded("len", self.backend.len(&self.name))
            .unwrap_or(0)
    }

    fn entries(&self) -> Vec<(K, V)> {
        let now = Utc::now().timestamp_millis();
        self.degraded("entries", self.backend.entries(&self.name))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(k, v)| {
                let key = serde_json::from_str(&k).ok()?;
                let stamped = self.decode(Some(v))?;
                (!self.is_expired(stamped.at, now)).then_some((key, stamped.value))
            })
            .collect()
    }

    fn lock(&self, key: &K) -> Result<KeyLockGuard, CacheError> {
        let key = encode_key(key)?;
        self.backend.lock(&self.name, &key)
    }

    fn max_size(&self) -> i64 {
        self.config.max_size
    }

    fn max_lifetime(&self) -> Option<Duration> {
        self.config.max_lifetime()
    }

    fn purge_expired(&self) -> usize {
        if self.config.max_lifetime_ms <= 0 {
            return 0;
        }
        let now = Utc::now().timestamp_millis();
        let stored = self
            .degraded("entries", self.backend.entries(&self.name))
            .unwrap_or_default();
        let mut purged = 0;
        for (key, raw) in stored {
            let Ok(stamp) = serde_json::from_str::<Stamp>(&raw) else {
                continue;
            };
            if self.is_expired(stamp.at, now)
                && self.degraded("expire", self.backend.remove(&self.name, &key)).is_some()
            {
                purged += 1;
            }
        }
        self.record_evictions(purged as u64);
        purged
    }

    fn stats(&self) -> CacheStats {
        let stored = self
            .degraded("entries", self.backend.entries(&self.name))
            .unwrap_or_default();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: stored.len(),
            size: stored.iter().map(|(k, v)| k.len() + v.len()).sum(),
        }
    }
}

/// In-process cluster backend shared by several nodes in one process.
///
/// Used to run multi-node deployments inside a single process and to
/// exercise cross-node behaviour in tests.
#[derive(Default)]
pub struct MemoryClusterBackend {
    caches: DashMap<String, DashMap<String, String>>,
    locks: Arc<LocalLockManager>,
    unavailable: AtomicBool,
}

impl MemoryClusterBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the coordination service going away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Entries held for `cache`.
    pub fn cache_len(&self, cache: &str) -> usize {
        self.caches.get(cache).map(|c| c.len()).unwrap_or(0)
    }

    /// Live lock objects.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::Backend("cluster backend unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl ClusterBackend for MemoryClusterBackend {
    fn get(&self, cache: &str, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self
            .caches
            .get(cache)
            .and_then(|c| c.get(key).map(|v| v.value().clone())))
    }

    fn put(&self, cache: &str, key: &str, value: String) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self
            .caches
            .entry(cache.to_string())
            .or_default()
            .insert(key.to_string(), value))
    }

    fn remove(&self, cache: &str, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self
            .caches
            .get(cache)
            .and_then(|c| c.remove(key).map(|(_, v)| v)))
    }

    fn entries(&self, cache: &str) -> Result<Vec<(String, String)>, CacheError> {
        self.check()?;
        Ok(self
            .caches
            .get(cache)
            .map(|c| {
                c.iter()
                    .map(|e| (e.key().clone(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn len(&self, cache: &str) -> Result<usize, CacheError> {
        self.check()?;
        Ok(self.cache_len(cache))
    }

    fn clear(&self, cache: &str) -> Result<(), CacheError> {
        self.check()?;
        if let Some(c) = self.caches.get(cache) {
            c.clear();
        }
        Ok(())
    }

    fn lock(&self, cache: &str, key: &str) -> Result<KeyLockGuard, CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::LockUnavailable {
                cache: cache.to_string(),
                key: key.to_string(),
            });
        }
        Ok(self.locks.acquire(scoped_key(cache, key)))
    }
}
