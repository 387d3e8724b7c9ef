//! Named key-value caches with a swappable local or clustered strategy.
//!
//! Components ask the [`CacheFactory`] for a cache by name and keep the
//! returned [`CacheHandle`]. When clustering starts or stops the factory
//! swaps the storage behind every handle, so callers never know which
//! strategy is active.

mod clustered;
mod factory;
mod local;
mod lock;

use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use clustered::{ClusterBackend, ClusteredCache, MemoryClusterBackend};
pub use factory::{CacheConfig, CacheFactory, DEFAULT_MAX_CACHE_LIFETIME, DEFAULT_MAX_CACHE_SIZE};
pub use local::LocalCache;
pub use lock::{KeyLockGuard, LocalLockManager};

use crate::error::CacheError;

/// Estimated in-memory size of a cached object, in bytes.
pub trait Cacheable {
    fn cached_size(&self) -> usize;
}

impl Cacheable for String {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<String>() + self.len()
    }
}

impl Cacheable for bool {
    fn cached_size(&self) -> usize {
        1
    }
}

impl Cacheable for i64 {
    fn cached_size(&self) -> usize {
        8
    }
}

impl<T: Cacheable> Cacheable for Vec<T> {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<Vec<T>>() + self.iter().map(Cacheable::cached_size).sum::<usize>()
    }
}

impl<T: Cacheable> Cacheable for BTreeSet<T> {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<BTreeSet<T>>() + self.iter().map(Cacheable::cached_size).sum::<usize>()
    }
}

impl<T: Cacheable> Cacheable for HashSet<T> {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<HashSet<T>>() + self.iter().map(Cacheable::cached_size).sum::<usize>()
    }
}

/// Bounds required of cache keys.
pub trait CacheKey:
    Cacheable + Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Cacheable + Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds required of cache values.
pub trait CacheValue:
    Cacheable + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheValue for T where
    T: Cacheable + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Hit/miss counters of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub size: usize,
}

/// A named key-value store.
///
/// Values are returned by copy: mutating a value read from the cache has no
/// effect until it is `put` back, which is also how clustered storage behaves.
pub trait Cache<K: CacheKey, V: CacheValue>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    /// Store a value, returning the previous one.
    fn put(&self, key: K, value: V) -> Option<V>;

    fn remove(&self, key: &K) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    fn entries(&self) -> Vec<(K, V)>;

    /// Acquire the reentrant lock guarding `key` in this cache.
    fn lock(&self, key: &K) -> Result<KeyLockGuard, CacheError>;

    /// Maximum size in bytes, negative when unbounded.
    fn max_size(&self) -> i64;

    /// Maximum entry lifetime, `None` when entries never expire.
    fn max_lifetime(&self) -> Option<Duration>;

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }

    fn stats(&self) -> CacheStats;
}

/// Render a cache key as the string used for locks and clustered storage.
pub(crate) fn encode_key<K: Serialize>(key: &K) -> Result<String, CacheError> {
    Ok(serde_json::to_string(key)?)
}

/// Stable handle to a named cache.
///
/// Cloning is cheap. The storage behind the handle may be swapped by the
/// factory at any time.
pub struct CacheHandle<K: CacheKey, V: CacheValue> {
    slot: Arc<CacheSlot<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for CacheHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

pub(crate) struct CacheSlot<K: CacheKey, V: CacheValue> {
    name: String,
    config: CacheConfig,
    current: RwLock<Arc<dyn Cache<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> CacheHandle<K, V> {
    pub(crate) fn from_slot(slot: Arc<CacheSlot<K, V>>) -> Self {
        Self { slot }
    }

    fn current(&self) -> Arc<dyn Cache<K, V>> {
        Arc::clone(&*self.slot.current.read())
    }

    /// Sizing this cache was created with.
    pub fn config(&self) -> CacheConfig {
        self.slot.config
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> for CacheHandle<K, V> {
    fn name(&self) -> &str {
        &self.slot.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.current().get(key)
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        self.current().put(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.current().remove(key)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.current().contains_key(key)
    }

    fn clear(&self) {
        self.current().clear()
    }

    fn len(&self) -> usize {
        self.current().len()
    }

    fn keys(&self) -> Vec<K> {
        self.current().keys()
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.current().entries()
    }

    fn lock(&self, key: &K) -> Result<KeyLockGuard, CacheError> {
        self.current().lock(key)
    }

    fn max_size(&self) -> i64 {
        self.slot.config.max_size
    }

    fn max_lifetime(&self) -> Option<Duration> {
        self.slot.config.max_lifetime()
    }

    fn purge_expired(&self) -> usize {
        self.current().purge_expired()
    }

    fn stats(&self) -> CacheStats {
        self.current().stats()
    }
}

impl<K: CacheKey, V: CacheValue> CacheSlot<K, V> {
    pub(crate) fn new(name: &str, config: CacheConfig, initial: Arc<dyn Cache<K, V>>) -> Self {
        Self {
            name: name.to_string(),
            config,
            current: RwLock::new(initial),
        }
    }

    /// Replace the storage, carrying the current entries over.
    pub(crate) fn swap(&self, next: Arc<dyn Cache<K, V>>) {
        let mut current = self.current.write();
        for (key, value) in current.entries() {
            next.put(key, value);
        }
        *current = next;
    }
}
