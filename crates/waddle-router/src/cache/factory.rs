//! Cache factory and per-cache sizing lookup.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::clustered::{ClusterBackend, ClusteredCache};
use super::local::LocalCache;
use super::{Cache, CacheHandle, CacheKey, CacheSlot, CacheValue, LocalLockManager};
use crate::config::ServerProperties;
use crate::error::CacheError;

/// Default maximum cache size in bytes (256 KiB).
pub const DEFAULT_MAX_CACHE_SIZE: i64 = 256 * 1024;

/// Default maximum entry lifetime in milliseconds (6 hours).
pub const DEFAULT_MAX_CACHE_LIFETIME: i64 = 6 * HOUR;

const MINUTE: i64 = 60 * 1000;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// Cache display names and the short names used in property keys.
const SHORT_NAMES: &[(&str, &str)] = &[
    ("Routing Servers Cache", "routeServer"),
    ("Routing Components Cache", "routeComponent"),
    ("Routing Users Cache", "routeUser"),
    ("Routing AnonymousUsers Cache", "routeAnonymousUser"),
    ("Routing User Sessions", "routeUserSessions"),
    ("Directed Presences", "directedPresences"),
    ("Offline Presence Cache", "offlinePresence"),
    ("Last Activity Cache", "lastActivity"),
    ("Roster", "username2roster"),
    ("Group", "group"),
    ("Group Metadata Cache", "groupMeta"),
    ("User", "userCache"),
    ("Remote Users Existence", "remoteUsersCache"),
    ("Multicast Service", "multicast"),
    ("Entity Capabilities", "entityCapabilities"),
    ("Entity Capabilities Users", "entityCapabilitiesUsers"),
    ("Disco Server Features", "serverFeatures"),
    ("Disco Server Items", "serverItems"),
];

/// Built-in sizing keyed by `cache.<shortName>.<suffix>`.
const DEFAULTS: &[(&str, i64)] = &[
    ("cache.routeServer.size", -1),
    ("cache.routeServer.maxLifetime", -1),
    ("cache.routeComponent.size", -1),
    ("cache.routeComponent.maxLifetime", -1),
    ("cache.routeUser.size", -1),
    ("cache.routeUser.maxLifetime", -1),
    ("cache.routeAnonymousUser.size", -1),
    ("cache.routeAnonymousUser.maxLifetime", -1),
    ("cache.routeUserSessions.size", -1),
    ("cache.routeUserSessions.maxLifetime", -1),
    ("cache.directedPresences.size", -1),
    ("cache.directedPresences.maxLifetime", -1),
    ("cache.offlinePresence.size", 512 * 1024),
    ("cache.lastActivity.size", 128 * 1024),
    ("cache.group.size", 1024 * 1024),
    ("cache.group.maxLifetime", 15 * MINUTE),
    ("cache.groupMeta.size", 512 * 1024),
    ("cache.groupMeta.maxLifetime", 15 * MINUTE),
    ("cache.userCache.size", 512 * 1024),
    ("cache.userCache.maxLifetime", 30 * MINUTE),
    ("cache.remoteUsersCache.size", 512 * 1024),
    ("cache.remoteUsersCache.maxLifetime", 30 * MINUTE),
    ("cache.multicast.size", 128 * 1024),
    ("cache.multicast.maxLifetime", DAY),
    ("cache.entityCapabilities.size", -1),
    ("cache.entityCapabilities.maxLifetime", 2 * DAY),
    ("cache.entityCapabilitiesUsers.size", -1),
    ("cache.entityCapabilitiesUsers.maxLifetime", 2 * DAY),
    ("cache.serverFeatures.size", -1),
    ("cache.serverFeatures.maxLifetime", -1),
    ("cache.serverItems.size", -1),
    ("cache.serverItems.maxLifetime", -1),
];

/// Sizing of one named cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum size in bytes, negative for unbounded
    pub max_size: i64,
    /// Maximum entry lifetime in milliseconds, non-positive for infinite
    pub max_lifetime_ms: i64,
    /// Minimum size hint for clustered backends, negative when unset
    pub min_size: i64,
}

impl CacheConfig {
    /// Unbounded cache whose entries never expire.
    pub fn unbounded() -> Self {
        Self {
            max_size: -1,
            max_lifetime_ms: -1,
            min_size: -1,
        }
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        if self.max_lifetime_ms > 0 {
            Some(Duration::from_millis(self.max_lifetime_ms as u64))
        } else {
            None
        }
    }
}

/// Storage swap hooks, type-erased over the cache's key and value types.
trait StrategySwap: Send + Sync {
    fn use_clustered(&self, backend: &Arc<dyn ClusterBackend>);
    fn use_local(&self, locks: &Arc<LocalLockManager>);
    fn clear(&self);
}

impl<K: CacheKey, V: CacheValue> StrategySwap for CacheSlot<K, V> {
    fn use_clustered(&self, backend: &Arc<dyn ClusterBackend>) {
        self.swap(Arc::new(ClusteredCache::new(
            &self.name,
            self.config,
            Arc::clone(backend),
        )));
    }

    fn use_local(&self, locks: &Arc<LocalLockManager>) {
        self.swap(Arc::new(LocalCache::new(
            &self.name,
            self.config,
            Arc::clone(locks),
        )));
    }

    fn clear(&self) {
        self.current.read().clear();
    }
}

struct RegisteredCache {
    swap: Arc<dyn StrategySwap>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// Creates named caches and swaps their strategy when clustering changes.
pub struct CacheFactory {
    properties: Arc<ServerProperties>,
    locks: Arc<LocalLockManager>,
    caches: RwLock<HashMap<String, RegisteredCache>>,
    backend: RwLock<Option<Arc<dyn ClusterBackend>>>,
}

impl CacheFactory {
    pub fn new(properties: Arc<ServerProperties>) -> Self {
        Self {
            properties,
            locks: LocalLockManager::new(),
            caches: RwLock::new(HashMap::new()),
            backend: RwLock::new(None),
        }
    }

    /// Return the cache registered under `name`, creating it on first use.
    ///
    /// Sizing properties are read only when the cache is first created.
    pub fn create_cache<K: CacheKey, V: CacheValue>(
        &self,
        name: &str,
    ) -> Result<CacheHandle<K, V>, CacheError> {
        let mut caches = self.caches.write();
        if let Some(existing) = caches.get(name) {
            return Arc::clone(&existing.typed)
                .downcast::<CacheSlot<K, V>>()
                .map(CacheHandle::from_slot)
                .map_err(|_| CacheError::TypeMismatch(name.to_string()));
        }

        let config = self.cache_config(name);
        let initial: Arc<dyn Cache<K, V>> = match self.backend.read().as_ref() {
            Some(backend) => Arc::new(ClusteredCache::new(name, config, Arc::clone(backend))),
            None => Arc::new(LocalCache::new(name, config, Arc::clone(&self.locks))),
        };
        let slot = Arc::new(CacheSlot::new(name, config, initial));
        caches.insert(
            name.to_string(),
            RegisteredCache {
                swap: slot.clone(),
                typed: slot.clone(),
            },
        );
        debug!(cache = name, ?config, "Cache created");
        Ok(CacheHandle::from_slot(slot))
    }

    /// Forget a cache. Existing handles keep their storage.
    pub fn destroy_cache(&self, name: &str) -> bool {
        self.caches.write().remove(name).is_some()
    }

    /// Clear every registered cache.
    pub fn clear_caches(&self) {
        for cache in self.caches.read().values() {
            cache.swap.clear();
        }
    }

    /// Names of registered caches, sorted.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether caches are currently backed by the cluster.
    pub fn is_clustered(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Lock service used by local caches.
    pub fn local_locks(&self) -> &Arc<LocalLockManager> {
        &self.locks
    }

    /// Move every cache onto the cluster backend.
    pub fn start_clustering(&self, backend: Arc<dyn ClusterBackend>) {
        let caches = self.caches.read();
        *self.backend.write() = Some(Arc::clone(&backend));
        for cache in caches.values() {
            cache.swap.use_clustered(&backend);
        }
        info!(caches = caches.len(), "Caches switched to clustered strategy");
    }

    /// Move every cache back to local storage.
    pub fn stop_clustering(&self) {
        let caches = self.caches.read();
        *self.backend.write() = None;
        for cache in caches.values() {
            cache.swap.use_local(&self.locks);
        }
        info!(caches = caches.len(), "Caches switched to local strategy");
    }

    /// Sizing for `name` from properties, the defaults table, then globals.
    pub fn cache_config(&self, name: &str) -> CacheConfig {
        CacheConfig {
            max_size: self.cache_property(name, ".size", DEFAULT_MAX_CACHE_SIZE),
            max_lifetime_ms: self.cache_property(name, ".maxLifetime", DEFAULT_MAX_CACHE_LIFETIME),
            min_size: self.cache_property(name, ".min", -1),
        }
    }

    fn cache_property(&self, name: &str, suffix: &str, default: i64) -> i64 {
        let mut property = format!("cache.{}{}", name.replace(' ', ""), suffix);
        let mut value = self.properties.get(&property);
        if value.is_none() {
            if let Some(short) = short_name(name) {
                property = format!("cache.{}{}", short, suffix);
                value = self.properties.get(&property);
            }
        }
        if let Some(value) = value {
            match value.trim().parse::<i64>() {
                Ok(v) => return v,
                Err(_) => {
                    tracing::warn!(property = %property, value = %value, "Unable to parse cache property, using default");
                }
            }
        }
        DEFAULTS
            .iter()
            .find(|(key, _)| *key == property)
            .map(|(_, v)| *v)
            .unwrap_or(default)
    }
}

fn short_name(name: &str) -> Option<&'static str> {
    SHORT_NAMES
        .iter()
        .find(|(display, _)| *display == name)
        .map(|(_, short)| *short)
}
