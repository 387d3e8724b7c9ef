//! Server property store.
//!
//! A flat `dotted.name -> value` map read by every component through typed
//! getters. The process entry point populates it from a TOML file, the
//! environment and command line overrides; tests populate it directly.
//!
//! # Well-known properties
//!
//! - `xmpp.domain`: served domain (default `localhost`)
//! - `xmpp.forward.admins`: recipients of messages sent to the server JID
//! - `xmpp.client.idle`: client idle window in ms (default 360000, -1 disables)
//! - `xmpp.processing.threads`: stanza worker pool width (default CPU count)
//! - `connection.ack.timeout`: closing-tag write timeout in ms (default 2000)
//! - `clustering.enabled`: start clustering at boot (default false)
//! - `route.all-resources`: deliver bare-JID messages to every top resource

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::warn;

/// Served domain.
pub const XMPP_DOMAIN: &str = "xmpp.domain";
/// Admin recipients of messages sent to the server itself.
pub const FORWARD_ADMINS: &str = "xmpp.forward.admins";
/// Client idle timeout in milliseconds.
pub const CLIENT_IDLE: &str = "xmpp.client.idle";
/// Stanza worker pool width.
pub const PROCESSING_THREADS: &str = "xmpp.processing.threads";
/// Per-worker inbound queue depth.
pub const PROCESSING_QUEUE: &str = "xmpp.processing.queue";
/// Timeout of the synchronous closing-tag write in milliseconds.
pub const ACK_TIMEOUT: &str = "connection.ack.timeout";
/// Outbound queue depth of a connection.
pub const CONNECTION_QUEUE: &str = "connection.queue.size";
/// Whether clustering should be started.
pub const CLUSTERING_ENABLED: &str = "clustering.enabled";
/// Bare-JID message fan-out policy.
pub const ROUTE_ALL_RESOURCES: &str = "route.all-resources";
/// Offline message strategy.
pub const OFFLINE_TYPE: &str = "xmpp.offline.type";
/// Client listener address.
pub const C2S_LISTEN: &str = "c2s.listen";
/// Comma separated admin accounts.
pub const ADMIN_JIDS: &str = "admin.authorizedJIDs";
/// Authentication provider implementation.
pub const PROVIDER_AUTH: &str = "provider.auth.type";
/// User provider implementation.
pub const PROVIDER_USER: &str = "provider.user.type";
/// Admin provider implementation.
pub const PROVIDER_ADMIN: &str = "provider.admin.type";
/// Offline message store implementation.
pub const PROVIDER_OFFLINE: &str = "provider.offline.type";
/// Whether SASL ANONYMOUS is offered.
pub const ANONYMOUS_LOGIN: &str = "xmpp.auth.anonymous";

/// Default client idle window (6 minutes).
pub const DEFAULT_CLIENT_IDLE_MS: i64 = 360_000;
/// Default synchronous write timeout.
pub const DEFAULT_ACK_TIMEOUT_MS: i64 = 2_000;
/// Default outbound queue depth.
pub const DEFAULT_CONNECTION_QUEUE: usize = 256;
/// Default inbound queue depth per worker.
pub const DEFAULT_PROCESSING_QUEUE: usize = 1024;
/// Default client listener address.
pub const DEFAULT_C2S_LISTEN: &str = "0.0.0.0:5222";

/// Process-wide property store.
#[derive(Debug, Default)]
pub struct ServerProperties {
    values: RwLock<HashMap<String, String>>,
}

impl ServerProperties {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }

    /// Raw property value.
    pub fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    /// Set a property, returning the previous value.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.write().insert(name.into(), value.into())
    }

    /// Remove a property.
    pub fn remove(&self, name: &str) -> Option<String> {
        self.values.write().remove(name)
    }

    /// Whether the property is set.
    pub fn contains(&self, name: &str) -> bool {
        self.values.read().contains_key(name)
    }

    /// String value or default.
    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    /// Boolean value; `true`/`false` case-insensitively, anything else is the default.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name) {
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            Some(v) => {
                warn!(property = name, value = %v, "Ignoring non-boolean property value");
                default
            }
            None => default,
        }
    }

    /// Signed integer value or default.
    pub fn get_long(&self, name: &str, default: i64) -> i64 {
        self.parse(name).unwrap_or(default)
    }

    /// Unsigned size value or default.
    pub fn get_usize(&self, name: &str, default: usize) -> usize {
        self.parse(name).unwrap_or(default)
    }

    /// Parse a property into any `FromStr` type, logging unparseable values.
    pub fn parse<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.get(name)?;
        match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(property = name, value = %raw, "Ignoring unparseable property value");
                None
            }
        }
    }

    /// Millisecond duration; negative values mean "disabled" and yield `None`.
    pub fn get_duration_ms(&self, name: &str, default_ms: i64) -> Option<Duration> {
        let ms = self.get_long(name, default_ms);
        if ms < 0 {
            None
        } else {
            Some(Duration::from_millis(ms as u64))
        }
    }

    /// List value split on commas and whitespace.
    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Property names starting with the given prefix.
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .values
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Served XMPP domain.
    pub fn domain(&self) -> String {
        self.get_or(XMPP_DOMAIN, "localhost")
    }

    /// Client idle window, `None` when disabled.
    pub fn client_idle(&self) -> Option<Duration> {
        self.get_duration_ms(CLIENT_IDLE, DEFAULT_CLIENT_IDLE_MS)
    }

    /// Timeout of the synchronous closing-tag write.
    pub fn ack_timeout(&self) -> Duration {
        self.get_duration_ms(ACK_TIMEOUT, DEFAULT_ACK_TIMEOUT_MS)
            .unwrap_or(Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS as u64))
    }

    /// Width of the stanza worker pool.
    pub fn processing_threads(&self) -> usize {
        let default = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.get_usize(PROCESSING_THREADS, default).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let props = ServerProperties::from_pairs([
            ("xmpp.domain", "example.com"),
            ("route.all-resources", "TRUE"),
            ("connection.ack.timeout", "1500"),
            ("xmpp.client.idle", "-1"),
        ]);

        assert_eq!(props.domain(), "example.com");
        assert!(props.get_bool(ROUTE_ALL_RESOURCES, false));
        assert_eq!(props.ack_timeout(), Duration::from_millis(1500));
        assert_eq!(props.client_idle(), None);
    }

    #[test]
    fn test_defaults_when_missing_or_invalid() {
        let props = ServerProperties::from_pairs([("connection.ack.timeout", "soon")]);

        assert_eq!(props.domain(), "localhost");
        assert_eq!(props.ack_timeout(), Duration::from_millis(2000));
        assert_eq!(
            props.client_idle(),
            Some(Duration::from_millis(DEFAULT_CLIENT_IDLE_MS as u64))
        );
        assert!(!props.get_bool(CLUSTERING_ENABLED, false));
        assert!(props.processing_threads() >= 1);
    }

    #[test]
    fn test_list_splits_on_commas_and_spaces() {
        let props = ServerProperties::from_pairs([(FORWARD_ADMINS, "root, ops@example.com  ,audit")]);
        assert_eq!(
            props.get_list(FORWARD_ADMINS),
            vec!["root", "ops@example.com", "audit"]
        );
        assert!(props.get_list("missing").is_empty());
    }

    #[test]
    fn test_set_and_prefix_lookup() {
        let props = ServerProperties::new();
        props.set("cache.routeUser.size", "-1");
        props.set("cache.group.size", "1024");
        assert_eq!(
            props.names_with_prefix("cache."),
            vec!["cache.group.size", "cache.routeUser.size"]
        );
        assert_eq!(props.remove("cache.group.size").as_deref(), Some("1024"));
    }
}
