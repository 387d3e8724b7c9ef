//! Routing metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application. Without one the no-op meter is used.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-router"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for stanzas handed to the routing table.
pub fn stanzas_routed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.routed")
        .with_description("Total stanzas routed")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas that found no route.
pub fn routing_failures() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.routing.failed")
        .with_description("Total stanzas for which routing failed")
        .with_unit("stanza")
        .build()
}

/// Counter for stanzas rejected by interceptors.
pub fn interceptor_rejections() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.interceptor.rejected")
        .with_description("Total stanzas rejected by interceptors")
        .with_unit("stanza")
        .build()
}

/// Counter for failed connection writes.
pub fn delivery_failures() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.connection.delivery_failures")
        .with_description("Total writes that failed and fell back to the backup deliverer")
        .with_unit("stanza")
        .build()
}

/// Counter for cache evictions.
pub fn cache_evictions() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.cache.evictions")
        .with_description("Total cache entries evicted for size or lifetime")
        .with_unit("entry")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for bound client sessions on this node.
pub fn sessions_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.sessions.active")
        .with_description("Current number of bound client sessions")
        .with_unit("session")
        .build()
}

/// Gauge for open connections on this node.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.connections.active")
        .with_description("Current number of open client connections")
        .with_unit("connection")
        .build()
}

/// Gauge for cluster members.
pub fn cluster_members() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.cluster.members")
        .with_description("Current number of cluster members")
        .with_unit("node")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a routing outcome.
pub fn record_routed(stanza_type: &str, outcome: &str) {
    stanzas_routed().add(
        1,
        &[
            KeyValue::new("type", stanza_type.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ],
    );
}

/// Record a routing failure.
pub fn record_routing_failed(stanza_type: &str) {
    routing_failures().add(1, &[KeyValue::new("type", stanza_type.to_string())]);
}

/// Record an interceptor rejection.
pub fn record_rejected(stanza_type: &str) {
    interceptor_rejections().add(1, &[KeyValue::new("type", stanza_type.to_string())]);
}

/// Record a failed connection write.
pub fn record_delivery_failure() {
    delivery_failures().add(1, &[]);
}

/// Record cache evictions.
pub fn record_evictions(cache: &str, count: u64) {
    if count > 0 {
        cache_evictions().add(count, &[KeyValue::new("cache", cache.to_string())]);
    }
}

/// Record the current session count.
pub fn record_sessions(count: i64) {
    sessions_active().record(count, &[]);
}

/// Record the current connection count.
pub fn record_connections(count: i64) {
    connections_active().record(count, &[]);
}

/// Record the current cluster size.
pub fn record_cluster_members(count: i64) {
    cluster_members().record(count, &[]);
}
