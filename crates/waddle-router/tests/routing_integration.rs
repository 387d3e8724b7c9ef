//! Routing Integration Tests
//!
//! Drive the routers end to end on a single node through in-memory client
//! connections:
//! - presence fan-out versus single-resource message delivery
//! - resource availability and bare JID fallback
//! - components, administrators and the offline strategies
//!
//! Run with: `cargo test -p waddle-router --test routing_integration`

mod common;

use std::sync::Arc;

use common::*;
use minidom::Element;
use parking_lot::Mutex;
use waddle_router::provider::{MemoryOfflineStore, Providers};
use waddle_router::routing::RoutableChannel;
use waddle_router::{ns, IqType, PresenceType, ServerContext, Stanza, StanzaKind};

// =============================================================================
// Fan-out
// =============================================================================

/// Presence from a contact reaches every available resource while a
/// message to the bare JID reaches exactly one.
#[tokio::test]
async fn test_presence_fans_out_message_does_not() {
    init_test();
    let ctx = context();
    let mut resources = Vec::new();
    for name in ["a", "b", "c"] {
        let (session, conn) = bind(&ctx, "alice", name).await;
        available(&ctx, &session, 1);
        resources.push((session, conn));
    }
    let (bob, _) = bind(&ctx, "bob", "phone").await;
    available(&ctx, &bob, 0);
    for (_, conn) in &resources {
        conn.clear();
    }

    ctx.packet_router().route_from_session(
        &bob,
        presence(0).with_to(jid("alice@example.com")),
    );
    ctx.packet_router()
        .route_from_session(&bob, chat("alice@example.com", "one copy"));

    for (_, conn) in &resources {
        assert_eq!(conn.delivered_of(StanzaKind::Presence).len(), 1);
    }
    let copies: usize = resources
        .iter()
        .map(|(_, conn)| conn.delivered_of(StanzaKind::Message).len())
        .sum();
    assert_eq!(copies, 1, "bare JID message must reach exactly one resource");
}

/// With two resources, only the available one receives bare JID traffic,
/// and once it goes unavailable the message is kept offline.
#[tokio::test]
async fn test_unavailable_resource_is_skipped() {
    init_test();
    let store = Arc::new(MemoryOfflineStore::default());
    let ctx = ServerContext::builder()
        .domain(DOMAIN)
        .property("user.alice.password", "secret")
        .providers(Providers {
            offline_store: Some(store.clone()),
            ..Default::default()
        })
        .build()
        .unwrap();
    let (a, a_conn) = bind(&ctx, "alice", "a").await;
    let (_b, b_conn) = bind(&ctx, "alice", "b").await;
    let (bob, _) = bind(&ctx, "bob", "phone").await;
    available(&ctx, &a, 0);

    ctx.packet_router()
        .route_from_session(&bob, chat("alice@example.com", "first"));
    ctx.packet_router().route_from_session(
        &bob,
        presence(0).with_to(jid("alice@example.com")),
    );

    assert_eq!(a_conn.bodies(), vec!["first".to_string()]);
    assert!(b_conn.delivered_of(StanzaKind::Message).is_empty());
    assert!(b_conn.delivered_of(StanzaKind::Presence).is_empty());

    unavailable(&ctx, &a);
    ctx.packet_router()
        .route_from_session(&bob, chat("alice@example.com", "second"));

    assert_eq!(a_conn.bodies(), vec!["first".to_string()]);
    assert!(b_conn.delivered_of(StanzaKind::Message).is_empty());
    let stored = store.take(&jid("alice@example.com"));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].body().as_deref(), Some("second"));
}

/// Negative priority resources never get bare JID messages.
#[tokio::test]
async fn test_negative_priority_resource_is_not_selected() {
    init_test();
    let ctx = context_with(&[("xmpp.offline.type", "bounce")]);
    let (a, a_conn) = bind(&ctx, "alice", "bot").await;
    let (bob, bob_conn) = bind(&ctx, "bob", "phone").await;
    available(&ctx, &a, -1);

    ctx.packet_router()
        .route_from_session(&bob, chat("alice@example.com", "anyone?"));

    assert!(a_conn.delivered_of(StanzaKind::Message).is_empty());
    let bounced = bob_conn.delivered_of(StanzaKind::Message);
    assert_eq!(bounced.len(), 1);
    assert_eq!(bounced[0].error_condition().as_deref(), Some("service-unavailable"));
}

// =============================================================================
// Components
// =============================================================================

struct Component {
    address: jid::Jid,
    received: Mutex<Vec<Stanza>>,
}

impl RoutableChannel for Component {
    fn address(&self) -> jid::Jid {
        self.address.clone()
    }

    fn process(&self, stanza: Stanza) {
        self.received.lock().push(stanza);
    }
}

/// A component gets each stanza addressed to its domain exactly once.
#[tokio::test]
async fn test_component_receives_each_stanza_once() {
    init_test();
    let ctx = context();
    let component = Arc::new(Component {
        address: jid("pubsub.example.com"),
        received: Mutex::new(Vec::new()),
    });
    ctx.routing_table()
        .add_component_route("pubsub.example.com", component.clone())
        .unwrap();
    let (alice, _) = bind(&ctx, "alice", "desk").await;

    ctx.packet_router()
        .route_from_session(&alice, chat("pubsub.example.com", "to the service"));
    ctx.packet_router().route_from_session(
        &alice,
        Stanza::iq(IqType::Get, "items1", None).with_to(jid("node@pubsub.example.com")),
    );

    let received = component.received.lock().clone();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].from(), Some(&jid("alice@example.com/desk")));
    assert_eq!(received[1].id(), Some("items1"));
}

// =============================================================================
// Administrators
// =============================================================================

/// Messages to the server JID are forwarded to the configured admins with
/// body and thread intact.
#[tokio::test]
async fn test_server_message_forwarded_to_configured_admins() {
    init_test();
    let ctx = context_with(&[("xmpp.forward.admins", "ops, root@example.com")]);
    let (ops, ops_conn) = bind(&ctx, "ops", "console").await;
    let (root, root_conn) = bind(&ctx, "root", "shell").await;
    let (alice, _) = bind(&ctx, "alice", "desk").await;
    available(&ctx, &ops, 0);
    available(&ctx, &root, 0);

    let message = chat("example.com", "disk is full").with_child(
        Element::builder("thread", ns::JABBER_CLIENT)
            .append("incident-7")
            .build(),
    );
    ctx.packet_router().route_from_session(&alice, message);

    for conn in [&ops_conn, &root_conn] {
        let forwarded = conn.delivered_of(StanzaKind::Message);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].body().as_deref(), Some("disk is full"));
        assert_eq!(forwarded[0].thread().as_deref(), Some("incident-7"));
        assert_eq!(forwarded[0].from(), Some(&jid("alice@example.com/desk")));
    }
}

// =============================================================================
// Offline strategies
// =============================================================================

#[tokio::test]
async fn test_offline_drop_discards_silently() {
    init_test();
    let ctx = context_with(&[
        ("xmpp.offline.type", "drop"),
        ("user.carol.password", "secret"),
    ]);
    let (bob, bob_conn) = bind(&ctx, "bob", "phone").await;

    ctx.packet_router()
        .route_from_session(&bob, chat("carol@example.com", "lost"));

    assert!(bob_conn.delivered().is_empty());
}

#[tokio::test]
async fn test_offline_bounce_returns_error() {
    init_test();
    let ctx = context_with(&[
        ("xmpp.offline.type", "bounce"),
        ("user.carol.password", "secret"),
    ]);
    let (bob, bob_conn) = bind(&ctx, "bob", "phone").await;

    ctx.packet_router()
        .route_from_session(&bob, chat("carol@example.com", "returned").with_id("m1"));

    let bounced = bob_conn.delivered_of(StanzaKind::Message);
    assert_eq!(bounced.len(), 1);
    assert_eq!(bounced[0].id(), Some("m1"));
    assert_eq!(bounced[0].from(), Some(&jid("carol@example.com")));
    assert_eq!(bounced[0].error_condition().as_deref(), Some("service-unavailable"));
}

/// Groupchat and headline messages are never stored nor bounced.
#[tokio::test]
async fn test_offline_ignores_groupchat_and_headline() {
    init_test();
    let store = Arc::new(MemoryOfflineStore::default());
    let ctx = ServerContext::builder()
        .domain(DOMAIN)
        .property("user.carol.password", "secret")
        .providers(Providers {
            offline_store: Some(store.clone()),
            ..Default::default()
        })
        .build()
        .unwrap();
    let (bob, bob_conn) = bind(&ctx, "bob", "phone").await;

    for kind in ["groupchat", "headline"] {
        let message = Stanza::message(jid("carol@example.com"), "ephemeral").with_type(kind);
        ctx.packet_router().route_from_session(&bob, message);
    }

    assert_eq!(store.count(&jid("carol@example.com")), 0);
    assert!(bob_conn.delivered().is_empty());
}

/// Stanzas for a session whose connection is gone go to the backup
/// deliverer, which keeps messages offline.
#[tokio::test]
async fn test_closed_connection_uses_backup() {
    init_test();
    let store = Arc::new(MemoryOfflineStore::default());
    let ctx = ServerContext::builder()
        .domain(DOMAIN)
        .property("user.carol.password", "secret")
        .providers(Providers {
            offline_store: Some(store.clone()),
            ..Default::default()
        })
        .build()
        .unwrap();
    let (carol, conn) = bind(&ctx, "carol", "laptop").await;
    carol.close().await;

    carol.process(
        chat("carol@example.com/laptop", "after close").with_from(jid("bob@example.com/phone")),
    );
    carol.process(Stanza::presence(PresenceType::Available).with_from(jid("bob@example.com/phone")));

    assert!(conn.delivered().is_empty());
    let stored = store.take(&jid("carol@example.com"));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].body().as_deref(), Some("after close"));
}

// =============================================================================
// Directed presence
// =============================================================================

/// Closing a session retracts its directed presence and leaves no
/// tracking state behind.
#[tokio::test]
async fn test_directed_presence_cleaned_up_on_close() {
    init_test();
    let ctx = context();
    let (alice, _) = bind(&ctx, "alice", "desk").await;
    let (bob, bob_conn) = bind(&ctx, "bob", "phone").await;
    available(&ctx, &alice, 0);
    available(&ctx, &bob, 0);
    bob_conn.clear();

    ctx.packet_router().route_from_session(
        &alice,
        presence(0).with_to(jid("bob@example.com/phone")),
    );
    assert!(!ctx.directed_presences().is_empty());

    alice.close().await;

    let seen = bob_conn.delivered_of(StanzaKind::Presence);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].presence_type(), Some(PresenceType::Unavailable));
    assert_eq!(seen[1].from(), Some(&jid("alice@example.com/desk")));
    assert!(ctx.directed_presences().is_empty());
    assert!(!ctx.routing_table().has_client_route(&jid("alice@example.com/desk")));
}

/// A session that never sent broadcast presence may still have directed
/// presence; its receivers learn it is gone when it closes.
#[tokio::test]
async fn test_directed_presence_from_never_available_session_retracted() {
    init_test();
    let ctx = context();
    let (alice, _) = bind(&ctx, "alice", "desk").await;
    let (bob, bob_conn) = bind(&ctx, "bob", "phone").await;
    available(&ctx, &bob, 0);
    bob_conn.clear();

    ctx.packet_router().route_from_session(
        &alice,
        presence(0).with_to(jid("bob@example.com/phone")),
    );
    assert!(!alice.is_available());
    assert_eq!(ctx.directed_presences().len(), 1);
    assert_eq!(bob_conn.delivered_of(StanzaKind::Presence).len(), 1);

    alice.close().await;

    let seen = bob_conn.delivered_of(StanzaKind::Presence);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].presence_type(), Some(PresenceType::Unavailable));
    assert_eq!(seen[1].from(), Some(&jid("alice@example.com/desk")));
    assert!(ctx.directed_presences().is_empty());
}

// =============================================================================
// IQ errors
// =============================================================================

#[tokio::test]
async fn test_iq_error_replies() {
    init_test();
    let ctx = context();
    let (alice, conn) = bind(&ctx, "alice", "desk").await;
    let query = || Element::builder("query", "jabber:iq:version").build();

    let requests = [
        ("e1", "example.com", "feature-not-implemented"),
        ("e2", "bob@example.com", "service-unavailable"),
        ("e3", "bob@example.com/gone", "service-unavailable"),
        ("e4", "someone@far.away/x", "remote-server-not-found"),
    ];
    for (id, to, _) in &requests {
        let iq = Stanza::iq(IqType::Get, id, Some(query())).with_to(jid(to));
        ctx.packet_router().route_from_session(&alice, iq);
    }

    let replies = conn.delivered_of(StanzaKind::Iq);
    assert_eq!(replies.len(), requests.len());
    for (id, _, condition) in &requests {
        let reply = replies
            .iter()
            .find(|r| r.id() == Some(*id))
            .unwrap_or_else(|| panic!("no reply for {}", id));
        assert_eq!(reply.error_condition().as_deref(), Some(*condition), "reply to {}", id);
    }
}

// =============================================================================
// Locks
// =============================================================================

/// Key locks are dropped once released, however many users come and go.
#[tokio::test]
async fn test_lock_map_does_not_leak() {
    init_test();
    let ctx = context();
    for i in 0..50 {
        let (session, _) = bind(&ctx, &format!("user{}", i), "r").await;
        available(&ctx, &session, 0);
        ctx.packet_router().route_from_session(
            &session,
            presence(0).with_to(jid("watcher@example.com/x")),
        );
        session.close().await;
    }

    assert_eq!(ctx.session_manager().session_count(), 0);
    assert_eq!(ctx.routing_table().client_route_count(), 0);
    assert!(ctx.cache_factory().local_locks().is_empty());
}
