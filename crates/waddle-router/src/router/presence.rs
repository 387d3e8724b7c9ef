//! Presence routing.

use std::sync::{Arc, Weak};

use jid::Jid;
use tracing::{debug, instrument};

use crate::context::ServerContext;
use crate::error::{PacketRejected, StanzaErrorCondition, StanzaErrorType};
use crate::session::ClientSession;
use crate::stanza::{PresenceType, Stanza};

/// Routes presence stanzas.
///
/// Presence to the server updates the sender's own presence, subscription
/// management goes to the subscription handler, probes are answered from
/// presence state and everything else is directed presence fanned out to
/// the recipient's routes.
pub struct PresenceRouter {
    ctx: Weak<ServerContext>,
}

impl PresenceRouter {
    pub fn new(ctx: Weak<ServerContext>) -> Self {
        Self { ctx }
    }

    #[instrument(name = "xmpp.route.presence", skip_all, fields(to = ?presence.to(), from = ?presence.from()))]
    pub fn route(&self, presence: Stanza, session: Option<&Arc<ClientSession>>) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let interceptors = ctx.interceptors();
        if let Err(rejected) = interceptors.invoke(&presence, session, true, false) {
            self.rejected(&ctx, &presence, session, rejected);
            return;
        }
        self.handle(&ctx, presence.clone(), session);
        let _ = interceptors.invoke(&presence, session, true, true);
    }

    fn handle(&self, ctx: &ServerContext, presence: Stanza, session: Option<&Arc<ClientSession>>) {
        let to_server = match presence.to() {
            None => true,
            Some(to) => {
                to.node().is_none() && to.resource().is_none() && to.domain().as_str() == ctx.domain()
            }
        };
        let presence_type = presence.presence_type();

        if to_server {
            self.deliver_to_server(ctx, presence, session);
            return;
        }

        if let Some(from) = presence.from() {
            if self.is_remote(ctx, from) {
                self.notify_remote_listeners(ctx, &presence);
            }
        }

        match presence_type {
            Some(t) if t.is_subscription() => self.subscription(ctx, presence),
            Some(PresenceType::Probe) => self.probe(ctx, presence),
            Some(_) => self.directed(ctx, presence, session),
            None => {
                debug!(presence_type = ?presence.stanza_type(), "Unknown presence type");
                if let Some(session) = session {
                    session.process(presence.error_reply(
                        StanzaErrorCondition::BadRequest,
                        StanzaErrorType::Modify,
                        None,
                    ));
                }
            }
        }
    }

    /// Presence addressed to the server itself, either from a client or
    /// reached through the routing table.
    pub fn deliver_to_server(
        &self,
        ctx: &ServerContext,
        presence: Stanza,
        session: Option<&Arc<ClientSession>>,
    ) {
        match presence.presence_type() {
            Some(PresenceType::Available) | Some(PresenceType::Unavailable) => {}
            Some(t) if t.is_subscription() => {
                match ctx.providers().subscriptions.as_ref() {
                    Some(handler) => handler.process(ctx, presence),
                    None => debug!("No subscription handler, dropping subscription request"),
                }
                return;
            }
            _ => {
                debug!(presence_type = ?presence.stanza_type(), "Ignoring presence addressed to the server");
                return;
            }
        }
        if let Some(caps) = ctx.providers().entity_caps.as_ref() {
            caps.process(&presence);
        }
        let session = session.cloned().or_else(|| {
            presence
                .from()
                .and_then(|from| ctx.session_manager().session(from))
        });
        match session {
            Some(session) => ctx.presence_update_handler().process(&session, presence),
            None => debug!(from = ?presence.from(), "Presence update without a local session"),
        }
    }

    fn subscription(&self, ctx: &ServerContext, presence: Stanza) {
        if let Some(handler) = ctx.providers().subscriptions.as_ref() {
            handler.process(ctx, presence);
            return;
        }
        let Some(to) = presence.to() else {
            return;
        };
        let bare = Jid::from(to.to_bare());
        ctx.routing_table().route_packet(&bare, presence, false);
    }

    fn probe(&self, ctx: &ServerContext, presence: Stanza) {
        let Some(to) = presence.to().cloned() else {
            return;
        };
        if to.domain().as_str() == ctx.domain() {
            ctx.presence_manager().handle_probe(&presence);
        } else {
            ctx.routing_table().route_packet(&to, presence, false);
        }
    }

    /// Presence sent to a specific entity outside the roster broadcast.
    fn directed(&self, ctx: &ServerContext, presence: Stanza, session: Option<&Arc<ClientSession>>) {
        let Some(to) = presence.to().cloned() else {
            return;
        };
        let routing = ctx.routing_table();
        let routes = routing.get_routes(&to, presence.from());
        if routes.is_empty() {
            routing.route_packet(&to, presence, false);
            return;
        }
        let receiver = to.to_string();
        for route in routes {
            if let Some(session) = session {
                ctx.presence_update_handler()
                    .directed_presence_sent(session, &presence, &route, &receiver);
            }
            routing.route_packet(&route, presence.clone(), false);
        }
    }

    fn is_remote(&self, ctx: &ServerContext, from: &Jid) -> bool {
        let domain = from.domain().as_str();
        domain != ctx.domain() && !ctx.routing_table().has_component_route(domain)
    }

    fn notify_remote_listeners(&self, ctx: &ServerContext, presence: &Stanza) {
        let listeners = &ctx.providers().remote_presence_listeners;
        match presence.presence_type() {
            Some(PresenceType::Available) => {
                for listener in listeners {
                    listener.remote_user_available(presence);
                }
            }
            Some(PresenceType::Unavailable) => {
                for listener in listeners {
                    listener.remote_user_unavailable(presence);
                }
            }
            _ => {}
        }
    }

    fn rejected(
        &self,
        ctx: &ServerContext,
        presence: &Stanza,
        session: Option<&Arc<ClientSession>>,
        rejected: PacketRejected,
    ) {
        let Some(session) = session else {
            return;
        };
        session.process(presence.error_reply(
            StanzaErrorCondition::NotAllowed,
            StanzaErrorType::Cancel,
            None,
        ));
        if let Some(text) = rejected.message {
            let notice = Stanza::message(session.address(), &text)
                .with_from(ctx.server_jid());
            session.process(notice);
        }
    }

    /// Presence could not be routed. Presence loss is not retried.
    pub fn routing_failed(&self, to: &Jid, presence: Stanza) {
        debug!(to = %to, presence_type = ?presence.stanza_type(), "Dropping unroutable presence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::RemotePresenceListener;
    use crate::stanza::StanzaKind;
    use crate::testing::{available_presence, bound_session, context, go_available};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_presence_update_reaches_other_resources() {
        let ctx = context();
        let (a, a_conn) = bound_session(&ctx, "alice", "a").await;
        let (b, b_conn) = bound_session(&ctx, "alice", "b").await;
        go_available(&ctx, &a, 1);
        go_available(&ctx, &b, 1);
        a_conn.clear();
        b_conn.clear();

        go_available(&ctx, &a, 3);

        let seen = b_conn.delivered_of(StanzaKind::Presence);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].from(), Some(&jid("alice@example.com/a")));
        assert_eq!(seen[0].priority(), 3);
        assert!(a_conn.delivered_of(StanzaKind::Presence).is_empty());
    }

    #[tokio::test]
    async fn test_new_resource_learns_existing_resources() {
        let ctx = context();
        let (a, _) = bound_session(&ctx, "alice", "a").await;
        let (b, b_conn) = bound_session(&ctx, "alice", "b").await;
        go_available(&ctx, &a, 1);

        go_available(&ctx, &b, 0);

        let seen = b_conn.delivered_of(StanzaKind::Presence);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].from(), Some(&jid("alice@example.com/a")));
    }

    #[tokio::test]
    async fn test_directed_presence_tracked_and_retracted() {
        let ctx = context();
        let (alice, _) = bound_session(&ctx, "alice", "a").await;
        let (bob, bob_conn) = bound_session(&ctx, "bob", "phone").await;
        go_available(&ctx, &alice, 0);
        go_available(&ctx, &bob, 0);
        bob_conn.clear();

        let directed = available_presence(0).with_to(jid("bob@example.com/phone"));
        ctx.packet_router().route_from_session(&alice, directed);

        let sender = jid("alice@example.com/a");
        let records = ctx.directed_presences().get(&sender);
        assert_eq!(records.len(), 1);
        assert!(records[0].receivers.contains("bob@example.com/phone"));
        assert_eq!(bob_conn.delivered_of(StanzaKind::Presence).len(), 1);

        ctx.packet_router()
            .route_from_session(&alice, Stanza::presence(PresenceType::Unavailable));

        let seen = bob_conn.delivered_of(StanzaKind::Presence);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].presence_type(), Some(PresenceType::Unavailable));
        assert_eq!(seen[1].from(), Some(&sender));
        assert!(ctx.directed_presences().get(&sender).is_empty());
    }

    #[tokio::test]
    async fn test_directed_unavailable_forgets_receiver() {
        let ctx = context();
        let (alice, _) = bound_session(&ctx, "alice", "a").await;
        let (bob, _) = bound_session(&ctx, "bob", "phone").await;
        go_available(&ctx, &alice, 0);
        go_available(&ctx, &bob, 0);

        let to = jid("bob@example.com/phone");
        ctx.packet_router()
            .route_from_session(&alice, available_presence(0).with_to(to.clone()));
        ctx.packet_router().route_from_session(
            &alice,
            Stanza::presence(PresenceType::Unavailable).with_to(to),
        );

        assert!(ctx.directed_presences().get(&jid("alice@example.com/a")).is_empty());
        assert!(ctx.directed_presences().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_presence_type_is_bad_request() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "a").await;

        let presence = Stanza::presence(PresenceType::Available)
            .with_type("sleepy")
            .with_to(jid("bob@example.com"));
        ctx.packet_router().route_from_session(&alice, presence);

        let replies = conn.delivered_of(StanzaKind::Presence);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].error_condition().as_deref(), Some("bad-request"));
    }

    #[tokio::test]
    async fn test_probe_answered_with_current_presence() {
        let ctx = context();
        let (alice, alice_conn) = bound_session(&ctx, "alice", "a").await;
        let (bob, _) = bound_session(&ctx, "bob", "phone").await;
        go_available(&ctx, &bob, 2);

        let probe = Stanza::presence(PresenceType::Probe).with_to(jid("bob@example.com"));
        ctx.packet_router().route_from_session(&alice, probe);

        let answers = alice_conn.delivered_of(StanzaKind::Presence);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].from(), Some(&jid("bob@example.com/phone")));
        assert_eq!(answers[0].priority(), 2);
    }

    #[derive(Default)]
    struct CountingListener {
        available: AtomicUsize,
        unavailable: AtomicUsize,
    }

    impl RemotePresenceListener for CountingListener {
        fn remote_user_available(&self, _presence: &Stanza) {
            self.available.fetch_add(1, Ordering::SeqCst);
        }

        fn remote_user_unavailable(&self, _presence: &Stanza) {
            self.unavailable.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_remote_presence_notifies_listeners() {
        let listener = Arc::new(CountingListener::default());
        let ctx = ServerContext::builder()
            .domain("example.com")
            .remote_presence_listener(listener.clone())
            .build()
            .unwrap();
        let (alice, conn) = bound_session(&ctx, "alice", "a").await;
        go_available(&ctx, &alice, 0);

        let from = jid("carol@remote.org/home");
        ctx.packet_router().route(
            available_presence(0)
                .with_from(from.clone())
                .with_to(jid("alice@example.com")),
        );
        ctx.packet_router().route(
            Stanza::presence(PresenceType::Unavailable)
                .with_from(from)
                .with_to(jid("alice@example.com")),
        );

        assert_eq!(listener.available.load(Ordering::SeqCst), 1);
        assert_eq!(listener.unavailable.load(Ordering::SeqCst), 1);
        assert_eq!(conn.delivered_of(StanzaKind::Presence).len(), 2);
    }
}
