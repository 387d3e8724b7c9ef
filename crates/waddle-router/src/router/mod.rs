//! Stanza routers.
//!
//! [`PacketRouter`] is the entry point for every stanza entering the core.
//! It dispatches on the stanza kind to the presence, message and IQ
//! routers, which run the incoming interceptors, resolve the recipient
//! through the routing table and handle routing failures.

mod interceptor;
mod iq;
mod message;
mod offline;
mod presence;
mod presence_manager;
mod presence_update;

use std::sync::{Arc, Weak};

use jid::Jid;
use tracing::{debug, warn};

pub use interceptor::{InterceptorManager, PacketInterceptor};
pub use iq::{IqHandler, IqRouter, PingHandler, SessionHandler};
pub use message::MessageRouter;
pub use offline::{OfflineMessageStrategy, OfflineType};
pub use presence::PresenceRouter;
pub use presence_manager::{
    PresenceCaches, PresenceManager, LAST_ACTIVITY_CACHE, OFFLINE_PRESENCE_CACHE,
};
pub use presence_update::PresenceUpdateHandler;

use crate::context::ServerContext;
use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::session::ClientSession;
use crate::stanza::{Stanza, StanzaKind};

/// Dispatches stanzas to the router of their kind.
pub struct PacketRouter {
    ctx: Weak<ServerContext>,
}

impl PacketRouter {
    pub fn new(ctx: Weak<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Route a stanza read from a client session.
    ///
    /// The sender address is stamped from the session. Sessions that have
    /// not bound a resource get a `not-authorized` error back.
    pub fn route_from_session(&self, session: &Arc<ClientSession>, mut stanza: Stanza) {
        if session.is_closed() {
            debug!(stream_id = %session.stream_id(), "Ignoring stanza from closed session");
            return;
        }
        session.record_inbound();
        if !session.is_authenticated() || !session.is_bound() {
            debug!(stream_id = %session.stream_id(), kind = stanza.name(), "Stanza before authentication");
            if !stanza.is_error() {
                session.process(stanza.error_reply(
                    StanzaErrorCondition::NotAuthorized,
                    StanzaErrorType::Auth,
                    None,
                ));
            }
            return;
        }
        stanza.set_from(Some(session.address()));
        self.dispatch(stanza, Some(session));
    }

    /// Route a stanza that did not come from a local client, such as one
    /// generated by a component or the server.
    pub fn route(&self, stanza: Stanza) {
        self.dispatch(stanza, None);
    }

    fn dispatch(&self, stanza: Stanza, session: Option<&Arc<ClientSession>>) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        match stanza.kind() {
            StanzaKind::Message => ctx.message_router().route(stanza, session),
            StanzaKind::Presence => ctx.presence_router().route(stanza, session),
            StanzaKind::Iq => ctx.iq_router().route(stanza, session),
        }
    }

    /// Handle a stanza the routing table resolved to the server itself.
    pub fn deliver_to_server(&self, stanza: Stanza) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        match stanza.kind() {
            StanzaKind::Message => ctx.message_router().deliver_to_server(&ctx, stanza),
            StanzaKind::Presence => ctx.presence_router().deliver_to_server(&ctx, stanza, None),
            StanzaKind::Iq => ctx.iq_router().deliver_to_server(&ctx, stanza),
        }
    }

    /// The routing table found no route for `to`.
    pub fn routing_failed(&self, to: &Jid, stanza: Stanza) {
        let Some(ctx) = self.ctx.upgrade() else {
            warn!(to = %to, "Routing failed after server shutdown");
            return;
        };
        match stanza.kind() {
            StanzaKind::Message => ctx.message_router().routing_failed(to, stanza),
            StanzaKind::Presence => ctx.presence_router().routing_failed(to, stanza),
            StanzaKind::Iq => ctx.iq_router().routing_failed(to, stanza),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::PresenceType;
    use crate::testing::{bound_session, context, go_available, RecordingConnection};

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_unbound_session_gets_not_authorized() {
        let ctx = context();
        let conn = RecordingConnection::new();
        let session = ctx.session_manager().create_client_session(conn.clone()).unwrap();

        let message = Stanza::message(jid("bob@example.com"), "hello").with_type("chat");
        ctx.packet_router().route_from_session(&session, message);

        let replies = conn.delivered();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].error_condition().as_deref(), Some("not-authorized"));
    }

    #[tokio::test]
    async fn test_sender_address_is_stamped() {
        let ctx = context();
        let (alice, _) = bound_session(&ctx, "alice", "desk").await;
        let (bob, bob_conn) = bound_session(&ctx, "bob", "phone").await;
        go_available(&ctx, &bob, 0);

        let spoofed = Stanza::message(jid("bob@example.com/phone"), "hi")
            .with_type("chat")
            .with_from(jid("admin@example.com/console"));
        ctx.packet_router().route_from_session(&alice, spoofed);

        let received = bob_conn.delivered_of(StanzaKind::Message);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from(), Some(&jid("alice@example.com/desk")));
        assert_eq!(alice.incoming_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_is_ignored() {
        let ctx = context();
        let (alice, _) = bound_session(&ctx, "alice", "desk").await;
        let (bob, bob_conn) = bound_session(&ctx, "bob", "phone").await;
        go_available(&ctx, &bob, 0);
        alice.close().await;

        ctx.packet_router().route_from_session(
            &alice,
            Stanza::message(jid("bob@example.com/phone"), "late").with_type("chat"),
        );

        assert!(bob_conn.delivered_of(StanzaKind::Message).is_empty());
    }

    #[tokio::test]
    async fn test_route_without_session_dispatches_by_kind() {
        let ctx = context();
        let (bob, bob_conn) = bound_session(&ctx, "bob", "phone").await;
        go_available(&ctx, &bob, 0);

        ctx.packet_router().route(
            Stanza::presence(PresenceType::Available)
                .with_from(jid("example.com"))
                .with_to(jid("bob@example.com/phone")),
        );
        ctx.packet_router().route(
            Stanza::message(jid("bob@example.com"), "notice").with_from(jid("example.com")),
        );

        assert_eq!(bob_conn.delivered_of(StanzaKind::Presence).len(), 1);
        assert_eq!(bob_conn.delivered_of(StanzaKind::Message).len(), 1);
    }
}
