//! IQ routing and the handler table.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, instrument, warn};

use crate::context::ServerContext;
use crate::error::{PacketRejected, RouterError, StanzaErrorCondition, StanzaErrorType};
use crate::session::ClientSession;
use crate::stanza::{ns, IqType, Stanza};

/// Handles IQ requests for one payload namespace.
pub trait IqHandler: Send + Sync {
    /// Namespace of the payload element this handler serves.
    fn namespace(&self) -> &str;

    /// Process a `get` or `set` request. `Ok(None)` means the handler sends
    /// its own responses.
    fn handle(&self, ctx: &ServerContext, iq: &Stanza) -> Result<Option<Stanza>, RouterError>;
}

/// XEP-0199 ping.
pub struct PingHandler;

impl IqHandler for PingHandler {
    fn namespace(&self) -> &str {
        ns::PING
    }

    fn handle(&self, _ctx: &ServerContext, iq: &Stanza) -> Result<Option<Stanza>, RouterError> {
        Ok(Some(iq.create_reply().with_type("result")))
    }
}

/// Legacy RFC 3921 session establishment, acknowledged without effect.
pub struct SessionHandler;

impl IqHandler for SessionHandler {
    fn namespace(&self) -> &str {
        ns::SESSION
    }

    fn handle(&self, _ctx: &ServerContext, iq: &Stanza) -> Result<Option<Stanza>, RouterError> {
        if iq.iq_type() != Some(IqType::Set) {
            return Err(RouterError::bad_request(None));
        }
        Ok(Some(iq.create_reply().with_type("result")))
    }
}

/// Routes IQ stanzas and dispatches those addressed to the server.
pub struct IqRouter {
    ctx: Weak<ServerContext>,
    handlers: DashMap<String, Arc<dyn IqHandler>>,
}

impl IqRouter {
    /// Create a router with the built-in handlers installed.
    pub fn new(ctx: Weak<ServerContext>) -> Self {
        let router = Self {
            ctx,
            handlers: DashMap::new(),
        };
        router.add_handler(Arc::new(PingHandler));
        router.add_handler(Arc::new(SessionHandler));
        router
    }

    /// Install a handler, replacing any handler of the same namespace.
    pub fn add_handler(&self, handler: Arc<dyn IqHandler>) {
        self.handlers.insert(handler.namespace().to_string(), handler);
    }

    pub fn remove_handler(&self, namespace: &str) -> bool {
        self.handlers.remove(namespace).is_some()
    }

    pub fn has_handler(&self, namespace: &str) -> bool {
        self.handlers.contains_key(namespace)
    }

    #[instrument(name = "xmpp.route.iq", skip_all, fields(to = ?iq.to(), id = ?iq.id()))]
    pub fn route(&self, iq: Stanza, session: Option<&Arc<ClientSession>>) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let interceptors = ctx.interceptors();
        if let Err(rejected) = interceptors.invoke(&iq, session, true, false) {
            self.rejected(&iq, session, rejected);
            return;
        }

        let processed = iq.clone();
        match iq.iq_type() {
            None => {
                debug!(iq_type = ?iq.stanza_type(), "Invalid IQ type");
                self.reply_error(&ctx, &iq, RouterError::bad_request(Some("invalid IQ type".into())));
            }
            Some(_) => match iq.to().cloned() {
                Some(to) if !is_server_address(&ctx, &to) => {
                    ctx.routing_table().route_packet(&to, iq, false)
                }
                _ => self.deliver_to_server(&ctx, iq),
            },
        }
        let _ = interceptors.invoke(&processed, session, true, true);
    }

    /// IQ handled by the server itself, either addressed to the server or
    /// to a user's bare JID.
    pub fn deliver_to_server(&self, ctx: &ServerContext, iq: Stanza) {
        let iq_type = match iq.iq_type() {
            Some(t) => t,
            None => {
                self.reply_error(ctx, &iq, RouterError::bad_request(None));
                return;
            }
        };
        if !iq_type.is_request() {
            debug!(id = ?iq.id(), "Consumed IQ response addressed to the server");
            return;
        }

        let handler = iq
            .payload_namespace()
            .and_then(|namespace| self.handlers.get(&namespace).map(|h| Arc::clone(h.value())));
        let Some(handler) = handler else {
            let addressed_to_server = iq.to().map(|to| is_server_address(ctx, to)).unwrap_or(true);
            let error = if addressed_to_server {
                RouterError::feature_not_implemented(None)
            } else {
                RouterError::service_unavailable(None)
            };
            debug!(namespace = ?iq.payload_namespace(), "No IQ handler");
            self.reply_error(ctx, &iq, error);
            return;
        };

        match handler.handle(ctx, &iq) {
            Ok(Some(reply)) => self.send_reply(ctx, reply),
            Ok(None) => {}
            Err(e) => {
                warn!(namespace = handler.namespace(), error = %e, "IQ handler failed");
                self.reply_error(ctx, &iq, e);
            }
        }
    }

    /// The IQ could not be routed. Requests get an error reply, responses
    /// are dropped.
    pub fn routing_failed(&self, to: &Jid, iq: Stanza) {
        if !iq.iq_type().map(|t| t.is_request()).unwrap_or(false) {
            debug!(to = %to, "Dropping unroutable IQ response");
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let condition = if to.domain().as_str() == ctx.domain()
            || ctx.routing_table().has_component_route(to.domain().as_str())
        {
            StanzaErrorCondition::ServiceUnavailable
        } else {
            StanzaErrorCondition::RemoteServerNotFound
        };
        let reply = iq.error_reply(condition, StanzaErrorType::Cancel, None);
        self.send_reply(&ctx, reply);
    }

    fn reply_error(&self, ctx: &ServerContext, iq: &Stanza, error: RouterError) {
        if iq.is_error() {
            return;
        }
        let (condition, error_type) = error.stanza_condition();
        let text = match &error {
            RouterError::Stanza { text, .. } => text.clone(),
            _ => None,
        };
        let reply = iq.error_reply(condition, error_type, text.as_deref());
        self.send_reply(ctx, reply);
    }

    fn send_reply(&self, ctx: &ServerContext, mut reply: Stanza) {
        if reply.from().is_none() {
            reply.set_from(Some(ctx.server_jid()));
        }
        match reply.to().cloned() {
            Some(to) => ctx.routing_table().route_packet(&to, reply, true),
            None => debug!(id = ?reply.id(), "IQ reply without recipient"),
        }
    }

    fn rejected(&self, iq: &Stanza, session: Option<&Arc<ClientSession>>, _rejected: PacketRejected) {
        let Some(session) = session else {
            return;
        };
        if iq.iq_type().map(|t| t.is_request()).unwrap_or(false) {
            session.process(iq.error_reply(
                StanzaErrorCondition::NotAllowed,
                StanzaErrorType::Cancel,
                None,
            ));
        }
    }
}

fn is_server_address(ctx: &ServerContext, to: &Jid) -> bool {
    to.node().is_none() && to.resource().is_none() && to.domain().as_str() == ctx.domain()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::StanzaKind;
    use crate::testing::{bound_session, context};
    use minidom::Element;

    const VCARD: &str = "vcard-temp";

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    fn ping(id: &str) -> Stanza {
        Stanza::iq(IqType::Get, id, Some(Element::builder("ping", ns::PING).build()))
    }

    struct FailingHandler;

    impl IqHandler for FailingHandler {
        fn namespace(&self) -> &str {
            VCARD
        }

        fn handle(&self, _ctx: &ServerContext, _iq: &Stanza) -> Result<Option<Stanza>, RouterError> {
            Err(RouterError::Stanza {
                condition: StanzaErrorCondition::ItemNotFound,
                error_type: StanzaErrorType::Cancel,
                text: Some("no vcard".into()),
            })
        }
    }

    fn vcard_request(id: &str) -> Stanza {
        Stanza::iq(IqType::Get, id, Some(Element::builder("vCard", VCARD).build()))
    }

    #[tokio::test]
    async fn test_ping_to_server_gets_result() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        ctx.packet_router()
            .route_from_session(&alice, ping("p1").with_to(jid("example.com")));

        let replies = conn.delivered_of(StanzaKind::Iq);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].stanza_type(), Some("result"));
        assert_eq!(replies[0].id(), Some("p1"));
        assert_eq!(replies[0].from(), Some(&jid("example.com")));
        assert_eq!(replies[0].to(), Some(&jid("alice@example.com/desk")));
    }

    #[tokio::test]
    async fn test_iq_without_recipient_is_handled_by_server() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        ctx.packet_router().route_from_session(&alice, ping("p2"));

        let replies = conn.delivered_of(StanzaKind::Iq);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].stanza_type(), Some("result"));
        assert_eq!(replies[0].from(), Some(&jid("example.com")));
    }

    #[tokio::test]
    async fn test_unknown_namespace_errors() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        ctx.packet_router()
            .route_from_session(&alice, vcard_request("v1").with_to(jid("example.com")));
        ctx.packet_router()
            .route_from_session(&alice, vcard_request("v2").with_to(jid("bob@example.com")));

        let replies = conn.delivered_of(StanzaKind::Iq);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].error_condition().as_deref(), Some("feature-not-implemented"));
        assert_eq!(replies[1].error_condition().as_deref(), Some("service-unavailable"));
    }

    #[tokio::test]
    async fn test_unroutable_request_errors() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        ctx.packet_router()
            .route_from_session(&alice, ping("r1").with_to(jid("bob@example.com/phone")));
        ctx.packet_router()
            .route_from_session(&alice, ping("r2").with_to(jid("carol@elsewhere.org/home")));

        let replies = conn.delivered_of(StanzaKind::Iq);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].error_condition().as_deref(), Some("service-unavailable"));
        assert_eq!(replies[1].error_condition().as_deref(), Some("remote-server-not-found"));
    }

    #[tokio::test]
    async fn test_unroutable_response_is_dropped() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        let result = Stanza::iq(IqType::Result, "r3", None).with_to(jid("bob@example.com/phone"));
        ctx.packet_router().route_from_session(&alice, result);

        assert!(conn.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_maps_to_condition() {
        let ctx = ServerContext::builder()
            .domain("example.com")
            .iq_handler(Arc::new(FailingHandler))
            .build()
            .unwrap();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        ctx.packet_router()
            .route_from_session(&alice, vcard_request("v3").with_to(jid("example.com")));

        let replies = conn.delivered_of(StanzaKind::Iq);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_error());
        assert_eq!(replies[0].error_condition().as_deref(), Some("item-not-found"));
        assert!(replies[0].child("vCard", VCARD).is_some());
    }

    #[tokio::test]
    async fn test_response_to_server_is_consumed() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        let result = Stanza::iq(IqType::Result, "s1", None).with_to(jid("example.com"));
        ctx.packet_router().route_from_session(&alice, result);

        assert!(conn.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_iq_type_is_bad_request() {
        let ctx = context();
        let (alice, conn) = bound_session(&ctx, "alice", "desk").await;

        let iq = Stanza::new(StanzaKind::Iq)
            .with_id("b1")
            .with_type("fetch")
            .with_to(jid("example.com"));
        ctx.packet_router().route_from_session(&alice, iq);

        let replies = conn.delivered_of(StanzaKind::Iq);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].error_condition().as_deref(), Some("bad-request"));
    }

    #[test]
    fn test_handlers_can_be_replaced_and_removed() {
        let router = IqRouter::new(Weak::new());
        assert!(router.has_handler(ns::PING));
        assert!(router.has_handler(ns::SESSION));
        router.add_handler(Arc::new(FailingHandler));
        assert!(router.has_handler(VCARD));
        assert!(router.remove_handler(VCARD));
        assert!(!router.has_handler(VCARD));
    }
}
