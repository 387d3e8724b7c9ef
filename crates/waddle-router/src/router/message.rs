//! Message routing.

use std::sync::{Arc, Weak};

use jid::Jid;
use tracing::{debug, info, instrument};

use crate::config::FORWARD_ADMINS;
use crate::context::ServerContext;
use crate::error::PacketRejected;
use crate::session::ClientSession;
use crate::stanza::{ns, Stanza};

/// Routes message stanzas.
pub struct MessageRouter {
    ctx: Weak<ServerContext>,
}

impl MessageRouter {
    pub fn new(ctx: Weak<ServerContext>) -> Self {
        Self { ctx }
    }

    #[instrument(name = "xmpp.route.message", skip_all, fields(to = ?message.to(), from = ?message.from()))]
    pub fn route(&self, mut message: Stanza, session: Option<&Arc<ClientSession>>) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let interceptors = ctx.interceptors();
        if let Err(rejected) = interceptors.invoke(&message, session, true, false) {
            self.rejected(&ctx, session, rejected);
            return;
        }

        // A message without a recipient is for the sender's own account.
        if message.to().is_none() {
            match session {
                Some(session) => message.set_to(Some(Jid::from(session.address().to_bare()))),
                None => {
                    debug!("Dropping message without recipient");
                    return;
                }
            }
        }

        let processed = message.clone();
        match message.to().cloned() {
            Some(to) if is_server_address(&ctx, &to) => self.deliver_to_server(&ctx, message),
            Some(to) => ctx.routing_table().route_packet(&to, message, false),
            None => {}
        }
        let _ = interceptors.invoke(&processed, session, true, true);
    }

    /// Message addressed to the server: multicast when it carries extended
    /// addressing, otherwise forwarded to the administrators.
    pub fn deliver_to_server(&self, ctx: &ServerContext, message: Stanza) {
        if message.is_error() {
            debug!(from = ?message.from(), "Dropping error message sent to the server");
            return;
        }
        if message.child("addresses", ns::ADDRESS).is_some() {
            if let Some(multicast) = ctx.providers().multicast.as_ref() {
                multicast.route(ctx, message);
                return;
            }
        }

        let admins = self.admin_recipients(ctx);
        if admins.is_empty() {
            debug!("No administrators to forward server message to");
            return;
        }
        info!(admins = admins.len(), from = ?message.from(), "Forwarding server message to administrators");
        for admin in admins {
            let copy = message.clone().with_to(admin.clone());
            ctx.routing_table().route_packet(&admin, copy, false);
        }
    }

    /// Recipients of messages sent to the server JID.
    ///
    /// `xmpp.forward.admins` entries without a domain are local usernames.
    /// Without the property every administrator receives a copy.
    pub fn admin_recipients(&self, ctx: &ServerContext) -> Vec<Jid> {
        let configured = ctx.properties().get_list(FORWARD_ADMINS);
        if configured.is_empty() {
            return ctx
                .providers()
                .admins
                .as_ref()
                .map(|admins| admins.admins())
                .unwrap_or_default();
        }
        configured
            .iter()
            .filter_map(|entry| {
                let address = if entry.contains('@') {
                    entry.clone()
                } else {
                    format!("{}@{}", entry, ctx.domain())
                };
                Jid::new(&address).ok().map(|jid| Jid::from(jid.to_bare()))
            })
            .collect()
    }

    /// The message could not be routed to `to`.
    ///
    /// A message for an unavailable resource of a registered local user is
    /// retried once against the user's bare JID; anything still undelivered
    /// goes to the offline strategy.
    pub fn routing_failed(&self, to: &Jid, message: Stanza) {
        if message.is_error() {
            debug!(to = %to, "Dropping unroutable error message");
            return;
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        if to.resource().is_some() && is_registered_user(&ctx, to) {
            let bare = Jid::from(to.to_bare());
            if ctx.routing_table().try_route_packet(&bare, message.clone(), false) {
                debug!(to = %to, "Delivered to another resource of the recipient");
                return;
            }
        }
        ctx.offline_strategy().store_offline(message);
    }

    fn rejected(&self, ctx: &ServerContext, session: Option<&Arc<ClientSession>>, rejected: PacketRejected) {
        let (Some(session), Some(text)) = (session, rejected.message) else {
            return;
        };
        let notice = Stanza::message(session.address(), &text).with_from(ctx.server_jid());
        session.process(notice);
    }
}

fn is_server_address(ctx: &ServerContext, to: &Jid) -> bool {
    to.node().is_none() && to.resource().is_none() && to.domain().as_str() == ctx.domain()
}

fn is_registered_user(ctx: &ServerContext, address: &Jid) -> bool {
    if address.domain().as_str() != ctx.domain() {
        return false;
    }
    let Some(node) = address.node() else {
        return false;
    };
    if ctx.routing_table().is_anonymous_route(address) {
        return false;
    }
    ctx.providers()
        .users
        .as_ref()
        .map(|users| users.user_exists(node.as_str()))
        .unwrap_or(true)
}
