//! Presence updates of local sessions.
//!
//! Available and unavailable presence sent by a client to the server
//! changes the session's route and is broadcast to the user's presence
//! subscribers and other resources. Directed presence is tracked so that it
//! can be retracted when the session goes away.

use std::sync::{Arc, Weak};

use jid::Jid;
use tracing::{debug, info, instrument, warn};

use crate::cluster::NodeId;
use crate::context::ServerContext;
use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::provider::Subscription;
use crate::session::ClientSession;
use crate::stanza::{PresenceType, Stanza};

pub struct PresenceUpdateHandler {
    ctx: Weak<ServerContext>,
}

impl PresenceUpdateHandler {
    pub fn new(ctx: Weak<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Apply presence sent by `session` to the server.
    #[instrument(name = "xmpp.presence.update", skip(self, session, presence), fields(jid = %session.address()))]
    pub fn process(&self, session: &Arc<ClientSession>, presence: Stanza) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        match presence.presence_type() {
            Some(PresenceType::Available) => self.available_session(&ctx, session, presence),
            Some(PresenceType::Unavailable) => self.unavailable_session(&ctx, session, presence),
            Some(PresenceType::Error) => {
                debug!("Ignoring presence error sent to the server");
            }
            _ => {
                debug!(presence_type = ?presence.stanza_type(), "Unexpected presence update");
                let reply = presence.error_reply(
                    StanzaErrorCondition::BadRequest,
                    StanzaErrorType::Modify,
                    None,
                );
                session.process(reply);
            }
        }
    }

    fn available_session(&self, ctx: &ServerContext, session: &Arc<ClientSession>, mut presence: Stanza) {
        let initial = !session.is_available();
        let address = session.address();
        presence.set_from(Some(address.clone()));
        presence.set_to(None);

        session.set_presence(presence.clone());
        if let Err(e) = ctx.routing_table().add_client_route(session) {
            warn!(error = %e, "Unable to mark route available");
        }
        ctx.presence_manager().user_available(&address);
        self.broadcast_update(ctx, session, &presence);

        if initial {
            info!("Session available");
            self.initial_probes(ctx, session);
        }
    }

    fn unavailable_session(&self, ctx: &ServerContext, session: &Arc<ClientSession>, mut presence: Stanza) {
        let was_available = session.is_available();
        let address = session.address();
        presence.set_from(Some(address.clone()));
        presence.set_to(None);

        session.set_presence(presence.clone());
        if let Err(e) = ctx.routing_table().add_client_route(session) {
            warn!(error = %e, "Unable to mark route unavailable");
        }
        if was_available {
            self.broadcast_update(ctx, session, &presence);
        }
        self.retract_directed_presences(ctx, &address, &presence);
        ctx.presence_manager().user_unavailable(&presence);
        if was_available {
            info!("Session unavailable");
        }
    }

    /// A local session is going away.
    ///
    /// An available session goes through the regular unavailable path. One
    /// that never became available may still have sent directed presence,
    /// and those receivers are told it is gone.
    pub fn session_closed(&self, session: &Arc<ClientSession>) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let address = session.address();
        let unavailable = Stanza::presence(PresenceType::Unavailable).with_from(address.clone());
        if session.is_available() {
            self.unavailable_session(&ctx, session, unavailable);
        } else {
            self.retract_directed_presences(&ctx, &address, &unavailable);
        }
    }

    /// Send `presence` to the user's subscribers and other resources.
    fn broadcast_update(&self, ctx: &ServerContext, session: &Arc<ClientSession>, presence: &Stanza) {
        let address = session.address();
        let routing = ctx.routing_table();

        if !session.is_anonymous() {
            if let (Some(roster), Some(username)) = (ctx.providers().roster.as_ref(), session.username()) {
                for subscriber in roster.presence_subscribers(&username) {
                    let copy = presence.clone().with_to(subscriber.clone());
                    routing.route_packet(&subscriber, copy, false);
                }
            }
        }

        let bare = Jid::from(address.to_bare());
        for resource in routing.get_routes(&bare, None) {
            if resource == address {
                continue;
            }
            let copy = presence.clone().with_to(resource.clone());
            routing.try_route_packet(&resource, copy, false);
        }
    }

    /// Ask contacts for their presence and show the user's other resources
    /// to the new one.
    fn initial_probes(&self, ctx: &ServerContext, session: &Arc<ClientSession>) {
        let address = session.address();
        let routing = ctx.routing_table();

        if let (Some(roster), Some(username)) = (ctx.providers().roster.as_ref(), session.username()) {
            for contact in roster.presence_subscriptions(&username) {
                let probe = Stanza::presence(PresenceType::Probe)
                    .with_from(address.clone())
                    .with_to(contact.clone());
                if contact.domain().as_str() == ctx.domain() {
                    ctx.presence_manager().handle_probe(&probe);
                } else {
                    routing.route_packet(&contact, probe, true);
                }
            }
        }

        let bare = Jid::from(address.to_bare());
        for resource in routing.get_routes(&bare, None) {
            if resource == address {
                continue;
            }
            let Some(mut presence) = routing.session_info(&resource).and_then(|info| info.presence) else {
                continue;
            };
            presence.set_from(Some(resource));
            presence.set_to(Some(address.clone()));
            routing.route_packet(&address, presence, true);
        }
    }

    /// Send unavailable presence to every entity the sender directed
    /// presence to.
    fn retract_directed_presences(&self, ctx: &ServerContext, sender: &Jid, presence: &Stanza) {
        let records = ctx.directed_presences().take_all(sender);
        for record in records {
            for receiver in &record.receivers {
                let Ok(to) = Jid::new(receiver) else {
                    continue;
                };
                debug!(to = %to, "Retracting directed presence");
                let copy = presence.clone().with_to(to.clone());
                ctx.routing_table().route_packet(&to, copy, false);
            }
        }
    }

    /// Record or forget directed presence sent by a local session.
    ///
    /// `handler` is the route the presence was delivered through and
    /// `receiver` the address the client wrote in `to`.
    pub fn directed_presence_sent(
        &self,
        session: &Arc<ClientSession>,
        presence: &Stanza,
        handler: &Jid,
        receiver: &str,
    ) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let sender = session.address();
        let tracker = ctx.directed_presences();
        let result = match presence.presence_type() {
            Some(PresenceType::Available) => {
                if !self.keep_track(&ctx, session, receiver) {
                    return;
                }
                tracker.add(ctx.node_id(), &sender, handler, receiver)
            }
            Some(PresenceType::Unavailable) => tracker.remove(&sender, handler, receiver),
            _ => return,
        };
        if let Err(e) = result {
            warn!(sender = %sender, receiver, error = %e, "Unable to update directed presence");
        }
    }

    /// Whether the receiver would miss the sender going offline without
    /// explicit tracking.
    fn keep_track(&self, ctx: &ServerContext, session: &Arc<ClientSession>, receiver: &str) -> bool {
        let Ok(receiver) = Jid::new(receiver) else {
            return false;
        };
        if receiver.to_bare() == session.address().to_bare() {
            return false;
        }
        if session.is_anonymous() {
            return true;
        }
        let (Some(roster), Some(username)) = (ctx.providers().roster.as_ref(), session.username()) else {
            return true;
        };
        match roster.subscription(&username, &Jid::from(receiver.to_bare())) {
            None | Some(Subscription::None) | Some(Subscription::To) => true,
            Some(Subscription::From) | Some(Subscription::Both) => false,
        }
    }

    /// A cluster node went away: send unavailable presence on behalf of
    /// the sessions it hosted.
    ///
    /// `departed` holds the client addresses whose routes were purged.
    pub fn node_left(&self, node: &NodeId, departed: &[Jid]) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let routing = ctx.routing_table();

        let directed = ctx.directed_presences().remove_for_node(node);
        for (sender, record) in &directed {
            let Ok(from) = Jid::new(sender) else {
                continue;
            };
            for receiver in &record.receivers {
                let Ok(to) = Jid::new(receiver) else {
                    continue;
                };
                let unavailable = Stanza::presence(PresenceType::Unavailable)
                    .with_from(from.clone())
                    .with_to(to.clone());
                routing.route_packet(&to, unavailable, true);
            }
        }

        for address in departed {
            let unavailable = Stanza::presence(PresenceType::Unavailable).with_from(address.clone());
            if let (Some(roster), Some(username)) = (ctx.providers().roster.as_ref(), address.node()) {
                for subscriber in roster.presence_subscribers(username.as_str()) {
                    let copy = unavailable.clone().with_to(subscriber.clone());
                    routing.route_packet(&subscriber, copy, true);
                }
            }
            let bare = Jid::from(address.to_bare());
            for resource in routing.get_routes(&bare, None) {
                let copy = unavailable.clone().with_to(resource.clone());
                routing.try_route_packet(&resource, copy, true);
            }
        }
        info!(
            %node,
            directed = directed.len(),
            sessions = departed.len(),
            "Sent unavailable presence for departed node"
        );
    }
}
