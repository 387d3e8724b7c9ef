//! What happens to messages that cannot reach a live session.

use std::str::FromStr;
use std::sync::Weak;

use jid::Jid;
use tracing::{debug, info, warn};

use crate::config::{ServerProperties, OFFLINE_TYPE};
use crate::connection::PacketDeliverer;
use crate::context::ServerContext;
use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::metrics;
use crate::stanza::{MessageType, Stanza, StanzaKind};

/// Offline handling selected by `xmpp.offline.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflineType {
    /// Hand the message to the offline store
    #[default]
    Store,
    /// Return `service-unavailable` to the sender
    Bounce,
    /// Discard silently
    Drop,
}

impl FromStr for OfflineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "store" | "store_and_bounce" => Ok(Self::Store),
            "bounce" => Ok(Self::Bounce),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown offline type '{}'", other)),
        }
    }
}

impl OfflineType {
    pub fn from_properties(properties: &ServerProperties) -> Self {
        properties.parse(OFFLINE_TYPE).unwrap_or_default()
    }
}

/// Last stop for messages: store, bounce or drop.
///
/// Also serves as the backup deliverer of client connections, so anything
/// a closed socket could not write ends up here. Only messages survive;
/// other stanzas are dropped.
pub struct OfflineMessageStrategy {
    ctx: Weak<ServerContext>,
    offline_type: OfflineType,
}

impl OfflineMessageStrategy {
    pub fn new(ctx: Weak<ServerContext>, offline_type: OfflineType) -> Self {
        Self { ctx, offline_type }
    }

    pub fn offline_type(&self) -> OfflineType {
        self.offline_type
    }

    /// Handle a message none of the recipient's sessions could take.
    pub fn store_offline(&self, message: Stanza) {
        match message.message_type() {
            MessageType::Error | MessageType::Groupchat | MessageType::Headline => {
                debug!(kind = ?message.message_type(), "Not keeping message offline");
                return;
            }
            MessageType::Normal | MessageType::Chat => {}
        }
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let Some(recipient) = message.to().cloned() else {
            return;
        };
        if !self.is_local_user(&ctx, &recipient) {
            self.bounce(&ctx, &message);
            return;
        }

        match self.offline_type {
            OfflineType::Drop => {
                debug!(to = %recipient, "Dropping message for offline user");
                metrics::record_routed("message", "dropped");
            }
            OfflineType::Bounce => self.bounce(&ctx, &message),
            OfflineType::Store => match ctx.providers().offline_store.as_ref() {
                Some(store) => match store.store(&message) {
                    Ok(()) => {
                        info!(to = %recipient, "Message stored offline");
                        metrics::record_routed("message", "offline");
                    }
                    Err(e) => {
                        warn!(to = %recipient, error = %e, "Offline store failed, bouncing");
                        self.bounce(&ctx, &message);
                    }
                },
                None => self.bounce(&ctx, &message),
            },
        }
    }

    fn is_local_user(&self, ctx: &ServerContext, recipient: &Jid) -> bool {
        if recipient.domain().as_str() != ctx.domain() {
            return false;
        }
        let Some(node) = recipient.node() else {
            return false;
        };
        match ctx.providers().users.as_ref() {
            Some(users) => users.user_exists(node.as_str()),
            None => true,
        }
    }

    fn bounce(&self, ctx: &ServerContext, message: &Stanza) {
        let Some(sender) = message.from().cloned() else {
            return;
        };
        if message.is_error() {
            return;
        }
        debug!(to = ?message.to(), from = %sender, "Bouncing undeliverable message");
        let reply = message.error_reply(
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            None,
        );
        metrics::record_routed("message", "bounced");
        ctx.routing_table().route_packet(&sender, reply, true);
    }
}

impl PacketDeliverer for OfflineMessageStrategy {
    fn deliver(&self, stanza: Stanza) {
        if stanza.kind() == StanzaKind::Message {
            self.store_offline(stanza);
        } else {
            debug!(kind = stanza.name(), to = ?stanza.to(), "Dropping undeliverable stanza");
        }
    }
}
