//! Presence knowledge beyond live sessions: last unavailable presence,
//! last activity and probe answers.

use std::sync::Weak;

use chrono::{DateTime, TimeZone, Utc};
use jid::Jid;
use tracing::{debug, instrument, warn};

use crate::cache::{Cache, CacheFactory, CacheHandle};
use crate::context::ServerContext;
use crate::error::CacheError;
use crate::provider::Subscription;
use crate::stanza::{PresenceType, Stanza};

pub const OFFLINE_PRESENCE_CACHE: &str = "Offline Presence Cache";
pub const LAST_ACTIVITY_CACHE: &str = "Last Activity Cache";

/// Caches backing the presence manager.
pub struct PresenceCaches {
    offline_presences: CacheHandle<String, Stanza>,
    last_activity: CacheHandle<String, i64>,
}

impl PresenceCaches {
    pub fn create(factory: &CacheFactory) -> Result<Self, CacheError> {
        Ok(Self {
            offline_presences: factory.create_cache(OFFLINE_PRESENCE_CACHE)?,
            last_activity: factory.create_cache(LAST_ACTIVITY_CACHE)?,
        })
    }
}

/// Presence state of users, shared across the cluster.
pub struct PresenceManager {
    ctx: Weak<ServerContext>,
    offline_presences: CacheHandle<String, Stanza>,
    last_activity: CacheHandle<String, i64>,
}

impl PresenceManager {
    pub fn new(ctx: Weak<ServerContext>, caches: PresenceCaches) -> Self {
        Self {
            ctx,
            offline_presences: caches.offline_presences,
            last_activity: caches.last_activity,
        }
    }

    /// Whether any session of `user` is available.
    pub fn is_available(&self, user: &Jid) -> bool {
        let bare = Jid::from(user.to_bare());
        self.ctx
            .upgrade()
            .map(|ctx| !ctx.routing_table().get_routes(&bare, None).is_empty())
            .unwrap_or(false)
    }

    /// A session of `address` became available.
    pub fn user_available(&self, address: &Jid) {
        let key = address.to_bare().to_string();
        match self.offline_presences.lock(&key) {
            Ok(_guard) => {
                self.offline_presences.remove(&key);
                self.last_activity.remove(&key);
            }
            Err(e) => warn!(user = %key, error = %e, "Unable to clear offline presence"),
        }
    }

    /// A session went unavailable. Remembers the presence once the user has
    /// no available session left.
    pub fn user_unavailable(&self, presence: &Stanza) {
        let Some(from) = presence.from() else {
            return;
        };
        if self.is_available(from) {
            return;
        }
        let key = from.to_bare().to_string();
        let mut stored = presence.clone();
        stored.set_to(None);
        match self.offline_presences.lock(&key) {
            Ok(_guard) => {
                self.offline_presences.put(key.clone(), stored);
                self.last_activity.put(key, Utc::now().timestamp_millis());
            }
            Err(e) => warn!(user = %key, error = %e, "Unable to record offline presence"),
        }
    }

    /// Last unavailable presence of an offline user.
    pub fn last_presence(&self, user: &Jid) -> Option<Stanza> {
        self.offline_presences.get(&user.to_bare().to_string())
    }

    /// When `user` went offline, `None` while online or unknown.
    pub fn last_activity(&self, user: &Jid) -> Option<DateTime<Utc>> {
        let millis = self.last_activity.get(&user.to_bare().to_string())?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Answer a presence probe for a local user.
    #[instrument(name = "xmpp.presence.probe", skip(self, probe), fields(from = ?probe.from(), to = ?probe.to()))]
    pub fn handle_probe(&self, probe: &Stanza) {
        let (Some(prober), Some(probee)) = (probe.from().cloned(), probe.to()) else {
            return;
        };
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        let probee = Jid::from(probee.to_bare());
        let routing = ctx.routing_table();

        if !self.can_probe(&ctx, &prober, &probee) {
            debug!("Prober is not subscribed to probee");
            let refusal = Stanza::presence(PresenceType::Unsubscribed)
                .with_from(probee)
                .with_to(prober.clone());
            routing.route_packet(&prober, refusal, true);
            return;
        }

        let mut answered = false;
        for route in routing.get_routes(&probee, Some(&prober)) {
            let Some(mut presence) = routing.session_info(&route).and_then(|info| info.presence) else {
                continue;
            };
            presence.set_from(Some(route));
            presence.set_to(Some(prober.clone()));
            routing.route_packet(&prober, presence, true);
            answered = true;
        }
        if answered {
            return;
        }

        let mut presence = self
            .last_presence(&probee)
            .unwrap_or_else(|| Stanza::presence(PresenceType::Unavailable));
        presence.set_from(Some(probee));
        presence.set_to(Some(prober.clone()));
        routing.route_packet(&prober, presence, true);
    }

    /// Whether `prober` may learn `probee`'s presence.
    fn can_probe(&self, ctx: &ServerContext, prober: &Jid, probee: &Jid) -> bool {
        if prober.to_bare() == probee.to_bare() {
            return true;
        }
        let Some(roster) = ctx.providers().roster.as_ref() else {
            return true;
        };
        let Some(username) = probee.node() else {
            return false;
        };
        matches!(
            roster.subscription(username.as_str(), &Jid::from(prober.to_bare())),
            Some(Subscription::From | Subscription::Both)
        )
    }
}
