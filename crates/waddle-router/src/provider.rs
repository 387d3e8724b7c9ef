//! External collaborators of the routing core.
//!
//! Authentication, user and admin lookup, rosters, subscription handling,
//! multicast, offline storage and entity capabilities are services the core
//! calls through these traits. [`ProviderRegistry`] maps the
//! `provider.*.type` properties to built-in implementations; embedders can
//! also inject their own through the context builder.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, info};

use crate::config::{
    ServerProperties, ADMIN_JIDS, PROVIDER_ADMIN, PROVIDER_AUTH, PROVIDER_OFFLINE, PROVIDER_USER,
};
use crate::context::ServerContext;
use crate::error::RouterError;
use crate::stanza::Stanza;

/// Checks credentials.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> Result<(), RouterError>;
}

/// Knows which accounts exist.
pub trait UserProvider: Send + Sync {
    fn user_exists(&self, username: &str) -> bool;

    fn user_count(&self) -> usize;
}

/// Knows the server administrators.
pub trait AdminProvider: Send + Sync {
    fn admins(&self) -> Vec<Jid>;
}

/// Roster subscription state between a user and a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    /// The user receives the contact's presence
    To,
    /// The contact receives the user's presence
    From,
    Both,
}

/// Read access to user rosters.
pub trait RosterService: Send + Sync {
    /// Subscription of `contact` in `username`'s roster, `None` when the
    /// contact is not in the roster.
    fn subscription(&self, username: &str, contact: &Jid) -> Option<Subscription>;

    /// Contacts that receive `username`'s presence.
    fn presence_subscribers(&self, username: &str) -> Vec<Jid>;

    /// Contacts whose presence `username` receives.
    fn presence_subscriptions(&self, username: &str) -> Vec<Jid>;
}

/// Processes subscribe/subscribed/unsubscribe/unsubscribed presences.
pub trait SubscriptionHandler: Send + Sync {
    fn process(&self, ctx: &ServerContext, presence: Stanza);
}

/// Delivers stanzas carrying extended addressing.
pub trait MulticastRouter: Send + Sync {
    fn route(&self, ctx: &ServerContext, stanza: Stanza);
}

/// Persists messages for offline users.
pub trait OfflineMessageStore: Send + Sync {
    fn store(&self, message: &Stanza) -> Result<(), RouterError>;
}

/// Tracks entity capabilities advertised in presence.
pub trait EntityCapsManager: Send + Sync {
    fn process(&self, presence: &Stanza);
}

/// Observer of presence from users of other domains.
pub trait RemotePresenceListener: Send + Sync {
    fn remote_user_available(&self, _presence: &Stanza) {}

    fn remote_user_unavailable(&self, _presence: &Stanza) {}
}

/// Collaborators used by the core. Absent services disable the feature.
#[derive(Clone, Default)]
pub struct Providers {
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub users: Option<Arc<dyn UserProvider>>,
    pub admins: Option<Arc<dyn AdminProvider>>,
    pub roster: Option<Arc<dyn RosterService>>,
    pub subscriptions: Option<Arc<dyn SubscriptionHandler>>,
    pub multicast: Option<Arc<dyn MulticastRouter>>,
    pub offline_store: Option<Arc<dyn OfflineMessageStore>>,
    pub entity_caps: Option<Arc<dyn EntityCapsManager>>,
    pub remote_presence_listeners: Vec<Arc<dyn RemotePresenceListener>>,
}

/// Builds providers from `provider.*.type` properties.
///
/// Known types: `properties` for auth, user and admin providers, `memory`
/// for the offline store, and `none` to leave a service unset.
pub struct ProviderRegistry;

impl ProviderRegistry {
    /// Fill every unset provider in `providers` from configuration.
    pub fn resolve(
        properties: &Arc<ServerProperties>,
        mut providers: Providers,
    ) -> Result<Providers, RouterError> {
        let mut user_store: Option<Arc<PropertiesUserStore>> = None;
        let mut user_store = || {
            Arc::clone(
                user_store.get_or_insert_with(|| Arc::new(PropertiesUserStore::load(properties))),
            )
        };

        if providers.auth.is_none() {
            providers.auth = match provider_type(properties, PROVIDER_AUTH, "properties")?.as_str() {
                "properties" => Some(user_store() as Arc<dyn AuthProvider>),
                _ => None,
            };
        }
        if providers.users.is_none() {
            providers.users = match provider_type(properties, PROVIDER_USER, "properties")?.as_str() {
                "properties" => Some(user_store() as Arc<dyn UserProvider>),
                _ => None,
            };
        }
        if providers.admins.is_none() {
            providers.admins =
                match provider_type(properties, PROVIDER_ADMIN, "properties")?.as_str() {
                    "properties" => Some(Arc::new(PropertiesAdminProvider::load(properties))
                        as Arc<dyn AdminProvider>),
                    _ => None,
                };
        }
        if providers.offline_store.is_none() {
            providers.offline_store =
                match provider_type(properties, PROVIDER_OFFLINE, "memory")?.as_str() {
                    "memory" => Some(Arc::new(MemoryOfflineStore::default())
                        as Arc<dyn OfflineMessageStore>),
                    _ => None,
                };
        }
        Ok(providers)
    }
}

fn provider_type(
    properties: &ServerProperties,
    property: &str,
    default: &str,
) -> Result<String, RouterError> {
    let value = properties.get_or(property, default).trim().to_ascii_lowercase();
    let known: &[&str] = if property == PROVIDER_OFFLINE {
        &["memory", "none"]
    } else {
        &["properties", "none"]
    };
    if known.contains(&value.as_str()) {
        debug!(property, provider = %value, "Provider selected");
        Ok(value)
    } else {
        Err(RouterError::config(format!(
            "unknown provider '{}' for {} (expected one of {:?})",
            value, property, known
        )))
    }
}

/// Accounts defined as `user.<name>.password` properties.
pub struct PropertiesUserStore {
    passwords: HashMap<String, String>,
}

impl PropertiesUserStore {
    pub fn load(properties: &ServerProperties) -> Self {
        let passwords: HashMap<String, String> = properties
            .names_with_prefix("user.")
            .into_iter()
            .filter_map(|name| {
                let username = name.strip_prefix("user.")?.strip_suffix(".password")?;
                if username.is_empty() || username.contains('.') {
                    return None;
                }
                let password = properties.get(&name)?;
                Some((username.to_ascii_lowercase(), password))
            })
            .collect();
        info!(users = passwords.len(), "Loaded users from properties");
        Self { passwords }
    }
}

impl AuthProvider for PropertiesUserStore {
    fn authenticate(&self, username: &str, password: &str) -> Result<(), RouterError> {
        match self.passwords.get(&username.to_ascii_lowercase()) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(RouterError::auth_failed("invalid username or password")),
        }
    }
}

impl UserProvider for PropertiesUserStore {
    fn user_exists(&self, username: &str) -> bool {
        self.passwords.contains_key(&username.to_ascii_lowercase())
    }

    fn user_count(&self) -> usize {
        self.passwords.len()
    }
}

/// Administrators listed in `admin.authorizedJIDs`, defaulting to
/// `admin@<domain>`.
pub struct PropertiesAdminProvider {
    admins: Vec<Jid>,
}

impl PropertiesAdminProvider {
    pub fn load(properties: &ServerProperties) -> Self {
        let domain = properties.domain();
        let mut configured = properties.get_list(ADMIN_JIDS);
        if configured.is_empty() {
            configured.push(format!("admin@{}", domain));
        }
        let admins = configured
            .iter()
            .filter_map(|entry| {
                let address = if entry.contains('@') {
                    entry.clone()
                } else {
                    format!("{}@{}", entry, domain)
                };
                Jid::new(&address).ok().map(|jid| Jid::from(jid.to_bare()))
            })
            .collect();
        Self { admins }
    }
}

impl AdminProvider for PropertiesAdminProvider {
    fn admins(&self) -> Vec<Jid> {
        self.admins.clone()
    }
}

/// Offline messages kept in memory, per bare recipient.
#[derive(Default)]
pub struct MemoryOfflineStore {
    messages: DashMap<String, Vec<Stanza>>,
}

impl MemoryOfflineStore {
    /// Remove and return the stored messages of `recipient`.
    pub fn take(&self, recipient: &Jid) -> Vec<Stanza> {
        self.messages
            .remove(&recipient.to_bare().to_string())
            .map(|(_, v)| v)
            .unwrap_or_default()
    }

    pub fn count(&self, recipient: &Jid) -> usize {
        self.messages
            .get(&recipient.to_bare().to_string())
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl OfflineMessageStore for MemoryOfflineStore {
    fn store(&self, message: &Stanza) -> Result<(), RouterError> {
        let recipient = message
            .to()
            .ok_or_else(|| RouterError::bad_request(Some("message has no recipient".into())))?;
        self.messages
            .entry(recipient.to_bare().to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }
}
