//! Routing table.
//!
//! Maps addresses to where they are served: client sessions (local or on
//! another cluster node), components and remote domains. Route records live
//! in shared caches so every node sees every route; live session objects
//! stay in the local table of the node that hosts them.

mod directed;
mod route;

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, info, instrument, warn};

pub use directed::{DirectedPresence, DirectedPresenceTracker, DIRECTED_PRESENCES_CACHE};
pub use route::{ClientRoute, ResourceSelectionPolicy};

use crate::cache::{Cache, CacheFactory, CacheHandle};
use crate::cluster::{ClusterTask, NodeId};
use crate::context::ServerContext;
use crate::error::{CacheError, RouterError};
use crate::metrics;
use crate::session::{ClientSession, SessionInfo};
use crate::stanza::{Stanza, StanzaKind};

pub const USERS_CACHE: &str = "Routing Users Cache";
pub const ANONYMOUS_USERS_CACHE: &str = "Routing AnonymousUsers Cache";
pub const USER_SESSIONS_CACHE: &str = "Routing User Sessions";
pub const COMPONENTS_CACHE: &str = "Routing Components Cache";
pub const SERVERS_CACHE: &str = "Routing Servers Cache";

/// Local endpoint for a component or an outgoing server connection.
pub trait RoutableChannel: Send + Sync {
    fn address(&self) -> Jid;

    fn process(&self, stanza: Stanza);
}

/// Shared caches backing the routing table.
pub struct RoutingCaches {
    users: CacheHandle<String, ClientRoute>,
    anonymous_users: CacheHandle<String, ClientRoute>,
    user_sessions: CacheHandle<String, BTreeSet<String>>,
    components: CacheHandle<String, BTreeSet<NodeId>>,
    servers: CacheHandle<String, NodeId>,
}

impl RoutingCaches {
    pub fn create(factory: &CacheFactory) -> Result<Self, CacheError> {
        Ok(Self {
            users: factory.create_cache(USERS_CACHE)?,
            anonymous_users: factory.create_cache(ANONYMOUS_USERS_CACHE)?,
            user_sessions: factory.create_cache(USER_SESSIONS_CACHE)?,
            components: factory.create_cache(COMPONENTS_CACHE)?,
            servers: factory.create_cache(SERVERS_CACHE)?,
        })
    }
}

/// Address-to-route table of this node.
pub struct RoutingTable {
    ctx: Weak<ServerContext>,
    local_node: NodeId,
    domain: String,
    policy: ResourceSelectionPolicy,
    caches: RoutingCaches,
    local_clients: DashMap<String, Arc<ClientSession>>,
    local_components: DashMap<String, Arc<dyn RoutableChannel>>,
    local_servers: DashMap<String, Arc<dyn RoutableChannel>>,
}

impl RoutingTable {
    pub fn new(
        ctx: Weak<ServerContext>,
        local_node: NodeId,
        domain: &str,
        policy: ResourceSelectionPolicy,
        caches: RoutingCaches,
    ) -> Self {
        Self {
            ctx,
            local_node,
            domain: domain.to_string(),
            policy,
            caches,
            local_clients: DashMap::new(),
            local_components: DashMap::new(),
            local_servers: DashMap::new(),
        }
    }

    pub fn policy(&self) -> ResourceSelectionPolicy {
        self.policy
    }

    fn is_local_domain(&self, domain: &str) -> bool {
        domain == self.domain
    }

    fn is_component_domain(&self, domain: &str) -> bool {
        self.local_components.contains_key(domain) || self.caches.components.contains_key(&domain.to_string())
    }

    // ---- client routes ----

    /// Add or refresh the route of a bound session. Returns `true` when the
    /// session was not in the local table before.
    ///
    /// Both cache locks are taken before anything is written, so a lock
    /// failure leaves no trace of the route.
    #[instrument(skip(self, session), fields(jid = %session.address()))]
    pub fn add_client_route(&self, session: &Arc<ClientSession>) -> Result<bool, RouterError> {
        let address = session.address();
        if address.resource().is_none() {
            return Err(RouterError::internal("client routes require a full JID"));
        }
        let key = address.to_string();
        let bare = address.to_bare().to_string();
        let route = ClientRoute::new(self.local_node, session.is_available());

        let cache = if session.is_anonymous() {
            &self.caches.anonymous_users
        } else {
            &self.caches.users
        };
        let _route_guard = cache.lock(&key)?;
        let _sessions_guard = self.caches.user_sessions.lock(&bare)?;

        cache.put(key.clone(), route);
        let mut resources = self.caches.user_sessions.get(&bare).unwrap_or_default();
        if resources.insert(key.clone()) {
            self.caches.user_sessions.put(bare, resources);
        }
        let added = self
            .local_clients
            .insert(key, Arc::clone(session))
            .is_none();

        debug!(available = route.available, added, "Client route updated");
        Ok(added)
    }

    /// Remove the route of a full JID wherever it is hosted.
    #[instrument(skip(self), fields(jid = %address))]
    pub fn remove_client_route(&self, address: &Jid) -> Result<bool, RouterError> {
        let local = self.local_clients.remove(&address.to_string()).is_some();
        let cached = self.remove_cached_client_route(address)?;
        if local || cached {
            debug!("Client route removed");
        }
        Ok(local || cached)
    }

    /// Remove the route of `session` only if it is still the session
    /// registered for its address.
    pub fn remove_client_session(&self, session: &Arc<ClientSession>) -> Result<bool, RouterError> {
        let address = session.address();
        let current = self
            .local_clients
            .get(&address.to_string())
            .map(|s| Arc::ptr_eq(s.value(), session))
            .unwrap_or(false);
        if !current {
            return Ok(false);
        }
        self.remove_client_route(&address)
    }

    /// Route of a full JID. Sessions hosted here stay routable from the
    /// local table when the shared caches cannot be read.
    pub fn get_client_route(&self, address: &Jid) -> Option<ClientRoute> {
        let key = address.to_string();
        self.caches
            .users
            .get(&key)
            .or_else(|| self.caches.anonymous_users.get(&key))
            .or_else(|| {
                self.local_client(address)
                    .map(|s| ClientRoute::new(self.local_node, s.is_available()))
            })
    }

    pub fn has_client_route(&self, address: &Jid) -> bool {
        self.get_client_route(address).is_some()
    }

    pub fn is_anonymous_route(&self, address: &Jid) -> bool {
        self.caches.anonymous_users.contains_key(&address.to_string())
            || self.local_client(address).is_some_and(|s| s.is_anonymous())
    }

    /// Whether `address` is served by this node.
    pub fn is_local_route(&self, address: &Jid) -> bool {
        let domain = address.domain().as_str();
        self.local_clients.contains_key(&address.to_string())
            || (address.node().is_none()
                && (self.local_components.contains_key(domain)
                    || self.local_servers.contains_key(domain)))
    }

    /// Session hosted on this node for a full JID.
    pub fn local_client(&self, address: &Jid) -> Option<Arc<ClientSession>> {
        self.local_clients
            .get(&address.to_string())
            .map(|s| Arc::clone(s.value()))
    }

    pub fn local_client_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.local_clients
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    /// Client routes across the cluster.
    pub fn client_route_count(&self) -> usize {
        self.caches.users.len() + self.caches.anonymous_users.len()
    }

    /// Full JIDs of every session of a bare JID, available or not.
    ///
    /// Falls back to the sessions hosted here when the shared cache has no
    /// entry for the user.
    pub fn user_resources(&self, bare: &Jid) -> Vec<Jid> {
        let bare = bare.to_bare();
        match self.caches.user_sessions.get(&bare.to_string()) {
            Some(resources) => resources.iter().filter_map(|s| Jid::new(s).ok()).collect(),
            None => self
                .local_clients
                .iter()
                .map(|s| s.value().address())
                .filter(|address| address.to_bare() == bare)
                .collect(),
        }
    }

    /// Snapshot of a session on this node.
    pub fn local_session_info(&self, address: &Jid) -> Option<SessionInfo> {
        self.local_client(address).map(|s| s.info())
    }

    /// Snapshot of a session anywhere in the cluster.
    pub fn session_info(&self, address: &Jid) -> Option<SessionInfo> {
        let route = self.get_client_route(address)?;
        if route.node_id == self.local_node {
            return self.local_session_info(address);
        }
        let ctx = self.ctx.upgrade()?;
        let locator = ctx.cluster().remote_session_locator()?;
        locator.client_session(&route.node_id, address)
    }

    // ---- route lookup ----

    /// Addresses a presence to `route` should be delivered to.
    ///
    /// For local users only available sessions are returned, plus sessions
    /// that directed presence to `requester`. Remote domains and known
    /// components resolve to `route` itself.
    pub fn get_routes(&self, route: &Jid, requester: Option<&Jid>) -> Vec<Jid> {
        let domain = route.domain().as_str();
        if self.is_local_domain(domain) {
            let candidates = if route.resource().is_some() {
                vec![route.clone()]
            } else {
                self.user_resources(route)
            };
            let directed = self.ctx.upgrade();
            candidates
                .into_iter()
                .filter(|jid| match self.get_client_route(jid) {
                    Some(r) if r.available => true,
                    Some(_) => directed
                        .as_ref()
                        .map(|ctx| ctx.directed_presences().has_direct_presence(jid, requester))
                        .unwrap_or(false),
                    None => false,
                })
                .collect()
        } else if self.is_component_domain(domain) {
            vec![route.clone()]
        } else if domain.ends_with(&format!(".{}", self.domain)) {
            // Unregistered subdomain of ours
            Vec::new()
        } else {
            vec![route.clone()]
        }
    }

    // ---- routing ----

    /// Route `stanza` to `to`. Failures are handed to the routing-failed
    /// handler of the stanza kind.
    ///
    /// `from_server` marks stanzas generated by the server itself, which may
    /// reach sessions that have not sent available presence.
    pub fn route_packet(&self, to: &Jid, stanza: Stanza, from_server: bool) {
        let kind = stanza.name();
        match self.route(to, stanza, from_server) {
            Ok(()) => metrics::record_routed(kind, "delivered"),
            Err(stanza) => {
                metrics::record_routing_failed(kind);
                self.routing_failed(to, stanza);
            }
        }
    }

    /// Route without failure handling. Returns whether the stanza was routed.
    pub fn try_route_packet(&self, to: &Jid, stanza: Stanza, from_server: bool) -> bool {
        self.route(to, stanza, from_server).is_ok()
    }

    fn route(&self, to: &Jid, stanza: Stanza, from_server: bool) -> Result<(), Stanza> {
        let domain = to.domain().as_str();
        if self.is_local_domain(domain) {
            if to.node().is_none() {
                self.deliver_to_server(stanza);
                return Ok(());
            }
            if to.resource().is_some() {
                return self.route_to_full_jid(to, stanza, from_server);
            }
            return self.route_to_bare_jid(to, stanza, from_server);
        }
        if self.is_component_domain(domain) {
            return self.route_to_component(domain, to, stanza);
        }
        self.route_to_remote_domain(domain, to, stanza)
    }

    fn route_to_full_jid(&self, to: &Jid, stanza: Stanza, from_server: bool) -> Result<(), Stanza> {
        let Some(route) = self.get_client_route(to) else {
            debug!(to = %to, "No client route");
            return Err(stanza);
        };

        if !route.available
            && self.route_only_available(&stanza, from_server)
            && !self.has_direct_presence(to, stanza.from())
            && !is_presence_reflection(&stanza)
        {
            debug!(to = %to, "Route is not available, only available sessions may receive this stanza");
            return Err(stanza);
        }

        if route.node_id == self.local_node {
            return match self.local_client(to) {
                Some(session) => {
                    self.deliver_to_session(&session, stanza);
                    Ok(())
                }
                None => {
                    warn!(to = %to, "Route points at this node but no session is registered");
                    Err(stanza)
                }
            };
        }

        let Some(ctx) = self.ctx.upgrade() else {
            return Err(stanza);
        };
        if !ctx.cluster().is_cluster_member(&route.node_id) {
            warn!(to = %to, node = %route.node_id, "Route points at a node outside the cluster, dropping it");
            if let Err(e) = self.remove_client_route(to) {
                warn!(to = %to, error = %e, "Unable to drop stale route");
            }
            return Err(stanza);
        }
        let Some(router) = ctx.cluster().remote_packet_router() else {
            debug!(to = %to, node = %route.node_id, "No remote packet router");
            return Err(stanza);
        };
        if router.route_packet(&route.node_id, to, &stanza) {
            return Ok(());
        }
        warn!(to = %to, node = %route.node_id, "Remote node refused stanza, dropping stale route");
        if let Err(e) = self.remove_client_route(to) {
            warn!(to = %to, error = %e, "Unable to drop stale route");
        }
        Err(stanza)
    }

    fn route_to_bare_jid(&self, to: &Jid, stanza: Stanza, from_server: bool) -> Result<(), Stanza> {
        match stanza.kind() {
            StanzaKind::Iq => {
                self.deliver_to_server(stanza);
                Ok(())
            }
            StanzaKind::Presence => {
                let routes = self.get_routes(to, stanza.from());
                let mut routed = false;
                for route in routes {
                    routed |= self.route(&route, stanza.clone(), from_server).is_ok();
                }
                if routed {
                    Ok(())
                } else {
                    Err(stanza)
                }
            }
            StanzaKind::Message => {
                let candidates = self
                    .user_resources(to)
                    .iter()
                    .filter_map(|jid| self.session_info(jid))
                    .collect();
                let selected = self.policy.select(candidates);
                let mut routed = false;
                for info in selected {
                    let Ok(full) = Jid::new(&info.address) else {
                        continue;
                    };
                    routed |= self.route(&full, stanza.clone(), from_server).is_ok();
                }
                if routed {
                    Ok(())
                } else {
                    Err(stanza)
                }
            }
        }
    }

    fn route_to_component(&self, domain: &str, to: &Jid, stanza: Stanza) -> Result<(), Stanza> {
        let local = self
            .local_components
            .get(domain)
            .map(|c| Arc::clone(c.value()));
        if let Some(component) = local {
            component.process(stanza);
            return Ok(());
        }

        let router = self
            .ctx
            .upgrade()
            .and_then(|ctx| ctx.cluster().remote_packet_router());
        if let Some(router) = router {
            let nodes = self
                .caches
                .components
                .get(&domain.to_string())
                .unwrap_or_default();
            for node in nodes.iter().filter(|n| **n != self.local_node) {
                if router.route_packet(node, to, &stanza) {
                    return Ok(());
                }
            }
        }
        debug!(domain, "Component not reachable");
        Err(stanza)
    }

    fn route_to_remote_domain(&self, domain: &str, to: &Jid, stanza: Stanza) -> Result<(), Stanza> {
        let local = self.local_servers.get(domain).map(|c| Arc::clone(c.value()));
        if let Some(server) = local {
            server.process(stanza);
            return Ok(());
        }

        if let Some(node) = self.caches.servers.get(&domain.to_string()) {
            if node != self.local_node {
                let router = self
                    .ctx
                    .upgrade()
                    .and_then(|ctx| ctx.cluster().remote_packet_router());
                if let Some(router) = router {
                    if router.route_packet(&node, to, &stanza) {
                        return Ok(());
                    }
                }
            }
        }
        debug!(domain, "No route to remote domain");
        Err(stanza)
    }

    /// Whether only available sessions may receive `stanza`.
    fn route_only_available(&self, stanza: &Stanza, from_server: bool) -> bool {
        if from_server {
            return false;
        }
        let from = stanza.from();
        match stanza.kind() {
            StanzaKind::Iq => match from {
                None => false,
                Some(from) => {
                    let server = from.domain().as_str() == self.domain
                        && from.node().is_none()
                        && from.resource().is_none();
                    !server && !self.is_component_domain(from.domain().as_str())
                }
            },
            StanzaKind::Message | StanzaKind::Presence => match from {
                None => true,
                Some(from) => {
                    from.to_string() != self.domain
                        && !self.is_component_domain(from.domain().as_str())
                }
            },
        }
    }

    fn has_direct_presence(&self, owner: &Jid, requester: Option<&Jid>) -> bool {
        self.ctx
            .upgrade()
            .map(|ctx| ctx.directed_presences().has_direct_presence(owner, requester))
            .unwrap_or(false)
    }

    /// Deliver to a session on this node through the outgoing interceptors.
    fn deliver_to_session(&self, session: &Arc<ClientSession>, stanza: Stanza) {
        let Some(ctx) = self.ctx.upgrade() else {
            session.process(stanza);
            return;
        };
        let interceptors = ctx.interceptors();
        if let Err(rejected) = interceptors.invoke(&stanza, Some(session), false, false) {
            debug!(to = %session.address(), %rejected, "Outgoing stanza rejected");
            metrics::record_rejected(stanza.name());
            return;
        }
        session.process(stanza.clone());
        let _ = interceptors.invoke(&stanza, Some(session), false, true);
    }

    /// Deliver a stanza that arrived from another node to a session,
    /// component or server connection hosted here.
    pub fn deliver_local(&self, to: &Jid, stanza: Stanza) -> bool {
        if let Some(session) = self.local_client(to) {
            self.deliver_to_session(&session, stanza);
            return true;
        }
        let domain = to.domain().as_str();
        let channel = self
            .local_components
            .get(domain)
            .or_else(|| self.local_servers.get(domain))
            .map(|c| Arc::clone(c.value()));
        match channel {
            Some(channel) => {
                channel.process(stanza);
                true
            }
            None => false,
        }
    }

    fn deliver_to_server(&self, stanza: Stanza) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.packet_router().deliver_to_server(stanza);
        }
    }

    fn routing_failed(&self, to: &Jid, stanza: Stanza) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.packet_router().routing_failed(to, stanza);
        }
    }

    /// Deliver `stanza` to every local session and, unless `only_local`, to
    /// every session on the other nodes.
    pub fn broadcast_packet(&self, stanza: &Stanza, only_local: bool) {
        for session in self.local_client_sessions() {
            self.deliver_to_session(&session, stanza.clone());
        }
        if only_local {
            return;
        }
        if let Some(router) = self
            .ctx
            .upgrade()
            .and_then(|ctx| ctx.cluster().remote_packet_router())
        {
            router.broadcast_packet(stanza);
        }
    }

    // ---- components ----

    pub fn add_component_route(
        &self,
        domain: &str,
        component: Arc<dyn RoutableChannel>,
    ) -> Result<(), RouterError> {
        self.local_components.insert(domain.to_string(), component);
        let key = domain.to_string();
        let _guard = self.caches.components.lock(&key)?;
        let mut nodes = self.caches.components.get(&key).unwrap_or_default();
        nodes.insert(self.local_node);
        self.caches.components.put(key, nodes);
        info!(domain, "Component route added");
        Ok(())
    }

    pub fn remove_component_route(&self, domain: &str) -> Result<bool, RouterError> {
        let local = self.local_components.remove(domain).is_some();
        let key = domain.to_string();
        {
            let _guard = self.caches.components.lock(&key)?;
            if let Some(mut nodes) = self.caches.components.get(&key) {
                nodes.remove(&self.local_node);
                if nodes.is_empty() {
                    self.caches.components.remove(&key);
                } else {
                    self.caches.components.put(key, nodes);
                }
            }
        }
        if local {
            info!(domain, "Component route removed");
            if let Some(ctx) = self.ctx.upgrade() {
                ctx.cluster().broadcast_task(ClusterTask::ComponentUnregistered {
                    domain: domain.to_string(),
                    node: self.local_node,
                })?;
            }
        }
        Ok(local)
    }

    /// Another node stopped hosting `domain`.
    pub fn component_unregistered(&self, domain: &str, node: &NodeId) {
        let key = domain.to_string();
        let _guard = match self.caches.components.lock(&key) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(domain, error = %e, "Unable to lock component route");
                return;
            }
        };
        if let Some(mut nodes) = self.caches.components.get(&key) {
            if nodes.remove(node) {
                if nodes.is_empty() {
                    self.caches.components.remove(&key);
                } else {
                    self.caches.components.put(key, nodes);
                }
            }
        }
        debug!(domain, %node, "Component unregistered on remote node");
    }

    pub fn has_component_route(&self, domain: &str) -> bool {
        self.is_component_domain(domain)
    }

    /// Nodes hosting `domain`.
    pub fn component_nodes(&self, domain: &str) -> BTreeSet<NodeId> {
        self.caches
            .components
            .get(&domain.to_string())
            .unwrap_or_default()
    }

    // ---- remote servers ----

    pub fn add_server_route(
        &self,
        domain: &str,
        server: Arc<dyn RoutableChannel>,
    ) -> Result<(), RouterError> {
        self.local_servers.insert(domain.to_string(), server);
        let key = domain.to_string();
        let _guard = self.caches.servers.lock(&key)?;
        self.caches.servers.put(key, self.local_node);
        info!(domain, "Server route added");
        Ok(())
    }

    pub fn remove_server_route(&self, domain: &str) -> Result<bool, RouterError> {
        let local = self.local_servers.remove(domain).is_some();
        let key = domain.to_string();
        let _guard = self.caches.servers.lock(&key)?;
        if self.caches.servers.get(&key) == Some(self.local_node) {
            self.caches.servers.remove(&key);
        }
        Ok(local)
    }

    pub fn has_server_route(&self, domain: &str) -> bool {
        self.local_servers.contains_key(domain) || self.caches.servers.contains_key(&domain.to_string())
    }

    // ---- cluster events ----

    /// Publish every local route into the (now shared) caches.
    pub fn joined_cluster(&self) {
        for session in self.local_client_sessions() {
            if let Err(e) = self.add_client_route(&session) {
                warn!(jid = %session.address(), error = %e, "Unable to publish client route");
            }
        }
        let components: Vec<(String, Arc<dyn RoutableChannel>)> = self
            .local_components
            .iter()
            .map(|c| (c.key().clone(), Arc::clone(c.value())))
            .collect();
        for (domain, component) in components {
            if let Err(e) = self.add_component_route(&domain, component) {
                warn!(domain = %domain, error = %e, "Unable to publish component route");
            }
        }
        let servers: Vec<(String, Arc<dyn RoutableChannel>)> = self
            .local_servers
            .iter()
            .map(|c| (c.key().clone(), Arc::clone(c.value())))
            .collect();
        for (domain, server) in servers {
            if let Err(e) = self.add_server_route(&domain, server) {
                warn!(domain = %domain, error = %e, "Unable to publish server route");
            }
        }
        info!(clients = self.local_clients.len(), "Local routes published to cluster");
    }

    /// Drop every route that belongs to another node.
    pub fn left_cluster(&self) {
        let removed = self.purge_routes(|node| node != self.local_node);
        info!(removed = removed.len(), "Removed routes of other cluster nodes");
    }

    /// Drop the routes of a node that left. Returns the client addresses
    /// whose routes were removed.
    pub fn node_left(&self, node: &NodeId) -> Vec<Jid> {
        let removed = self.purge_routes(|n| n == *node);
        info!(%node, removed = removed.len(), "Removed routes of departed node");
        removed
    }

    fn purge_routes(&self, matches: impl Fn(NodeId) -> bool) -> Vec<Jid> {
        let mut removed = Vec::new();
        for cache in [&self.caches.users, &self.caches.anonymous_users] {
            for (key, route) in cache.entries() {
                if !matches(route.node_id) {
                    continue;
                }
                match Jid::new(&key) {
                    Ok(jid) => {
                        if let Err(e) = self.remove_cached_client_route(&jid) {
                            warn!(jid = %key, error = %e, "Unable to remove client route");
                        }
                        removed.push(jid);
                    }
                    Err(_) => {
                        cache.remove(&key);
                    }
                }
            }
        }

        for (domain, nodes) in self.caches.components.entries() {
            let kept: BTreeSet<NodeId> = nodes.iter().copied().filter(|n| !matches(*n)).collect();
            if kept.len() == nodes.len() {
                continue;
            }
            if kept.is_empty() {
                self.caches.components.remove(&domain);
            } else {
                self.caches.components.put(domain, kept);
            }
        }

        for (domain, node) in self.caches.servers.entries() {
            if matches(node) {
                self.caches.servers.remove(&domain);
            }
        }
        removed
    }

    /// Remove cached route records without touching the local table.
    /// Returns whether a route record existed.
    fn remove_cached_client_route(&self, address: &Jid) -> Result<bool, RouterError> {
        let key = address.to_string();
        let bare = address.to_bare().to_string();
        let mut removed = false;
        for cache in [&self.caches.users, &self.caches.anonymous_users] {
            let _guard = cache.lock(&key)?;
            removed |= cache.remove(&key).is_some();
        }
        let _guard = self.caches.user_sessions.lock(&bare)?;
        if let Some(mut resources) = self.caches.user_sessions.get(&bare) {
            resources.remove(&key);
            if resources.is_empty() {
                self.caches.user_sessions.remove(&bare);
            } else {
                self.caches.user_sessions.put(bare, resources);
            }
        }
        Ok(removed)
    }
}

/// A user's own presence reflected to the user's other resources.
fn is_presence_reflection(stanza: &Stanza) -> bool {
    if stanza.kind() != StanzaKind::Presence {
        return false;
    }
    match (stanza.from(), stanza.to()) {
        (Some(from), Some(to)) => from.to_bare() == to.to_bare(),
        _ => false,
    }
}
