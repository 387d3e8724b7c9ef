//! Process-wide server context.
//!
//! One [`ServerContext`] owns every component of a node: properties,
//! caches, cluster membership, routing table, sessions and routers.
//! Components keep a `Weak` handle back to it, so dropping the last `Arc`
//! tears the node down.

use std::sync::{Arc, Weak};

use jid::Jid;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::CacheFactory;
use crate::cluster::{ClusterEventListener, ClusterManager, NodeId};
use crate::config::{ServerProperties, CLUSTERING_ENABLED};
use crate::connection::PacketDeliverer;
use crate::error::RouterError;
use crate::provider::{ProviderRegistry, Providers, RemotePresenceListener};
use crate::router::{
    InterceptorManager, IqHandler, IqRouter, MessageRouter, OfflineMessageStrategy, OfflineType,
    PacketInterceptor, PacketRouter, PresenceCaches, PresenceManager, PresenceRouter,
    PresenceUpdateHandler,
};
use crate::routing::{
    DirectedPresenceTracker, ResourceSelectionPolicy, RoutingCaches, RoutingTable,
    DIRECTED_PRESENCES_CACHE,
};
use crate::session::{SessionEventListener, SessionManager};

/// Components of one server node.
pub struct ServerContext {
    properties: Arc<ServerProperties>,
    domain: String,
    server_jid: Jid,
    node_id: NodeId,
    cache_factory: Arc<CacheFactory>,
    cluster: ClusterManager,
    providers: Providers,
    routing_table: RoutingTable,
    session_manager: SessionManager,
    directed_presences: DirectedPresenceTracker,
    interceptors: InterceptorManager,
    packet_router: PacketRouter,
    presence_router: PresenceRouter,
    message_router: MessageRouter,
    iq_router: IqRouter,
    presence_update_handler: PresenceUpdateHandler,
    presence_manager: PresenceManager,
    offline_strategy: Arc<OfflineMessageStrategy>,
    shutdown: CancellationToken,
}

impl ServerContext {
    pub fn builder() -> ServerContextBuilder {
        ServerContextBuilder::new()
    }

    pub fn properties(&self) -> &Arc<ServerProperties> {
        &self.properties
    }

    /// Served XMPP domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Address of the server itself.
    pub fn server_jid(&self) -> Jid {
        self.server_jid.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cache_factory(&self) -> &Arc<CacheFactory> {
        &self.cache_factory
    }

    pub fn cluster(&self) -> &ClusterManager {
        &self.cluster
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    pub fn directed_presences(&self) -> &DirectedPresenceTracker {
        &self.directed_presences
    }

    pub fn interceptors(&self) -> &InterceptorManager {
        &self.interceptors
    }

    pub fn packet_router(&self) -> &PacketRouter {
        &self.packet_router
    }

    pub fn presence_router(&self) -> &PresenceRouter {
        &self.presence_router
    }

    pub fn message_router(&self) -> &MessageRouter {
        &self.message_router
    }

    pub fn iq_router(&self) -> &IqRouter {
        &self.iq_router
    }

    pub fn presence_update_handler(&self) -> &PresenceUpdateHandler {
        &self.presence_update_handler
    }

    pub fn presence_manager(&self) -> &PresenceManager {
        &self.presence_manager
    }

    pub fn offline_strategy(&self) -> &Arc<OfflineMessageStrategy> {
        &self.offline_strategy
    }

    /// Sink for stanzas a connection could not write.
    pub fn backup_deliverer(&self) -> Arc<dyn PacketDeliverer> {
        self.offline_strategy.clone()
    }

    /// Token cancelled when the node shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start clustering if `clustering.enabled` is set.
    ///
    /// Fails when the cluster collaborators have not been configured.
    pub fn start_clustering_if_enabled(&self) -> Result<(), RouterError> {
        if !self.cluster.is_clustering_enabled() {
            return Ok(());
        }
        self.cluster.start()
    }

    /// Stop the node: every session is told the server is going down and
    /// closed, then the node leaves the cluster.
    pub async fn shutdown(&self) {
        info!(domain = %self.domain, node = %self.node_id, "Shutting down");
        self.shutdown.cancel();
        self.session_manager.close_all().await;
        self.cluster.stop();
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("domain", &self.domain)
            .field("node_id", &self.node_id)
            .field("sessions", &self.session_manager.session_count())
            .finish()
    }
}

/// Builder for [`ServerContext`].
pub struct ServerContextBuilder {
    properties: Arc<ServerProperties>,
    node_id: Option<NodeId>,
    providers: Providers,
    iq_handlers: Vec<Arc<dyn IqHandler>>,
    interceptors: Vec<Arc<dyn PacketInterceptor>>,
    session_listeners: Vec<Arc<dyn SessionEventListener>>,
}

impl Default for ServerContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContextBuilder {
    pub fn new() -> Self {
        Self {
            properties: Arc::new(ServerProperties::new()),
            node_id: None,
            providers: Providers::default(),
            iq_handlers: Vec::new(),
            interceptors: Vec::new(),
            session_listeners: Vec::new(),
        }
    }

    /// Use an existing property store.
    pub fn properties(mut self, properties: Arc<ServerProperties>) -> Self {
        self.properties = properties;
        self
    }

    pub fn property(self, name: &str, value: &str) -> Self {
        self.properties.set(name, value);
        self
    }

    pub fn domain(self, domain: &str) -> Self {
        self.property(crate::config::XMPP_DOMAIN, domain)
    }

    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Injected collaborators. Unset ones are filled from configuration.
    pub fn providers(mut self, providers: Providers) -> Self {
        let listeners = std::mem::take(&mut self.providers.remote_presence_listeners);
        self.providers = providers;
        self.providers.remote_presence_listeners.extend(listeners);
        self
    }

    pub fn iq_handler(mut self, handler: Arc<dyn IqHandler>) -> Self {
        self.iq_handlers.push(handler);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn PacketInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn session_listener(mut self, listener: Arc<dyn SessionEventListener>) -> Self {
        self.session_listeners.push(listener);
        self
    }

    pub fn remote_presence_listener(mut self, listener: Arc<dyn RemotePresenceListener>) -> Self {
        self.providers.remote_presence_listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<Arc<ServerContext>, RouterError> {
        let properties = self.properties;
        let domain = properties.domain();
        let server_jid = Jid::new(&domain)
            .map_err(|e| RouterError::config(format!("invalid xmpp.domain '{}': {}", domain, e)))?;
        let node_id = self.node_id.unwrap_or_else(NodeId::new);
        let providers = ProviderRegistry::resolve(&properties, self.providers)?;

        let cache_factory = Arc::new(CacheFactory::new(Arc::clone(&properties)));
        let routing_caches = RoutingCaches::create(&cache_factory)?;
        let presence_caches = PresenceCaches::create(&cache_factory)?;
        let directed_cache = cache_factory.create_cache(DIRECTED_PRESENCES_CACHE)?;
        let policy = ResourceSelectionPolicy::from_properties(&properties);
        let offline_type = OfflineType::from_properties(&properties);
        let clustering = properties.get_bool(CLUSTERING_ENABLED, false);

        let ctx = Arc::new_cyclic(|weak: &Weak<ServerContext>| ServerContext {
            cluster: ClusterManager::new(node_id, Arc::clone(&cache_factory), clustering),
            routing_table: RoutingTable::new(weak.clone(), node_id, &domain, policy, routing_caches),
            session_manager: SessionManager::new(weak.clone()),
            directed_presences: DirectedPresenceTracker::new(directed_cache),
            interceptors: InterceptorManager::new(),
            packet_router: PacketRouter::new(weak.clone()),
            presence_router: PresenceRouter::new(weak.clone()),
            message_router: MessageRouter::new(weak.clone()),
            iq_router: IqRouter::new(weak.clone()),
            presence_update_handler: PresenceUpdateHandler::new(weak.clone()),
            presence_manager: PresenceManager::new(weak.clone(), presence_caches),
            offline_strategy: Arc::new(OfflineMessageStrategy::new(weak.clone(), offline_type)),
            shutdown: CancellationToken::new(),
            properties,
            domain,
            server_jid,
            node_id,
            cache_factory,
            providers,
        });

        for handler in self.iq_handlers {
            ctx.iq_router.add_handler(handler);
        }
        for interceptor in self.interceptors {
            ctx.interceptors.add(interceptor);
        }
        for listener in self.session_listeners {
            ctx.session_manager.events().add_listener(listener);
        }
        ctx.cluster.add_listener(Arc::new(ContextClusterListener {
            ctx: Arc::downgrade(&ctx),
        }));

        info!(
            domain = %ctx.domain,
            node = %ctx.node_id,
            policy = ?policy,
            offline = ?offline_type,
            "Server context ready"
        );
        Ok(ctx)
    }
}

/// Keeps routing state in step with cluster membership.
struct ContextClusterListener {
    ctx: Weak<ServerContext>,
}

impl ClusterEventListener for ContextClusterListener {
    fn joined_cluster(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.routing_table().joined_cluster();
        }
    }

    fn left_cluster(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.routing_table().left_cluster();
        }
    }

    fn node_left(&self, node: &NodeId) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        // Shared route records are cleaned once, by the senior member.
        if !ctx.cluster().is_senior_member() {
            return;
        }
        let departed = ctx.routing_table().node_left(node);
        ctx.presence_update_handler().node_left(node, &departed);
    }
}
