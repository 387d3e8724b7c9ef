//! Cluster membership and cross-node routing hooks.
//!
//! A node always has a [`NodeId`], clustered or not. Clustering is started
//! through the [`ClusterManager`] once the remote packet router, the remote
//! session locator, the cache backend and a task transport are configured.
//! Starting swaps every cache onto the cluster backend; stopping swaps them
//! back and purges routes that belonged to other nodes.

mod memory;
mod node;
mod task;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use jid::Jid;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

pub use memory::MemoryCluster;
pub use node::NodeId;
pub use task::{ClusterTask, TaskPacketRouter, TaskResult, TaskSessionLocator};

use crate::cache::{CacheFactory, ClusterBackend};
use crate::error::{ClusterError, RouterError};
use crate::metrics;
use crate::session::SessionInfo;
use crate::stanza::Stanza;

/// Delivers stanzas to sessions hosted on other cluster nodes.
pub trait RemotePacketRouter: Send + Sync {
    /// Route `stanza` to `recipient` on `node`. Returns whether the remote
    /// node accepted it.
    fn route_packet(&self, node: &NodeId, recipient: &Jid, stanza: &Stanza) -> bool;

    /// Deliver `stanza` to every local session of every other node.
    fn broadcast_packet(&self, stanza: &Stanza);
}

/// Reads information about client sessions hosted on other nodes.
pub trait RemoteSessionLocator: Send + Sync {
    fn client_session(&self, node: &NodeId, address: &Jid) -> Option<SessionInfo>;
}

/// Request/response channel between cluster nodes.
///
/// Payloads are encoded [`ClusterTask`]s and [`TaskResult`]s.
pub trait ClusterTransport: Send + Sync {
    /// Run a task on `node` and wait for its encoded result.
    fn send(&self, node: &NodeId, payload: Vec<u8>) -> Result<Vec<u8>, ClusterError>;

    /// Run a task on every other member, ignoring results.
    fn broadcast(&self, payload: Vec<u8>) -> Result<(), ClusterError>;
}

/// Receives cluster membership changes.
pub trait ClusterEventListener: Send + Sync {
    /// This node joined a cluster.
    fn joined_cluster(&self) {}

    /// This node left the cluster.
    fn left_cluster(&self) {}

    /// Another node joined.
    fn node_joined(&self, _node: &NodeId) {}

    /// Another node left or crashed.
    fn node_left(&self, _node: &NodeId) {}

    /// The senior member changed.
    fn senior_changed(&self, _senior: &NodeId) {}
}

/// Collaborators required to start clustering.
pub struct ClusterServices {
    pub backend: Arc<dyn ClusterBackend>,
    pub transport: Arc<dyn ClusterTransport>,
    pub remote_router: Arc<dyn RemotePacketRouter>,
    pub session_locator: Arc<dyn RemoteSessionLocator>,
}

/// Cluster membership of the local node.
pub struct ClusterManager {
    local_node: NodeId,
    cache_factory: Arc<CacheFactory>,
    enabled: AtomicBool,
    started: AtomicBool,
    members: RwLock<BTreeSet<NodeId>>,
    backend: RwLock<Option<Arc<dyn ClusterBackend>>>,
    transport: RwLock<Option<Arc<dyn ClusterTransport>>>,
    remote_router: RwLock<Option<Arc<dyn RemotePacketRouter>>>,
    session_locator: RwLock<Option<Arc<dyn RemoteSessionLocator>>>,
    listeners: RwLock<Vec<Arc<dyn ClusterEventListener>>>,
}

impl ClusterManager {
    pub fn new(local_node: NodeId, cache_factory: Arc<CacheFactory>, enabled: bool) -> Self {
        Self {
            local_node,
            cache_factory,
            enabled: AtomicBool::new(enabled),
            started: AtomicBool::new(false),
            members: RwLock::new(BTreeSet::new()),
            backend: RwLock::new(None),
            transport: RwLock::new(None),
            remote_router: RwLock::new(None),
            session_locator: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Whether clustering is switched on in configuration.
    pub fn is_clustering_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_clustering_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether this node is currently part of a running cluster.
    pub fn is_clustering_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Install every collaborator at once.
    pub fn configure(&self, services: ClusterServices) {
        *self.backend.write() = Some(services.backend);
        *self.transport.write() = Some(services.transport);
        *self.remote_router.write() = Some(services.remote_router);
        *self.session_locator.write() = Some(services.session_locator);
    }

    pub fn set_remote_packet_router(&self, router: Option<Arc<dyn RemotePacketRouter>>) {
        *self.remote_router.write() = router;
    }

    pub fn set_remote_session_locator(&self, locator: Option<Arc<dyn RemoteSessionLocator>>) {
        *self.session_locator.write() = locator;
    }

    pub fn remote_packet_router(&self) -> Option<Arc<dyn RemotePacketRouter>> {
        self.remote_router.read().clone()
    }

    pub fn remote_session_locator(&self) -> Option<Arc<dyn RemoteSessionLocator>> {
        self.session_locator.read().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Join the cluster.
    ///
    /// Fails with a configuration error when any collaborator is missing;
    /// nothing is changed in that case.
    #[instrument(skip(self), fields(node = %self.local_node))]
    pub fn start(&self) -> Result<(), RouterError> {
        if self.is_clustering_started() {
            return Ok(());
        }
        if self.remote_router.read().is_none() {
            return Err(RouterError::config(
                "clustering requires a remote packet router",
            ));
        }
        if self.session_locator.read().is_none() {
            return Err(RouterError::config(
                "clustering requires a remote session locator",
            ));
        }
        if self.transport.read().is_none() {
            return Err(RouterError::config("clustering requires a task transport"));
        }
        let backend = self
            .backend
            .read()
            .clone()
            .ok_or_else(|| RouterError::config("clustering requires a cache backend"))?;

        self.cache_factory.start_clustering(backend);
        self.members.write().insert(self.local_node);
        self.started.store(true, Ordering::SeqCst);
        metrics::record_cluster_members(self.members.read().len() as i64);
        info!("Joined cluster");

        for listener in self.listeners() {
            listener.joined_cluster();
        }
        Ok(())
    }

    /// Leave the cluster.
    ///
    /// The remote packet router is removed before anything else so no
    /// stanza is forwarded to a node we are detaching from.
    #[instrument(skip(self), fields(node = %self.local_node))]
    pub fn stop(&self) {
        if !self.is_clustering_started() {
            return;
        }
        *self.remote_router.write() = None;

        self.cache_factory.stop_clustering();
        self.members.write().clear();
        self.started.store(false, Ordering::SeqCst);
        metrics::record_cluster_members(0);
        info!("Left cluster");

        for listener in self.listeners() {
            listener.left_cluster();
        }
        *self.session_locator.write() = None;
    }

    /// Record that `node` joined.
    pub fn member_joined(&self, node: NodeId) {
        if node == self.local_node || !self.is_clustering_started() {
            return;
        }
        let (inserted, senior_before, senior_after) = {
            let mut members = self.members.write();
            let before = members.first().copied();
            let inserted = members.insert(node);
            (inserted, before, members.first().copied())
        };
        if !inserted {
            return;
        }
        debug!(%node, "Cluster member joined");
        metrics::record_cluster_members(self.members.read().len() as i64);
        for listener in self.listeners() {
            listener.node_joined(&node);
        }
        self.notify_senior_change(senior_before, senior_after);
    }

    /// Record that `node` left or crashed.
    pub fn member_left(&self, node: NodeId) {
        if node == self.local_node {
            return;
        }
        let (removed, senior_before, senior_after) = {
            let mut members = self.members.write();
            let before = members.first().copied();
            let removed = members.remove(&node);
            (removed, before, members.first().copied())
        };
        if !removed {
            return;
        }
        info!(%node, "Cluster member left");
        metrics::record_cluster_members(self.members.read().len() as i64);
        self.notify_senior_change(senior_before, senior_after);
        for listener in self.listeners() {
            listener.node_left(&node);
        }
    }

    /// Current members, ordered by node ID. Empty when not clustered.
    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().iter().copied().collect()
    }

    pub fn is_cluster_member(&self, node: &NodeId) -> bool {
        *node == self.local_node || self.members.read().contains(node)
    }

    /// The member with the lowest node ID, or this node when not clustered.
    pub fn senior_member(&self) -> NodeId {
        if !self.is_clustering_started() {
            return self.local_node;
        }
        self.members
            .read()
            .first()
            .copied()
            .unwrap_or(self.local_node)
    }

    pub fn is_senior_member(&self) -> bool {
        self.senior_member() == self.local_node
    }

    /// Run a task on `node` and wait for the result.
    pub fn run_task(&self, node: &NodeId, task: ClusterTask) -> Result<TaskResult, RouterError> {
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| RouterError::config("no cluster transport configured"))?;
        Ok(task::run(transport.as_ref(), node, &task)?)
    }

    /// Run a task on every other member.
    pub fn broadcast_task(&self, task: ClusterTask) -> Result<(), RouterError> {
        if !self.is_clustering_started() {
            return Ok(());
        }
        let transport = self
            .transport
            .read()
            .clone()
            .ok_or_else(|| RouterError::config("no cluster transport configured"))?;
        transport.broadcast(task.encode()?)?;
        Ok(())
    }

    fn listeners(&self) -> Vec<Arc<dyn ClusterEventListener>> {
        self.listeners.read().clone()
    }

    fn notify_senior_change(&self, before: Option<NodeId>, after: Option<NodeId>) {
        if before == after {
            return;
        }
        if let Some(senior) = after {
            if senior == self.local_node {
                info!("This node is now the senior cluster member");
            }
            for listener in self.listeners() {
                listener.senior_changed(&senior);
            }
        } else {
            warn!("Cluster has no members left");
        }
    }
}
