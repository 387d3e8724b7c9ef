//! In-process cluster.
//!
//! Several [`ServerContext`]s in one process share a
//! [`MemoryClusterBackend`] and run tasks on each other directly. Used for
//! single-process multi-node deployments and for cross-node tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{ClusterServices, ClusterTask, ClusterTransport, NodeId, TaskPacketRouter, TaskSessionLocator};
use crate::cache::MemoryClusterBackend;
use crate::context::ServerContext;
use crate::error::{ClusterError, RouterError};

/// Registry of nodes sharing one in-memory backend.
pub struct MemoryCluster {
    backend: Arc<MemoryClusterBackend>,
    nodes: RwLock<BTreeMap<NodeId, Weak<ServerContext>>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backend: MemoryClusterBackend::new(),
            nodes: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn backend(&self) -> &Arc<MemoryClusterBackend> {
        &self.backend
    }

    /// Configure `ctx` for this cluster and start clustering on it.
    pub fn join(self: &Arc<Self>, ctx: &Arc<ServerContext>) -> Result<(), RouterError> {
        let cluster = ctx.cluster();
        let local = cluster.local_node();
        let transport: Arc<dyn ClusterTransport> = Arc::new(MemoryTransport {
            cluster: Arc::clone(self),
            local,
        });
        cluster.configure(ClusterServices {
            backend: self.backend.clone(),
            remote_router: Arc::new(TaskPacketRouter::new(Arc::clone(&transport))),
            session_locator: Arc::new(TaskSessionLocator::new(Arc::clone(&transport))),
            transport,
        });

        let existing = self.live_nodes();
        self.nodes.write().insert(local, Arc::downgrade(ctx));
        if let Err(e) = cluster.start() {
            self.nodes.write().remove(&local);
            return Err(e);
        }

        for (node, other) in existing {
            cluster.member_joined(node);
            other.cluster().member_joined(local);
        }
        info!(node = %local, members = self.nodes.read().len(), "Node joined in-memory cluster");
        Ok(())
    }

    /// Gracefully remove `node`: it stops clustering and the others see it leave.
    pub fn leave(&self, node: &NodeId) {
        let ctx = self.nodes.write().remove(node).and_then(|w| w.upgrade());
        if let Some(ctx) = ctx {
            ctx.cluster().stop();
        }
        self.notify_left(node);
    }

    /// Remove `node` without letting it clean up, as if it crashed.
    pub fn crash(&self, node: &NodeId) {
        self.nodes.write().remove(node);
        self.notify_left(node);
    }

    fn notify_left(&self, node: &NodeId) {
        for (_, other) in self.live_nodes() {
            other.cluster().member_left(*node);
        }
    }

    fn live_nodes(&self) -> Vec<(NodeId, Arc<ServerContext>)> {
        self.nodes
            .read()
            .iter()
            .filter_map(|(id, ctx)| ctx.upgrade().map(|ctx| (*id, ctx)))
            .collect()
    }

    fn node(&self, node: &NodeId) -> Option<Arc<ServerContext>> {
        self.nodes.read().get(node).and_then(Weak::upgrade)
    }
}

struct MemoryTransport {
    cluster: Arc<MemoryCluster>,
    local: NodeId,
}

impl ClusterTransport for MemoryTransport {
    fn send(&self, node: &NodeId, payload: Vec<u8>) -> Result<Vec<u8>, ClusterError> {
        let ctx = self
            .cluster
            .node(node)
            .ok_or_else(|| ClusterError::UnknownNode(node.to_string()))?;
        let task = ClusterTask::decode(&payload)?;
        debug!(from = %self.local, to = %node, ?task, "Running cluster task");
        task.execute(&ctx).encode()
    }

    fn broadcast(&self, payload: Vec<u8>) -> Result<(), ClusterError> {
        for (node, ctx) in self.cluster.live_nodes() {
            if node == self.local {
                continue;
            }
            ClusterTask::decode(&payload)?.execute(&ctx);
        }
        Ok(())
    }
}
