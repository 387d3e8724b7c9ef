//! Serializable tasks executed on other cluster nodes.

use std::sync::Arc;

use jid::Jid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ClusterTransport, NodeId, RemotePacketRouter, RemoteSessionLocator};
use crate::context::ServerContext;
use crate::error::ClusterError;
use crate::session::SessionInfo;
use crate::stanza::Stanza;

/// Work shipped to another node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum ClusterTask {
    /// Deliver a stanza to a session hosted on the target node
    RoutePacket { to: String, stanza: Stanza },
    /// Deliver a stanza to every session hosted on the target node
    BroadcastPacket { stanza: Stanza },
    /// Read the state of a session hosted on the target node
    GetSessionInfo { jid: String },
    /// A node stopped hosting a component
    ComponentUnregistered { domain: String, node: NodeId },
}

/// Outcome of a [`ClusterTask`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum TaskResult {
    Done,
    Routed(bool),
    SessionInfo(Option<SessionInfo>),
}

impl ClusterTask {
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ClusterError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Run the task against the local node.
    pub fn execute(self, ctx: &ServerContext) -> TaskResult {
        match self {
            ClusterTask::RoutePacket { to, stanza } => match Jid::new(&to) {
                Ok(jid) => TaskResult::Routed(ctx.routing_table().deliver_local(&jid, stanza)),
                Err(e) => {
                    warn!(to = %to, error = %e, "Cluster task carried an invalid address");
                    TaskResult::Routed(false)
                }
            },
            ClusterTask::BroadcastPacket { stanza } => {
                ctx.routing_table().broadcast_packet(&stanza, true);
                TaskResult::Done
            }
            ClusterTask::GetSessionInfo { jid } => TaskResult::SessionInfo(
                Jid::new(&jid)
                    .ok()
                    .and_then(|jid| ctx.routing_table().local_session_info(&jid)),
            ),
            ClusterTask::ComponentUnregistered { domain, node } => {
                ctx.routing_table().component_unregistered(&domain, &node);
                TaskResult::Done
            }
        }
    }
}

impl TaskResult {
    pub fn encode(&self) -> Result<Vec<u8>, ClusterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ClusterError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Encode `task`, run it on `node` and decode the result.
pub(super) fn run(
    transport: &dyn ClusterTransport,
    node: &NodeId,
    task: &ClusterTask,
) -> Result<TaskResult, ClusterError> {
    let reply = transport.send(node, task.encode()?)?;
    TaskResult::decode(&reply)
}

/// [`RemotePacketRouter`] that ships stanzas as cluster tasks.
pub struct TaskPacketRouter {
    transport: Arc<dyn ClusterTransport>,
}

impl TaskPacketRouter {
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self { transport }
    }
}

impl RemotePacketRouter for TaskPacketRouter {
    fn route_packet(&self, node: &NodeId, recipient: &Jid, stanza: &Stanza) -> bool {
        let task = ClusterTask::RoutePacket {
            to: recipient.to_string(),
            stanza: stanza.clone(),
        };
        match run(self.transport.as_ref(), node, &task) {
            Ok(TaskResult::Routed(routed)) => routed,
            Ok(other) => {
                warn!(%node, ?other, "Unexpected reply to remote routing task");
                false
            }
            Err(e) => {
                debug!(%node, error = %e, "Remote routing failed");
                false
            }
        }
    }

    fn broadcast_packet(&self, stanza: &Stanza) {
        let task = ClusterTask::BroadcastPacket {
            stanza: stanza.clone(),
        };
        if let Err(e) = task.encode().and_then(|p| self.transport.broadcast(p)) {
            warn!(error = %e, "Cluster broadcast failed");
        }
    }
}

/// [`RemoteSessionLocator`] that asks the owning node through a task.
pub struct TaskSessionLocator {
    transport: Arc<dyn ClusterTransport>,
}

impl TaskSessionLocator {
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self { transport }
    }
}

impl RemoteSessionLocator for TaskSessionLocator {
    fn client_session(&self, node: &NodeId, address: &Jid) -> Option<SessionInfo> {
        let task = ClusterTask::GetSessionInfo {
            jid: address.to_string(),
        };
        match run(self.transport.as_ref(), node, &task) {
            Ok(TaskResult::SessionInfo(info)) => info,
            Ok(_) => None,
            Err(e) => {
                debug!(%node, error = %e, "Remote session lookup failed");
                None
            }
        }
    }
}
