//! # waddle-router
//!
//! Routing and session core of a clustered XMPP server.
//!
//! Every stanza entering a node passes through this crate: it is attributed
//! to a client session, run through the interceptors, resolved against the
//! cluster-wide routing table and delivered to a local session, to the node
//! owning the recipient's session, or to the server itself.
//!
//! ## Architecture
//!
//! - **Context**: [`ServerContext`] owns every component of a node
//! - **Cache**: named caches, local or cluster-backed, with key locks
//! - **Cluster**: node identity, membership, senior member and remote tasks
//! - **Connection**: socket transport with a single writer task and backup delivery
//! - **Session**: client session state machine and the session manager
//! - **Routing**: routing table of client, component and server routes
//! - **Router**: presence, message and IQ routers, presence tracking, offline handling
//! - **Server**: C2S listener, stream negotiation and the stanza worker pool

pub mod cache;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod context;
pub mod metrics;
pub mod provider;
pub mod router;
pub mod routing;
pub mod server;
pub mod session;
pub mod stanza;

mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ServerProperties;
pub use context::{ServerContext, ServerContextBuilder};
pub use error::{
    generate_stream_error, stream_error_element, stream_errors, CacheError, ClusterError,
    PacketRejected, RouterError, StanzaErrorCondition, StanzaErrorType, STREAM_CLOSE,
};
pub use stanza::{ns, IqType, MessageType, PresenceType, Show, Stanza, StanzaKind};
