//! Cluster node identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::Cacheable;

/// Identifier of a cluster member.
///
/// Fixed 16 bytes, compared and ordered bytewise. Every process creates one
/// at startup and keeps it for its whole lifetime, clustered or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build from the 16 raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Creates a node ID from a UUID string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form, like an abbreviated commit hash
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Cacheable for NodeId {
    fn cached_size(&self) -> usize {
        16
    }
}
