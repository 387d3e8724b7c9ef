//! Route records and resource selection.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::cache::Cacheable;
use crate::cluster::NodeId;
use crate::config::{ServerProperties, ROUTE_ALL_RESOURCES};
use crate::session::SessionInfo;

/// Where a client session lives and whether it has sent available presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRoute {
    pub node_id: NodeId,
    pub available: bool,
}

impl ClientRoute {
    pub fn new(node_id: NodeId, available: bool) -> Self {
        Self { node_id, available }
    }
}

impl Cacheable for ClientRoute {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// How a message to a bare JID picks among the user's resources.
///
/// Only resources with non-negative priority are considered and only the
/// highest priority among them survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceSelectionPolicy {
    /// One resource: best `show`, then most recently active, then the
    /// smallest full JID.
    #[default]
    Best,
    /// Every resource sharing the highest priority.
    AllHighestPriority,
}

impl ResourceSelectionPolicy {
    pub fn from_properties(properties: &ServerProperties) -> Self {
        if properties.get_bool(ROUTE_ALL_RESOURCES, false) {
            Self::AllHighestPriority
        } else {
            Self::Best
        }
    }

    /// Pick the recipients among `candidates`.
    pub fn select(&self, candidates: Vec<SessionInfo>) -> Vec<SessionInfo> {
        let eligible: Vec<SessionInfo> = candidates
            .into_iter()
            .filter(|s| s.available && s.priority >= 0)
            .collect();
        let Some(highest) = eligible.iter().map(|s| s.priority).max() else {
            return Vec::new();
        };
        let mut top: Vec<SessionInfo> = eligible
            .into_iter()
            .filter(|s| s.priority == highest)
            .collect();

        match self {
            Self::AllHighestPriority => top,
            Self::Best => {
                top.sort_by(compare_best);
                top.truncate(1);
                top
            }
        }
    }
}

fn compare_best(a: &SessionInfo, b: &SessionInfo) -> Ordering {
    a.show
        .rank()
        .cmp(&b.show.rank())
        .then_with(|| b.last_active.cmp(&a.last_active))
        .then_with(|| a.address.cmp(&b.address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::Show;
    use chrono::{Duration, Utc};

    fn info(address: &str, priority: i8, show: Show, age_secs: i64) -> SessionInfo {
        SessionInfo {
            address: address.to_string(),
            available: true,
            priority,
            show,
            last_active: Utc::now() - Duration::seconds(age_secs),
            anonymous: false,
            presence: None,
        }
    }

    fn addresses(selected: &[SessionInfo]) -> Vec<&str> {
        selected.iter().map(|s| s.address.as_str()).collect()
    }

    #[test]
    fn test_negative_priority_never_selected() {
        let selected = ResourceSelectionPolicy::Best.select(vec![
            info("alice@example.com/a", -1, Show::Chat, 0),
            info("alice@example.com/b", -5, Show::Chat, 0),
        ]);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_highest_priority_wins_over_show() {
        let selected = ResourceSelectionPolicy::Best.select(vec![
            info("alice@example.com/a", 1, Show::Chat, 0),
            info("alice@example.com/b", 5, Show::Dnd, 0),
        ]);
        assert_eq!(addresses(&selected), vec!["alice@example.com/b"]);
    }

    #[test]
    fn test_show_then_recency_then_address() {
        let selected = ResourceSelectionPolicy::Best.select(vec![
            info("alice@example.com/away", 0, Show::Away, 0),
            info("alice@example.com/old", 0, Show::Chat, 100),
            info("alice@example.com/new", 0, Show::Chat, 5),
        ]);
        assert_eq!(addresses(&selected), vec!["alice@example.com/new"]);

        let now = Utc::now();
        let mut a = info("alice@example.com/z", 0, Show::Available, 0);
        let mut b = info("alice@example.com/m", 0, Show::Available, 0);
        a.last_active = now;
        b.last_active = now;
        let selected = ResourceSelectionPolicy::Best.select(vec![a, b]);
        assert_eq!(addresses(&selected), vec!["alice@example.com/m"]);
    }

    #[test]
    fn test_all_highest_priority_returns_ties() {
        let mut selected = ResourceSelectionPolicy::AllHighestPriority.select(vec![
            info("alice@example.com/a", 2, Show::Away, 0),
            info("alice@example.com/b", 2, Show::Chat, 0),
            info("alice@example.com/c", 1, Show::Chat, 0),
        ]);
        selected.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(
            addresses(&selected),
            vec!["alice@example.com/a", "alice@example.com/b"]
        );
    }

    #[test]
    fn test_unavailable_sessions_skipped() {
        let mut offline = info("alice@example.com/a", 9, Show::Chat, 0);
        offline.available = false;
        let selected = ResourceSelectionPolicy::Best.select(vec![
            offline,
            info("alice@example.com/b", 0, Show::Xa, 0),
        ]);
        assert_eq!(addresses(&selected), vec!["alice@example.com/b"]);
    }
}
