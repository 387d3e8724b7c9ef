//! Directed presence bookkeeping.
//!
//! When a user sends available presence to an entity that will not learn
//! about the user going offline through the roster, the recipient is
//! recorded here so an unavailable presence can be sent to it later.

use std::collections::BTreeSet;

use jid::Jid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{Cache, CacheHandle, Cacheable};
use crate::cluster::NodeId;
use crate::error::RouterError;

/// Name of the cache holding directed presences keyed by sender full JID.
pub const DIRECTED_PRESENCES_CACHE: &str = "Directed Presences";

/// Recipients of directed presence reached through one handler address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectedPresence {
    /// Node hosting the sender's session
    pub node_id: NodeId,
    /// Route the presence was delivered through
    pub handler: String,
    /// Addresses the sender directed presence to
    pub receivers: BTreeSet<String>,
}

impl DirectedPresence {
    pub fn new(node_id: NodeId, handler: &Jid) -> Self {
        Self {
            node_id,
            handler: handler.to_string(),
            receivers: BTreeSet::new(),
        }
    }

    pub fn add_receiver(&mut self, receiver: &str) {
        self.receivers.insert(receiver.to_string());
    }

    pub fn remove_receiver(&mut self, receiver: &str) {
        self.receivers.remove(receiver);
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

impl Cacheable for DirectedPresence {
    fn cached_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.handler.len()
            + self.receivers.iter().map(String::len).sum::<usize>()
    }
}

/// Directed presences of every sender, stored in a shared cache.
///
/// Updates are read-modify-write under the cache lock of the sender key.
pub struct DirectedPresenceTracker {
    cache: CacheHandle<String, Vec<DirectedPresence>>,
}

impl DirectedPresenceTracker {
    pub fn new(cache: CacheHandle<String, Vec<DirectedPresence>>) -> Self {
        Self { cache }
    }

    /// Record that `sender` directed presence to `receiver` through `handler`.
    pub fn add(
        &self,
        node_id: NodeId,
        sender: &Jid,
        handler: &Jid,
        receiver: &str,
    ) -> Result<(), RouterError> {
        let key = sender.to_string();
        let handler_key = handler.to_string();
        let _guard = self.cache.lock(&key)?;

        let mut records = self.cache.get(&key).unwrap_or_default();
        match records.iter_mut().find(|d| d.handler == handler_key) {
            Some(record) => record.add_receiver(receiver),
            None => {
                let mut record = DirectedPresence::new(node_id, handler);
                record.add_receiver(receiver);
                records.push(record);
            }
        }
        self.cache.put(key, records);
        debug!(sender = %sender, handler = %handler, receiver, "Tracking directed presence");
        Ok(())
    }

    /// Forget `receiver`. Records left without receivers are removed, and
    /// the sender's entry goes away once no record remains.
    pub fn remove(&self, sender: &Jid, handler: &Jid, receiver: &str) -> Result<(), RouterError> {
        let key = sender.to_string();
        let handler_key = handler.to_string();
        let _guard = self.cache.lock(&key)?;

        let Some(mut records) = self.cache.get(&key) else {
            return Ok(());
        };
        if let Some(index) = records.iter().position(|d| d.handler == handler_key) {
            records[index].remove_receiver(receiver);
            if records[index].is_empty() {
                records.remove(index);
            }
        }
        if records.is_empty() {
            self.cache.remove(&key);
        } else {
            self.cache.put(key, records);
        }
        Ok(())
    }

    /// Remove and return every record of `sender`.
    pub fn take_all(&self, sender: &Jid) -> Vec<DirectedPresence> {
        let key = sender.to_string();
        let _guard = match self.cache.lock(&key) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(sender = %sender, error = %e, "Unable to lock directed presences");
                return Vec::new();
            }
        };
        self.cache.remove(&key).unwrap_or_default()
    }

    /// Records of `sender`.
    pub fn get(&self, sender: &Jid) -> Vec<DirectedPresence> {
        self.cache.get(&sender.to_string()).unwrap_or_default()
    }

    /// Whether `owner` directed presence to an address of `recipient`'s bare
    /// JID, so the recipient may see stanzas from an unavailable owner.
    pub fn has_direct_presence(&self, owner: &Jid, recipient: Option<&Jid>) -> bool {
        let Some(recipient) = recipient else {
            return false;
        };
        let bare = recipient.to_bare();
        self.get(owner)
            .iter()
            .flat_map(|d| d.receivers.iter())
            .filter_map(|receiver| Jid::new(receiver).ok())
            .any(|receiver| receiver.to_bare() == bare)
    }

    /// Remove records whose sender session lived on `node`, returning them
    /// keyed by sender.
    pub fn remove_for_node(&self, node: &NodeId) -> Vec<(String, DirectedPresence)> {
        let mut removed = Vec::new();
        for (sender, _) in self.cache.entries() {
            let _guard = match self.cache.lock(&sender) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(sender = %sender, error = %e, "Unable to lock directed presences");
                    continue;
                }
            };
            let Some(records) = self.cache.get(&sender) else {
                continue;
            };
            let (expired, kept): (Vec<_>, Vec<_>) =
                records.into_iter().partition(|d| d.node_id == *node);
            if expired.is_empty() {
                continue;
            }
            if kept.is_empty() {
                self.cache.remove(&sender);
            } else {
                self.cache.put(sender.clone(), kept);
            }
            removed.extend(expired.into_iter().map(|d| (sender.clone(), d)));
        }
        removed
    }

    /// Number of senders with tracked directed presence.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheFactory;
    use crate::config::ServerProperties;
    use std::sync::Arc;

    fn tracker() -> (DirectedPresenceTracker, Arc<CacheFactory>) {
        let factory = Arc::new(CacheFactory::new(Arc::new(ServerProperties::new())));
        let cache = factory.create_cache(DIRECTED_PRESENCES_CACHE).unwrap();
        (DirectedPresenceTracker::new(cache), factory)
    }

    fn jid(s: &str) -> Jid {
        Jid::new(s).unwrap()
    }

    #[test]
    fn test_last_receiver_removal_drops_the_entry() {
        let (tracker, factory) = tracker();
        let node = NodeId::new();
        let alice = jid("alice@example.com/phone");
        let room = jid("room@muc.example.com/alice");

        tracker.add(node, &alice, &room, "room@muc.example.com/alice").unwrap();
        tracker.add(node, &alice, &room, "room@muc.example.com/alice2").unwrap();
        assert_eq!(tracker.get(&alice)[0].receivers.len(), 2);

        tracker.remove(&alice, &room, "room@muc.example.com/alice").unwrap();
        assert_eq!(tracker.len(), 1);
        tracker.remove(&alice, &room, "room@muc.example.com/alice2").unwrap();

        assert!(tracker.is_empty());
        assert!(tracker.get(&alice).is_empty());
        assert!(factory.local_locks().is_empty());
    }

    #[test]
    fn test_has_direct_presence_matches_bare_recipient() {
        let (tracker, _factory) = tracker();
        let alice = jid("alice@example.com/phone");
        let bob = jid("bob@example.org/desk");
        tracker.add(NodeId::new(), &alice, &bob, "bob@example.org/desk").unwrap();

        assert!(tracker.has_direct_presence(&alice, Some(&jid("bob@example.org/laptop"))));
        assert!(!tracker.has_direct_presence(&alice, Some(&jid("carol@example.org"))));
        assert!(!tracker.has_direct_presence(&alice, None));
    }

    #[test]
    fn test_has_direct_presence_ignores_longer_names() {
        let (tracker, _factory) = tracker();
        let alice = jid("alice@example.com/phone");
        let jacob = jid("jacob@example.org/desk");
        tracker.add(NodeId::new(), &alice, &jacob, "jacob@example.org/desk").unwrap();

        assert!(!tracker.has_direct_presence(&alice, Some(&jid("cob@example.org"))));
        assert!(!tracker.has_direct_presence(&alice, Some(&jid("jacob@example.org.evil"))));
        assert!(tracker.has_direct_presence(&alice, Some(&jid("jacob@example.org"))));
    }

    #[test]
    fn test_remove_for_node_splits_records_of_one_sender() {
        let (tracker, _factory) = tracker();
        let dead = NodeId::new();
        let alive = NodeId::new();
        let alice = jid("alice@example.com/phone");
        let first = jid("room@muc.example.com/a");
        let second = jid("room@muc.example.com/b");

        tracker.add(dead, &alice, &first, "room@muc.example.com/a").unwrap();
        tracker.add(alive, &alice, &second, "room@muc.example.com/b").unwrap();

        let removed = tracker.remove_for_node(&dead);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].1.node_id, dead);
        let kept = tracker.get(&alice);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].node_id, alive);
        assert!(tracker.remove_for_node(&dead).is_empty());
    }

    #[test]
    fn test_remove_for_node_keeps_other_nodes() {
        let (tracker, _factory) = tracker();
        let dead = NodeId::new();
        let alive = NodeId::new();
        let alice = jid("alice@example.com/phone");
        let bob = jid("bob@example.com/desk");
        let room = jid("room@muc.example.com/nick");

        tracker.add(dead, &alice, &room, "room@muc.example.com/nick").unwrap();
        tracker.add(alive, &bob, &room, "room@muc.example.com/bob").unwrap();

        let removed = tracker.remove_for_node(&dead);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "alice@example.com/phone");
        assert!(tracker.get(&alice).is_empty());
        assert_eq!(tracker.get(&bob).len(), 1);
    }
}
