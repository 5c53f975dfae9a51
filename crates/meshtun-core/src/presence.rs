//! Peer presence model shared by the relay mesh and tunnel sessions.
//!
//! Relay links report which peers are attached to which relay. The routing
//! layer consumes those reports through [`PresenceSink`]; [`PresenceTable`]
//! is the in-process implementation that tracks reachability and fans
//! changes out to subscribers such as tunnel sessions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};

/// Broadcast capacity for reachability changes
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Public key identifying a peer (32-byte Ed25519 key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey(pub [u8; 32]);

impl PeerKey {
    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes in hex, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.short())
    }
}

impl From<[u8; 32]> for PeerKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Whether a peer appeared on or left a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceKind {
    /// Peer is attached to the relay
    Present,
    /// Peer detached from the relay
    Gone,
}

/// One presence report from one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// Normalized address of the reporting relay
    pub relay: String,
    /// The peer concerned
    pub peer: PeerKey,
    /// Appeared or left
    pub kind: PresenceKind,
}

/// Routing-layer callback receiving presence from relay links.
///
/// Each link calls into the sink from its own task, in the order the relay
/// sent the updates. Implementations must not block.
pub trait PresenceSink: Send + Sync + 'static {
    /// A peer appeared on or left a relay
    fn update(&self, update: PresenceUpdate);

    /// The link to `relay` dropped; everything learned through it is stale
    fn relay_reset(&self, relay: &str);
}

/// Presence report as a channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// See [`PresenceSink::update`]
    Update(PresenceUpdate),
    /// See [`PresenceSink::relay_reset`]
    Reset(String),
}

impl PresenceSink for mpsc::UnboundedSender<PresenceEvent> {
    fn update(&self, update: PresenceUpdate) {
        let _ = self.send(PresenceEvent::Update(update));
    }

    fn relay_reset(&self, relay: &str) {
        let _ = self.send(PresenceEvent::Reset(relay.to_string()));
    }
}

/// Reachability change published by [`PresenceTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChange {
    /// Peer became reachable through at least one relay
    Reachable(PeerKey),
    /// Peer is no longer reachable through any relay
    Unreachable(PeerKey),
}

/// Tracks which relays each peer is reachable through
pub struct PresenceTable {
    peers: Mutex<HashMap<PeerKey, BTreeSet<String>>>,
    changes: broadcast::Sender<PeerChange>,
}

impl PresenceTable {
    /// Create an empty table
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            peers: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Receive reachability changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PeerChange> {
        self.changes.subscribe()
    }

    /// Peers currently reachable through any relay, sorted
    pub fn snapshot(&self) -> Vec<PeerKey> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<PeerKey> = peers.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Relays a peer is attached to, sorted
    pub fn relays_for(&self, peer: &PeerKey) -> Vec<String> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers
            .get(peer)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of reachable peers
    pub fn len(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no peer is reachable
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, change: PeerChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceSink for PresenceTable {
    fn update(&self, update: PresenceUpdate) {
        let change = {
            let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            match update.kind {
                PresenceKind::Present => {
                    let relays = peers.entry(update.peer).or_default();
                    let was_unreachable = relays.is_empty();
                    relays.insert(update.relay);
                    was_unreachable.then_some(PeerChange::Reachable(update.peer))
                }
                PresenceKind::Gone => match peers.get_mut(&update.peer) {
                    Some(relays) => {
                        relays.remove(&update.relay);
                        if relays.is_empty() {
                            peers.remove(&update.peer);
                            Some(PeerChange::Unreachable(update.peer))
                        } else {
                            None
                        }
                    }
                    None => None,
                },
            }
        };

        if let Some(change) = change {
            self.publish(change);
        }
    }

    fn relay_reset(&self, relay: &str) {
        let lost: Vec<PeerKey> = {
            let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
            let mut lost = Vec::new();
            peers.retain(|peer, relays| {
                relays.remove(relay);
                if relays.is_empty() {
                    lost.push(*peer);
                    false
                } else {
                    true
                }
            });
            lost
        };

        for peer in lost {
            self.publish(PeerChange::Unreachable(peer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(relay: &str, peer: u8) -> PresenceUpdate {
        PresenceUpdate {
            relay: relay.to_string(),
            peer: PeerKey([peer; 32]),
            kind: PresenceKind::Present,
        }
    }

    fn gone(relay: &str, peer: u8) -> PresenceUpdate {
        PresenceUpdate {
            kind: PresenceKind::Gone,
            ..present(relay, peer)
        }
    }

    #[test]
    fn test_peer_key_display() {
        let key = PeerKey([0xAB; 32]);
        assert_eq!(key.to_string().len(), 64);
        assert_eq!(key.short(), "abababababababab");
        assert_eq!(format!("{key:?}"), "PeerKey(abababababababab)");
    }

    #[test]
    fn test_present_then_gone() {
        let table = PresenceTable::new();
        let mut changes = table.subscribe();

        table.update(present("a:1", 1));
        assert_eq!(table.snapshot(), vec![PeerKey([1; 32])]);
        assert_eq!(
            changes.try_recv().unwrap(),
            PeerChange::Reachable(PeerKey([1; 32]))
        );

        table.update(gone("a:1", 1));
        assert!(table.is_empty());
        assert_eq!(
            changes.try_recv().unwrap(),
            PeerChange::Unreachable(PeerKey([1; 32]))
        );
    }

    #[test]
    fn test_peer_on_two_relays_stays_reachable() {
        let table = PresenceTable::new();
        let mut changes = table.subscribe();

        table.update(present("a:1", 7));
        table.update(present("b:1", 7));
        table.update(gone("a:1", 7));

        assert_eq!(table.relays_for(&PeerKey([7; 32])), vec!["b:1".to_string()]);
        // Only the first appearance is a reachability change.
        assert_eq!(
            changes.try_recv().unwrap(),
            PeerChange::Reachable(PeerKey([7; 32]))
        );
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_gone_for_unknown_peer_is_ignored() {
        let table = PresenceTable::new();
        let mut changes = table.subscribe();
        table.update(gone("a:1", 3));
        assert!(table.is_empty());
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_relay_reset_drops_only_that_relay() {
        let table = PresenceTable::new();
        table.update(present("a:1", 1));
        table.update(present("a:1", 2));
        table.update(present("b:1", 2));

        let mut changes = table.subscribe();
        table.relay_reset("a:1");

        assert_eq!(table.snapshot(), vec![PeerKey([2; 32])]);
        assert_eq!(
            changes.try_recv().unwrap(),
            PeerChange::Unreachable(PeerKey([1; 32]))
        );
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.update(present("a:1", 9));
        tx.relay_reset("a:1");

        assert_eq!(
            rx.try_recv().unwrap(),
            PresenceEvent::Update(present("a:1", 9))
        );
        assert_eq!(rx.try_recv().unwrap(), PresenceEvent::Reset("a:1".into()));
    }
}
