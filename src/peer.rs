//! Peer state: identity, document awareness, subscriptions (§3, §9).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::crdt::VersionVector;
use crate::ids::{ChannelId, DocumentId, PeerId};

/// Stable per-peer identity exchanged during establishment (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub name: String,
}

/// This repository's best-effort belief about whether a peer holds a
/// document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessState {
    Unknown,
    Has,
    No,
}

/// Awareness of a single document for a single peer.
#[derive(Debug, Clone)]
pub struct DocumentAwareness<V> {
    pub state: AwarenessState,
    pub last_known_version: Option<V>,
    pub last_updated: Instant,
}

impl<V: VersionVector> DocumentAwareness<V> {
    fn new(state: AwarenessState, version: Option<V>, now: Instant) -> Self {
        Self {
            state,
            last_known_version: version,
            last_updated: now,
        }
    }

    pub fn unknown(now: Instant) -> Self {
        Self::new(AwarenessState::Unknown, None, now)
    }

    pub fn has(version: V, now: Instant) -> Self {
        Self::new(AwarenessState::Has, Some(version), now)
    }

    pub fn no(now: Instant) -> Self {
        Self::new(AwarenessState::No, None, now)
    }
}

/// Peer knowledge store entry (§2, §9: subscription and awareness are
/// orthogonal — storage subscribes without holding the document yet).
#[derive(Debug)]
pub struct PeerState<V> {
    pub identity: PeerIdentity,
    pub document_awareness: HashMap<DocumentId, DocumentAwareness<V>>,
    pub subscriptions: HashSet<DocumentId>,
    pub channels: HashSet<ChannelId>,
    pub last_seen: Instant,
}

impl<V: VersionVector> PeerState<V> {
    pub fn new(identity: PeerIdentity, now: Instant) -> Self {
        Self {
            identity,
            document_awareness: HashMap::new(),
            subscriptions: HashSet::new(),
            channels: HashSet::new(),
            last_seen: now,
        }
    }

    pub fn awareness_of(&self, doc_id: &DocumentId) -> Option<&DocumentAwareness<V>> {
        self.document_awareness.get(doc_id)
    }

    pub fn is_subscribed(&self, doc_id: &DocumentId) -> bool {
        self.subscriptions.contains(doc_id)
    }

    /// Idle for the purposes of the peer-GC policy in SPEC_FULL §4.1a: no
    /// bound channels and last seen longer ago than `idle`.
    pub fn is_idle(&self, now: Instant, idle: std::time::Duration) -> bool {
        self.channels.is_empty() && now.duration_since(self.last_seen) >= idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock_version;

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity { peer_id: PeerId::new(id), name: id.to_string() }
    }

    #[test]
    fn new_peer_has_no_awareness_or_subscriptions() {
        let p: PeerState<crate::testing::MockVersion> = PeerState::new(identity("p1"), Instant::now());
        assert!(p.document_awareness.is_empty());
        assert!(p.subscriptions.is_empty());
        assert!(p.channels.is_empty());
    }

    #[test]
    fn idle_requires_both_no_channels_and_elapsed_time() {
        let mut p: PeerState<crate::testing::MockVersion> = PeerState::new(identity("p1"), Instant::now());
        assert!(!p.is_idle(Instant::now(), std::time::Duration::from_secs(0)));
        p.channels.insert(ChannelId(1));
        assert!(!p.is_idle(Instant::now(), std::time::Duration::from_secs(0)));
    }

    #[test]
    fn subscription_and_awareness_are_independent() {
        let mut p: PeerState<crate::testing::MockVersion> = PeerState::new(identity("storage"), Instant::now());
        let doc = DocumentId::new("d1");
        p.subscriptions.insert(doc.clone());
        assert!(p.is_subscribed(&doc));
        assert!(p.awareness_of(&doc).is_none());
        p.document_awareness.insert(doc.clone(), DocumentAwareness::no(Instant::now()));
        assert!(p.is_subscribed(&doc));
        assert_eq!(p.awareness_of(&doc).unwrap().state, AwarenessState::No);
        let _ = mock_version();
    }
}
