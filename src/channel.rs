//! Channel lifecycle: generated → connected → established (§3, §4.1).

use crate::ids::{ChannelId, PeerId};

/// What kind of transport a channel rides on. Carried through so permission
/// predicates and the storage adapter can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelKind {
    Network,
    Storage,
    Bridge,
    Other,
}

/// A channel, progressively refined. Only `Established` may carry
/// post-handshake protocol messages — see [`Channel::is_established`].
#[derive(Debug)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub adapter_id: String,
    pub kind: ChannelKind,
    /// Present iff the establishment handshake completed on this channel.
    /// This is the single source of truth `is_established` reads from —
    /// never re-derive it from, e.g., "have we sent establish-request yet".
    pub peer_id: Option<PeerId>,
}

impl Channel {
    pub fn new_connected(channel_id: ChannelId, adapter_id: String, kind: ChannelKind) -> Self {
        Self {
            channel_id,
            adapter_id,
            kind,
            peer_id: None,
        }
    }

    /// §3 invariant: `channel.peerId` is present iff the handshake completed.
    pub fn is_established(&self) -> bool {
        self.peer_id.is_some()
    }

    pub fn establish(&mut self, peer_id: PeerId) {
        self.peer_id = Some(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_channel_is_not_established() {
        let c = Channel::new_connected(ChannelId(1), "adapter-a".into(), ChannelKind::Network);
        assert!(!c.is_established());
    }

    #[test]
    fn establishing_sets_peer_id_and_flips_predicate() {
        let mut c = Channel::new_connected(ChannelId(1), "adapter-a".into(), ChannelKind::Network);
        c.establish(PeerId::new("peer-b"));
        assert!(c.is_established());
        assert_eq!(c.peer_id, Some(PeerId::new("peer-b")));
    }
}
