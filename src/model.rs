//! The authoritative in-memory state (§3). Owned exclusively by the
//! dispatcher — unlike the teacher's `DeltaCore`/`NetworkCore`, which are
//! process-wide `OnceLock` singletons (a shape forced by UniFFI's global FFI
//! surface), `Model` here is plain, ownable state a `Repo` can construct,
//! drop and even run multiple instances of in one process (the memory
//! bridge adapter tests rely on exactly that).

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::crdt::CrdtDocument;
use crate::ids::{ChannelId, ChannelIdAllocator, DocumentId, PeerId, RequestId, RequestIdAllocator};
use crate::peer::{PeerIdentity, PeerState};

/// This process's own identity, exchanged during establishment (§3).
#[derive(Debug, Clone)]
pub struct Identity {
    pub peer_id: PeerId,
    pub name: String,
}

impl Identity {
    pub fn as_peer_identity(&self) -> PeerIdentity {
        PeerIdentity {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
        }
    }
}

/// A document the local repository knows about (§3 invariant: exists iff
/// locally created, loaded, or announced by an accepted peer directory).
pub struct DocumentState<D: CrdtDocument> {
    pub doc_id: DocumentId,
    pub doc: D,
}

/// What an external caller's correlated request is waiting on (§3a, §4.6,
/// §9 "request correlation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    EnsureDocument,
    DeleteDocument,
}

#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub doc_id: DocumentId,
    pub kind: RequestKind,
    pub timeout_key: Option<String>,
    /// Established channels this request's own sync-request went out on and
    /// has not yet heard back from. `EnsureDocument` uses this both to know
    /// when every channel it asked has answered `unavailable` (§6, §9) and
    /// to know which requests a removed channel drags down (§5). Empty for
    /// requests that never depend on a specific channel's response.
    pub awaiting_channels: HashSet<ChannelId>,
}

/// The singleton model (§3). Generic over the CRDT document type so the
/// core never depends on a concrete CRDT engine.
pub struct Model<D: CrdtDocument> {
    pub identity: Identity,
    pub documents: HashMap<DocumentId, DocumentState<D>>,
    pub channels: HashMap<ChannelId, Channel>,
    pub peers: HashMap<PeerId, PeerState<D::Version>>,
    pub active_requests: HashMap<RequestId, ActiveRequest>,

    pub(crate) channel_ids: ChannelIdAllocator,
    pub(crate) request_ids: RequestIdAllocator,
}

impl<D: CrdtDocument> Model<D> {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            documents: HashMap::new(),
            channels: HashMap::new(),
            peers: HashMap::new(),
            active_requests: HashMap::new(),
            channel_ids: ChannelIdAllocator::new(),
            request_ids: RequestIdAllocator::new(),
        }
    }

    pub fn next_channel_id(&self) -> ChannelId {
        self.channel_ids.next()
    }

    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.next()
    }

    pub fn insert_document(&mut self, doc_id: DocumentId, doc: D) {
        self.documents.insert(doc_id.clone(), DocumentState { doc_id, doc });
    }

    pub fn is_established(&self, channel_id: ChannelId) -> bool {
        self.channels
            .get(&channel_id)
            .map(Channel::is_established)
            .unwrap_or(false)
    }

    /// Peers currently idle per the GC policy in SPEC_FULL §4.1a.
    pub fn idle_peers(&self, now: Instant, idle: Duration) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, state)| state.is_idle(now, idle))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Checks the invariants in §3/§8 that are cheap enough to assert after
    /// every dispatch tick in debug builds. Production builds skip this —
    /// it is a development aid, not a runtime guard.
    #[cfg(debug_assertions)]
    pub fn assert_invariants(&self) {
        // P1: every established channel's peer has that channel bound back.
        for channel in self.channels.values() {
            if let Some(peer_id) = &channel.peer_id {
                let peer = self
                    .peers
                    .get(peer_id)
                    .unwrap_or_else(|| panic!("established channel {} has no PeerState", channel.channel_id));
                assert!(
                    peer.channels.contains(&channel.channel_id),
                    "P1 violated: {} not bound back to peer {}",
                    channel.channel_id,
                    peer_id
                );
            }
        }
    }

    #[cfg(not(debug_assertions))]
    pub fn assert_invariants(&self) {}
}
