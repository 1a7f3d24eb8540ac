//! Local change fan-out (§4.5). The dominance check in step (b) is the
//! whole reason multi-hop topologies converge instead of storming — it is
//! evaluated against the *version vector*, never a hop count.

use std::time::Instant;

use crate::channel::Channel;
use crate::crdt::{Comparison, CrdtDocument, ExportMode};
use crate::ids::{ChannelId, DocumentId};
use crate::message::{Command, Message, Transmission};
use crate::model::Model;
use crate::peer::{AwarenessState, DocumentAwareness, PeerState};
use crate::permissions::{CanReveal, PermissionContext};

fn select_channel<D: CrdtDocument>(
    model: &Model<D>,
    peer: &PeerState<D::Version>,
    doc_id: &DocumentId,
    can_reveal: &dyn CanReveal,
) -> Option<ChannelId> {
    peer.channels.iter().copied().find(|channel_id| {
        let Some(channel) = model.channels.get(channel_id) else { return false };
        if !channel.is_established() {
            return false;
        }
        let context = PermissionContext {
            peer_name: &peer.identity.name,
            channel_id: *channel_id,
            channel_kind: channel.kind,
            doc_id,
        };
        can_reveal.can_reveal(&context)
    })
}

/// Runs after any document mutation — local edit or just-imported update —
/// to propagate it to subscribers and to announce it to peers who don't
/// know it exists yet.
pub fn on_local_change<D: CrdtDocument>(
    model: &mut Model<D>,
    doc_id: DocumentId,
    can_reveal: &dyn CanReveal,
) -> Vec<Command<D::Version>> {
    let Some(state) = model.documents.get(&doc_id) else {
        return Vec::new();
    };
    let local_version = state.doc.version();
    let now = Instant::now();
    let mut commands = Vec::new();

    let peer_ids: Vec<_> = model.peers.keys().cloned().collect();
    for peer_id in peer_ids {
        let peer = model.peers.get(&peer_id).expect("iterating known keys");

        if peer.is_subscribed(&doc_id) {
            let already_current = peer
                .awareness_of(&doc_id)
                .and_then(|a| a.last_known_version.as_ref())
                .map(|peer_version| matches!(local_version.compare(peer_version), Comparison::Equal | Comparison::Less))
                .unwrap_or(false);
            if already_current {
                continue;
            }

            let Some(channel_id) = select_channel(model, peer, &doc_id, can_reveal) else {
                continue;
            };

            let from = peer.awareness_of(&doc_id).and_then(|a| a.last_known_version.as_ref());
            let data = state.doc.export(ExportMode::Update { from });

            commands.push(Command::SendMessage {
                to_channel_id: channel_id,
                message: Message::SyncResponse {
                    channel_id,
                    doc_id: doc_id.clone(),
                    transmission: Transmission::Update { data, version: local_version.clone() },
                },
            });

            if let Some(peer) = model.peers.get_mut(&peer_id) {
                peer.document_awareness.insert(doc_id.clone(), DocumentAwareness::has(local_version.clone(), now));
            }
        } else {
            let is_unknown = peer
                .awareness_of(&doc_id)
                .map(|a| a.state == AwarenessState::Unknown)
                .unwrap_or(true);
            if !is_unknown {
                continue;
            }
            let Some(channel_id) = select_channel(model, peer, &doc_id, can_reveal) else {
                continue;
            };
            commands.push(Command::SendMessage {
                to_channel_id: channel_id,
                message: Message::DirectoryResponse { channel_id, doc_ids: vec![doc_id.clone()] },
            });
        }
    }

    model.assert_invariants();
    commands
}
