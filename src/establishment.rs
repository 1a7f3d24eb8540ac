//! Establishment protocol handler (§4.2): the two-message identity handshake
//! that upgrades a connected channel to established, distinguishing
//! reconnection from a brand-new peer.

use std::time::Instant;

use crate::channel::ChannelKind;
use crate::crdt::CrdtDocument;
use crate::ids::ChannelId;
use crate::message::{Command, LogLevel, Message, SyncRequestEntry};
use crate::model::Model;
use crate::peer::{PeerIdentity, PeerState};

/// Handles either direction of the handshake: `establish-request` received
/// by the acceptor, or `establish-response` received by the initiator. Both
/// run the same steps 1–3 from §4.2; the only asymmetry (who replies with
/// `establish-response`) is handled by the caller via `reply`.
pub fn on_establish_message<D: CrdtDocument>(
    model: &mut Model<D>,
    channel_id: ChannelId,
    identity: PeerIdentity,
    reply: bool,
) -> Vec<Command<D::Version>> {
    let mut commands = Vec::new();

    if !model.channels.contains_key(&channel_id) {
        commands.push(Command::log(
            LogLevel::Warn,
            vec![("event", "establish_on_unknown_channel".into()), ("channel_id", channel_id.to_string())],
        ));
        return commands;
    }

    let now = Instant::now();
    let peer_id = identity.peer_id.clone();
    let is_reconnect = model.peers.contains_key(&peer_id);

    if reply {
        commands.push(Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::EstablishResponse {
                channel_id,
                identity: model.identity.as_peer_identity(),
            },
        });
    }

    // Bind the channel regardless of path.
    if let Some(channel) = model.channels.get_mut(&channel_id) {
        channel.establish(peer_id.clone());
    }

    if is_reconnect {
        // ── reconnection path (§4.2 step 2) ──
        let peer = model.peers.get_mut(&peer_id).expect("checked above");
        peer.last_seen = now;
        peer.channels.insert(channel_id);

        let mut docs = Vec::new();
        for (doc_id, state) in model.documents.iter() {
            let local_version = state.doc.version();
            let is_stale = match peer.awareness_of(doc_id) {
                Some(awareness) => match &awareness.last_known_version {
                    Some(peer_version) => {
                        matches!(local_version.compare(peer_version), crate::crdt::Comparison::Greater | crate::crdt::Comparison::Concurrent)
                    }
                    None => true,
                },
                None => true,
            };
            if is_stale {
                // requester_version reports *our own* current version, same as
                // the new-peer path below — the responder compares its version
                // against this to decide snapshot/update/up-to-date (§4.4).
                docs.push(SyncRequestEntry { doc_id: doc_id.clone(), requester_version: local_version.clone() });
            }
        }

        if !docs.is_empty() {
            commands.push(Command::SendMessage {
                to_channel_id: channel_id,
                message: Message::SyncRequest { channel_id, docs },
            });
        }
    } else {
        // ── new-peer path (§4.2 step 3) ──
        let mut peer = PeerState::new(identity, now);
        peer.channels.insert(channel_id);
        model.peers.insert(peer_id.clone(), peer);

        commands.push(Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::DirectoryRequest { channel_id },
        });

        let docs = model
            .documents
            .iter()
            .map(|(doc_id, state)| SyncRequestEntry {
                doc_id: doc_id.clone(),
                requester_version: state.doc.version(),
            })
            .collect::<Vec<_>>();
        commands.push(Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::SyncRequest { channel_id, docs },
        });
    }

    model.assert_invariants();
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::ids::PeerId;
    use crate::model::Identity;
    use crate::testing::MockDoc;

    fn model_with_connected_channel() -> (Model<MockDoc>, ChannelId) {
        let mut model = Model::new(Identity { peer_id: PeerId::new("me"), name: "me".into() });
        let channel_id = model.next_channel_id();
        model.channels.insert(channel_id, Channel::new_connected(channel_id, "a1".into(), ChannelKind::Network));
        (model, channel_id)
    }

    #[test]
    fn new_peer_gets_directory_and_sync_request_no_subscription_yet() {
        let (mut model, channel_id) = model_with_connected_channel();
        let identity = PeerIdentity { peer_id: PeerId::new("bob"), name: "bob".into() };

        let commands = on_establish_message(&mut model, channel_id, identity, true);

        assert!(model.is_established(channel_id));
        assert!(model.peers.contains_key(&PeerId::new("bob")));
        let kinds: Vec<_> = commands
            .iter()
            .map(|c| match c {
                Command::SendMessage { message: Message::EstablishResponse { .. }, .. } => "response",
                Command::SendMessage { message: Message::DirectoryRequest { .. }, .. } => "dir-req",
                Command::SendMessage { message: Message::SyncRequest { .. }, .. } => "sync-req",
                _ => "other",
            })
            .collect();
        assert!(kinds.contains(&"response"));
        assert!(kinds.contains(&"dir-req"));
        assert!(kinds.contains(&"sync-req"));
    }

    #[test]
    fn reconnection_skips_directory_exchange() {
        let (mut model, channel_id) = model_with_connected_channel();
        let identity = PeerIdentity { peer_id: PeerId::new("bob"), name: "bob".into() };
        let _ = on_establish_message(&mut model, channel_id, identity.clone(), true);

        // Simulate a drop: detach channel but keep PeerState (see channel lifecycle tests).
        model.peers.get_mut(&PeerId::new("bob")).unwrap().channels.remove(&channel_id);
        model.channels.remove(&channel_id);

        let new_channel_id = model.next_channel_id();
        model.channels.insert(new_channel_id, Channel::new_connected(new_channel_id, "a1".into(), ChannelKind::Network));

        let commands = on_establish_message(&mut model, new_channel_id, identity, true);
        let has_directory_request = commands
            .iter()
            .any(|c| matches!(c, Command::SendMessage { message: Message::DirectoryRequest { .. }, .. }));
        assert!(!has_directory_request, "reconnect must not re-run directory exchange");
    }

    #[test]
    fn reconnect_with_no_stale_documents_emits_no_sync_request() {
        let (mut model, channel_id) = model_with_connected_channel();
        let identity = PeerIdentity { peer_id: PeerId::new("bob"), name: "bob".into() };
        let _ = on_establish_message(&mut model, channel_id, identity.clone(), true);

        model.channels.remove(&channel_id);
        let new_channel_id = model.next_channel_id();
        model.channels.insert(new_channel_id, Channel::new_connected(new_channel_id, "a1".into(), ChannelKind::Network));

        let commands = on_establish_message(&mut model, new_channel_id, identity, true);
        let has_sync_request = commands
            .iter()
            .any(|c| matches!(c, Command::SendMessage { message: Message::SyncRequest { .. }, .. }));
        assert!(!has_sync_request, "peer with no documents has nothing stale to sync");
    }
}
