//! Discovery engine (§4.3): document-id directory exchange, gated by the
//! application-supplied `canReveal` predicate, re-evaluated at every send
//! site rather than cached (§9).

use std::time::Instant;

use crate::crdt::CrdtDocument;
use crate::ids::{ChannelId, DocumentId};
use crate::message::{Command, LogLevel, Message};
use crate::model::Model;
use crate::peer::DocumentAwareness;
use crate::permissions::{CanReveal, PermissionContext};

/// `directory-request` reception: reply with every doc id the peer is
/// allowed to see.
pub fn on_directory_request<D: CrdtDocument>(
    model: &mut Model<D>,
    channel_id: ChannelId,
    can_reveal: &dyn CanReveal,
) -> Vec<Command<D::Version>> {
    let Some(channel) = model.channels.get(&channel_id) else {
        return vec![Command::log(
            LogLevel::Warn,
            vec![("event", "directory_request_unknown_channel".into())],
        )];
    };
    if !channel.is_established() {
        return vec![Command::log(
            LogLevel::Warn,
            vec![("event", "protocol_violation_pre_establish".into()), ("channel_id", channel_id.to_string())],
        )];
    }
    let peer_id = channel.peer_id.clone().expect("checked established");
    let peer_name = model
        .peers
        .get(&peer_id)
        .map(|p| p.identity.name.clone())
        .unwrap_or_default();
    let channel_kind = channel.kind;

    let mut doc_ids = Vec::new();
    for doc_id in model.documents.keys() {
        let context = PermissionContext {
            peer_name: &peer_name,
            channel_id,
            channel_kind,
            doc_id,
        };
        if can_reveal.can_reveal(&context) {
            doc_ids.push(doc_id.clone());
        }
    }

    vec![Command::SendMessage {
        to_channel_id: channel_id,
        message: Message::DirectoryResponse { channel_id, doc_ids },
    }]
}

/// `directory-response` reception: mark every announced doc as `has` for
/// this peer and create any missing local `DocumentState` entries, without
/// creating subscriptions (§4.3).
pub fn on_directory_response<D: CrdtDocument + Default>(
    model: &mut Model<D>,
    channel_id: ChannelId,
    doc_ids: Vec<DocumentId>,
) -> Vec<Command<D::Version>> {
    let Some(channel) = model.channels.get(&channel_id) else {
        return vec![Command::log(
            LogLevel::Warn,
            vec![("event", "directory_response_unknown_channel".into())],
        )];
    };
    let Some(peer_id) = channel.peer_id.clone() else {
        return vec![Command::log(
            LogLevel::Warn,
            vec![("event", "protocol_violation_pre_establish".into()), ("channel_id", channel_id.to_string())],
        )];
    };

    let now = Instant::now();
    for doc_id in doc_ids {
        if !model.documents.contains_key(&doc_id) {
            model.insert_document(doc_id.clone(), D::default());
        }
        if let Some(peer) = model.peers.get_mut(&peer_id) {
            peer
                .document_awareness
                .entry(doc_id)
                .and_modify(|a| a.last_updated = now)
                .or_insert_with(|| DocumentAwareness::unknown(now));
        }
    }

    // `unknown` above is intentionally replaced with `has` below so a fresh
    // entry records the peer's announcement correctly while a refreshed
    // entry only bumps its timestamp (boundary behavior in §8).
    if let Some(peer) = model.peers.get_mut(&peer_id) {
        for awareness in peer.document_awareness.values_mut() {
            if matches!(awareness.state, crate::peer::AwarenessState::Unknown) {
                awareness.state = crate::peer::AwarenessState::Has;
            }
        }
    }

    model.assert_invariants();
    Vec::new()
}
