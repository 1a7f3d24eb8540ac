//! Sync engine (§4.4) — negotiates version-vector-bounded payloads per
//! document. This is the core of the core: the decision rules here are what
//! make multi-hop propagation converge without storms (§4.5, §8 P3).

use std::time::Instant;

use crate::crdt::{Comparison, CrdtDocument, ExportMode};
use crate::ids::{ChannelId, DocumentId};
use crate::message::{Command, LogLevel, Message, SyncRequestEntry, Transmission};
use crate::model::Model;
use crate::peer::DocumentAwareness;
use crate::permissions::{CanUpdate, PermissionContext};

/// Above this estimated byte count a partial update is no longer cheaper
/// than just sending a fresh snapshot (§4.4 rule 1).
const SNAPSHOT_BYTE_THRESHOLD: usize = 64 * 1024;

/// `sync-request` reception (§4.4 rule 1–3), one requested document at a
/// time — the caller loops `docs` and accumulates commands.
pub fn on_sync_request<D: CrdtDocument>(
    model: &mut Model<D>,
    channel_id: ChannelId,
    entry: SyncRequestEntry<D::Version>,
    can_update: &dyn CanUpdate,
) -> Vec<Command<D::Version>> {
    let Some(channel) = model.channels.get(&channel_id) else {
        return vec![Command::log(LogLevel::Warn, vec![("event", "sync_request_unknown_channel".into())])];
    };
    if !channel.is_established() {
        return vec![Command::log(
            LogLevel::Warn,
            vec![("event", "protocol_violation_pre_establish".into()), ("channel_id", channel_id.to_string())],
        )];
    }
    let peer_id = channel.peer_id.clone().expect("checked established");
    let peer_name = model.peers.get(&peer_id).map(|p| p.identity.name.clone()).unwrap_or_default();
    let channel_kind = channel.kind;
    let doc_id = entry.doc_id.clone();
    let requester_version = entry.requester_version;

    let mut commands = Vec::new();
    let now = Instant::now();

    let Some(state) = model.documents.get(&doc_id) else {
        // Rule 3: responder does not hold the document.
        commands.push(Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::SyncResponse { channel_id, doc_id, transmission: Transmission::Unavailable },
        });
        return commands;
    };

    let context = PermissionContext { peer_name: &peer_name, channel_id, channel_kind, doc_id: &doc_id };
    if !can_update.can_update(&context) {
        commands.push(Command::log(
            LogLevel::Warn,
            vec![("event", "permission_denied".into()), ("doc_id", doc_id.to_string())],
        ));
        return commands;
    }

    let responder_version = state.doc.version();
    let comparison = responder_version.compare(&requester_version);

    let transmission = match comparison {
        Comparison::Equal => Transmission::UpToDate { version: responder_version.clone() },
        Comparison::Greater | Comparison::Concurrent => {
            // An empty requester version means no prior relationship to this
            // document at all — always worth a full snapshot rather than an
            // update scoped to nothing.
            let from = if requester_version.is_empty() { None } else { Some(&requester_version) };
            let estimate = state.doc.estimated_update_size(from);
            if estimate == 0 {
                Transmission::UpToDate { version: responder_version.clone() }
            } else if estimate == usize::MAX || estimate > SNAPSHOT_BYTE_THRESHOLD {
                Transmission::Snapshot {
                    data: state.doc.export(ExportMode::Snapshot),
                    version: responder_version.clone(),
                }
            } else {
                Transmission::Update {
                    data: state.doc.export(ExportMode::Update { from }),
                    version: responder_version.clone(),
                }
            }
        }
        Comparison::Less => {
            // Requester is strictly ahead: send whatever we have (typically
            // empty/small) and ask them to reciprocate.
            Transmission::Update {
                data: state.doc.export(ExportMode::Update { from: Some(&requester_version) }),
                version: responder_version.clone(),
            }
        }
    };

    commands.push(Command::SendMessage {
        to_channel_id: channel_id,
        message: Message::SyncResponse { channel_id, doc_id: doc_id.clone(), transmission },
    });

    if comparison == Comparison::Less {
        commands.push(Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::SyncRequest {
                channel_id,
                docs: vec![SyncRequestEntry { doc_id: doc_id.clone(), requester_version: responder_version }],
            },
        });
    }

    // Rule 2: regardless of outcome (as long as we hold the document),
    // record the subscription and refresh awareness from the requester's
    // own version.
    if let Some(peer) = model.peers.get_mut(&peer_id) {
        peer.subscriptions.insert(doc_id.clone());
        peer.document_awareness.insert(doc_id, DocumentAwareness::has(requester_version, now));
    }

    model.assert_invariants();
    commands
}

/// `sync-response` reception (§4.4): import the payload (if any) and update
/// awareness. Returns the commands plus whether this populated a
/// previously-empty document for the first time (so the caller can emit
/// `cmd/subscribe-doc`).
pub fn on_sync_response<D: CrdtDocument>(
    model: &mut Model<D>,
    channel_id: ChannelId,
    doc_id: DocumentId,
    transmission: Transmission<D::Version>,
) -> Vec<Command<D::Version>> {
    let Some(channel) = model.channels.get(&channel_id) else {
        return vec![Command::log(LogLevel::Warn, vec![("event", "sync_response_unknown_channel".into())])];
    };
    let Some(peer_id) = channel.peer_id.clone() else {
        return vec![Command::log(
            LogLevel::Warn,
            vec![("event", "protocol_violation_pre_establish".into()), ("channel_id", channel_id.to_string())],
        )];
    };

    let now = Instant::now();
    let mut commands = Vec::new();

    match transmission {
        Transmission::Snapshot { data, version } | Transmission::Update { data, version } => {
            let was_empty = model
                .documents
                .get(&doc_id)
                .map(|s| s.doc.version().is_empty())
                .unwrap_or(true);

            let Some(state) = model.documents.get_mut(&doc_id) else {
                commands.push(Command::log(
                    LogLevel::Error,
                    vec![("event", "sync_response_unknown_document".into()), ("doc_id", doc_id.to_string())],
                ));
                return commands;
            };

            match state.doc.import(&data) {
                Ok(()) => {
                    let local_version = state.doc.version();
                    commands.push(Command::log(
                        LogLevel::Debug,
                        vec![
                            ("event", "sync_response_imported".into()),
                            ("doc_id", doc_id.to_string()),
                            ("version", hex::encode(local_version.to_canonical_bytes())),
                        ],
                    ));
                    if let Some(peer) = model.peers.get_mut(&peer_id) {
                        peer.document_awareness.insert(doc_id.clone(), DocumentAwareness::has(local_version, now));
                    }
                    if was_empty {
                        commands.push(Command::SubscribeDoc { doc_id: doc_id.clone() });
                    }
                    // Imported-origin changes flow through the same fan-out
                    // path as local edits (§4.5) — re-enter as a message
                    // rather than calling the fan-out handler directly.
                    commands.push(Command::Enqueue { message: Message::LocalChangeEvent { doc_id } });
                    let _ = version; // the responder's reported version; local() is authoritative post-import.
                }
                Err(e) => {
                    // §7: malformed payloads leave the document and that
                    // peer's awareness for this doc untouched.
                    commands.push(Command::log(
                        LogLevel::Error,
                        vec![("event", "malformed_crdt_payload".into()), ("doc_id", doc_id.to_string()), ("error", e.to_string())],
                    ));
                }
            }
        }
        Transmission::UpToDate { version } => {
            if let Some(peer) = model.peers.get_mut(&peer_id) {
                peer.document_awareness.insert(doc_id, DocumentAwareness::has(version, now));
            }
        }
        Transmission::Unavailable => {
            if let Some(peer) = model.peers.get_mut(&peer_id) {
                // Subscription intent, if any, is left untouched (§4.4,
                // §9: awareness and subscription are orthogonal).
                peer.document_awareness.insert(doc_id, DocumentAwareness::no(now));
            }
        }
    }

    model.assert_invariants();
    commands
}
