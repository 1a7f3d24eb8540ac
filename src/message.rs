//! Protocol and local messages, and the commands the dispatcher emits (§4.6,
//! §6). Wire framing is an adapter concern — these are the typed,
//! pre-serialization shapes the core exposes to adapters.

use std::time::Duration;

use crate::ids::{ChannelId, DocumentId, RequestId};
use crate::peer::PeerIdentity;

/// One requested document in a `sync-request` (§4.4).
#[derive(Debug, Clone)]
pub struct SyncRequestEntry<V> {
    pub doc_id: DocumentId,
    pub requester_version: V,
}

/// The payload of a `sync-response` (§4.4).
#[derive(Debug, Clone)]
pub enum Transmission<V> {
    Snapshot { data: Vec<u8>, version: V },
    Update { data: Vec<u8>, version: V },
    UpToDate { version: V },
    Unavailable,
}

/// Everything the dispatcher can receive: the exhaustive post-establishment
/// wire table from §6, the two establishment messages, and the local-only
/// variants the public API and the shell feed back in (§4.6a).
#[derive(Debug)]
pub enum Message<V> {
    // ── establishment (§4.2) ──
    EstablishRequest { channel_id: ChannelId, identity: PeerIdentity },
    EstablishResponse { channel_id: ChannelId, identity: PeerIdentity },

    // ── discovery (§4.3) ──
    DirectoryRequest { channel_id: ChannelId },
    DirectoryResponse { channel_id: ChannelId, doc_ids: Vec<DocumentId> },

    // ── sync (§4.4) ──
    SyncRequest { channel_id: ChannelId, docs: Vec<SyncRequestEntry<V>> },
    SyncResponse { channel_id: ChannelId, doc_id: DocumentId, transmission: Transmission<V> },

    // ── deletion (§6 table) ──
    DeleteRequest { channel_id: ChannelId, doc_id: DocumentId },
    DeleteResponse { channel_id: ChannelId, doc_id: DocumentId, deleted: bool },

    // ── channel lifecycle, fed in by the shell from the adapter contract ──
    ChannelGenerated {
        adapter_id: String,
        kind: crate::channel::ChannelKind,
    },
    ChannelRemoved { channel_id: ChannelId },

    // ── local CRDT change event (§4.5) — local origin and imported origin
    // are indistinguishable at this layer, by design. ──
    LocalChangeEvent { doc_id: DocumentId },

    // ── public API surface (§6), routed through the dispatcher so they
    // participate in the same ordering guarantees as everything else ──
    EnsureDocument { doc_id: DocumentId, request_id: Option<RequestId> },
    DeleteDocument { doc_id: DocumentId, request_id: Option<RequestId> },
    SubscribeToDocument { doc_id: DocumentId },

    // ── timers ──
    TimeoutFired { key: String },
}

/// The exhaustive post-establishment wire table from §6, without a
/// `channel_id` — an adapter cannot know the core's locally-assigned id for
/// a connection it is still in the process of handing over (§4.1). This is
/// the type adapters actually serialize; the shell attaches/strips
/// `channel_id` at the boundary via [`Message::from_wire`]/[`Message::into_wire`].
#[derive(Debug)]
pub enum WireMessage<V> {
    EstablishRequest { identity: PeerIdentity },
    EstablishResponse { identity: PeerIdentity },
    DirectoryRequest,
    DirectoryResponse { doc_ids: Vec<DocumentId> },
    SyncRequest { docs: Vec<SyncRequestEntry<V>> },
    SyncResponse { doc_id: DocumentId, transmission: Transmission<V> },
    DeleteRequest { doc_id: DocumentId },
    DeleteResponse { doc_id: DocumentId, deleted: bool },
}

impl<V> Message<V> {
    /// Attaches the locally-bound `channel_id` to a message an adapter
    /// received off the wire.
    pub fn from_wire(channel_id: ChannelId, wire: WireMessage<V>) -> Self {
        match wire {
            WireMessage::EstablishRequest { identity } => Message::EstablishRequest { channel_id, identity },
            WireMessage::EstablishResponse { identity } => Message::EstablishResponse { channel_id, identity },
            WireMessage::DirectoryRequest => Message::DirectoryRequest { channel_id },
            WireMessage::DirectoryResponse { doc_ids } => Message::DirectoryResponse { channel_id, doc_ids },
            WireMessage::SyncRequest { docs } => Message::SyncRequest { channel_id, docs },
            WireMessage::SyncResponse { doc_id, transmission } => {
                Message::SyncResponse { channel_id, doc_id, transmission }
            }
            WireMessage::DeleteRequest { doc_id } => Message::DeleteRequest { channel_id, doc_id },
            WireMessage::DeleteResponse { doc_id, deleted } => Message::DeleteResponse { channel_id, doc_id, deleted },
        }
    }

    /// Strips `channel_id` off a dispatcher-emitted message so it can be
    /// handed to an adapter's `send`. Returns `None` for message variants
    /// that never cross the wire this way (local-only / timer variants —
    /// the shell never calls this on those).
    pub fn into_wire(self) -> Option<(ChannelId, WireMessage<V>)> {
        match self {
            Message::EstablishRequest { channel_id, identity } => {
                Some((channel_id, WireMessage::EstablishRequest { identity }))
            }
            Message::EstablishResponse { channel_id, identity } => {
                Some((channel_id, WireMessage::EstablishResponse { identity }))
            }
            Message::DirectoryRequest { channel_id } => Some((channel_id, WireMessage::DirectoryRequest)),
            Message::DirectoryResponse { channel_id, doc_ids } => {
                Some((channel_id, WireMessage::DirectoryResponse { doc_ids }))
            }
            Message::SyncRequest { channel_id, docs } => Some((channel_id, WireMessage::SyncRequest { docs })),
            Message::SyncResponse { channel_id, doc_id, transmission } => {
                Some((channel_id, WireMessage::SyncResponse { doc_id, transmission }))
            }
            Message::DeleteRequest { channel_id, doc_id } => Some((channel_id, WireMessage::DeleteRequest { doc_id })),
            Message::DeleteResponse { channel_id, doc_id, deleted } => {
                Some((channel_id, WireMessage::DeleteResponse { doc_id, deleted }))
            }
            _ => None,
        }
    }
}

/// Resolution payload for `cmd/resolve-request` (§4.6, §6 `ensureDocument`).
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    DocumentReady,
    DocumentUnavailable,
    DocumentDeleted,
}

/// Error surfaced through `cmd/reject-request` (§7 `Timeout`, channel
/// removal's implicit `disconnected` rejection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestRejection {
    Timeout,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// The only externally visible effects (§4.6). The shell executes these;
/// the update function never performs I/O itself.
#[derive(Debug)]
pub enum Command<V> {
    SendMessage { to_channel_id: ChannelId, message: Message<V> },
    /// Enqueues `message` for dispatch after every command of the current
    /// tick has run (§5 ordering guarantee). This is how a handler causes
    /// further processing without calling `dispatch` re-entrantly — e.g.
    /// a successful CRDT import re-enters as `LocalChangeEvent` so fan-out
    /// (§4.5) sees imported-origin changes the same way it sees local ones.
    Enqueue { message: Message<V> },
    SubscribeDoc { doc_id: DocumentId },
    SetTimeout { key: String, duration: Duration },
    ClearTimeout { key: String },
    ResolveRequest { request_id: RequestId, payload: RequestOutcome },
    RejectRequest { request_id: RequestId, error: RequestRejection },
    Log { level: LogLevel, fields: Vec<(String, String)> },
    Batch { commands: Vec<Command<V>> },
}

impl<V> Command<V> {
    pub fn log(level: LogLevel, fields: Vec<(&str, String)>) -> Self {
        Command::Log {
            level,
            fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }
}
