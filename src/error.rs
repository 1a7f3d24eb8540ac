//! Error kinds (§7). None of these are fatal to the dispatcher — the only
//! thing that stops it is explicit teardown by the caller.

use thiserror::Error;

use crate::ids::{ChannelId, DocumentId};

#[derive(Debug, Error)]
pub enum CoreError {
    /// A message arrived out of order w.r.t. the establishment handshake
    /// (§4.2 ordering guarantee, §5 "establishment precedence").
    #[error("protocol violation on {channel_id}: {detail}")]
    ProtocolViolation { channel_id: ChannelId, detail: String },

    /// A message referenced a channel not present in `model.channels`
    /// (§4.1 Failure note).
    #[error("message received on unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("operation referenced unknown document {0}")]
    UnknownDocument(DocumentId),

    /// `canReveal`/`canUpdate` refused (§6, §7).
    #[error("permission denied for {doc_id} on {channel_id}")]
    PermissionDenied { doc_id: DocumentId, channel_id: ChannelId },

    /// A correlated request's deadline elapsed before resolution (§5, §7).
    #[error("request timed out")]
    Timeout,

    /// Surfaced from an adapter as a message; the adapter is expected to
    /// tear down the affected channel itself (§7).
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The CRDT engine rejected import bytes (§7). The local document is
    /// left unchanged and peer awareness for that doc_id is not updated.
    #[error("malformed CRDT payload: {0}")]
    Malformed(String),
}

impl From<crate::crdt::CrdtError> for CoreError {
    fn from(e: crate::crdt::CrdtError) -> Self {
        match e {
            crate::crdt::CrdtError::Malformed(detail) => CoreError::Malformed(detail),
        }
    }
}
