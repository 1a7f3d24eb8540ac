//! Application-supplied permission predicates (§6).
//!
//! `canReveal` and `canUpdate` are pure functions provided by the embedding
//! application. The core never caches their results — §4.3 and §9 are
//! explicit that these must be recomputed at every send site, because the
//! inputs (document content, peer attributes) can change mid-session.

use crate::channel::ChannelKind;
use crate::ids::{ChannelId, DocumentId};

/// Inputs available to a permission predicate at the moment it is evaluated.
#[derive(Debug, Clone)]
pub struct PermissionContext<'a> {
    pub peer_name: &'a str,
    pub channel_id: ChannelId,
    pub channel_kind: ChannelKind,
    pub doc_id: &'a DocumentId,
}

/// Gate on outbound document-id announcements (directory-response, and the
/// pull-based discovery announcement in fan-out rule 3).
pub trait CanReveal: Send + Sync {
    fn can_reveal(&self, context: &PermissionContext<'_>) -> bool;
}

/// Gate on applying an inbound update from a given channel's peer.
pub trait CanUpdate: Send + Sync {
    fn can_update(&self, context: &PermissionContext<'_>) -> bool;
}

/// A permission pair that allows everything — the default for embedders that
/// don't need per-document gating.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CanReveal for AllowAll {
    fn can_reveal(&self, _context: &PermissionContext<'_>) -> bool {
        true
    }
}

impl CanUpdate for AllowAll {
    fn can_update(&self, _context: &PermissionContext<'_>) -> bool {
        true
    }
}

/// Blanket impl so a plain closure can be used as a `CanReveal` predicate.
pub struct RevealFn<F>(pub F);

impl<F: Fn(&PermissionContext<'_>) -> bool + Send + Sync> CanReveal for RevealFn<F> {
    fn can_reveal(&self, context: &PermissionContext<'_>) -> bool {
        (self.0)(context)
    }
}

/// Blanket impl so a plain closure can be used as a `CanUpdate` predicate.
pub struct UpdateFn<F>(pub F);

impl<F: Fn(&PermissionContext<'_>) -> bool + Send + Sync> CanUpdate for UpdateFn<F> {
    fn can_update(&self, context: &PermissionContext<'_>) -> bool {
        (self.0)(context)
    }
}
