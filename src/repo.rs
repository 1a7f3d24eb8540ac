//! Public API surface (§6): the facade an embedding application drives.
//!
//! `Repo` owns no protocol state directly — it hands messages to the shell's
//! inbox and waits on correlated oneshot replies, the same shape as the
//! teacher's `DeltaCore`, which exposes a handful of async methods
//! (`store::bootstrap`, `sync::ingest_op`) over state a background task
//! owns, rather than handing callers the state itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::adapter::Adapter;
use crate::config::RepoConfig;
use crate::crdt::CrdtDocument;
use crate::dispatcher::Dispatcher;
use crate::ids::{DocumentId, PeerId, RequestId, RequestIdAllocator};
use crate::message::{Message, RequestRejection};
use crate::model::Identity;
use crate::permissions::{CanReveal, CanUpdate};
use crate::shell::{ChannelReadyState, DocWatchers, Envelope, PeerSnapshot, RequestCompletion, Shell};

/// Handle to a running synchronization core. Cheap to clone — every clone
/// shares the same background dispatch task and inbox.
pub struct Repo<D: CrdtDocument> {
    envelope_tx: tokio::sync::mpsc::UnboundedSender<Envelope<D>>,
    request_ids: Arc<RequestIdAllocator>,
    doc_watchers: DocWatchers,
}

impl<D: CrdtDocument> Clone for Repo<D> {
    fn clone(&self) -> Self {
        Self {
            envelope_tx: self.envelope_tx.clone(),
            request_ids: self.request_ids.clone(),
            doc_watchers: self.doc_watchers.clone(),
        }
    }
}

impl<D: CrdtDocument + Default + 'static> Repo<D> {
    /// Spawns the shell's run loop on the current tokio runtime and returns a
    /// handle to it. Adapters are started immediately (SPEC_FULL §6a).
    pub fn spawn(
        identity: Identity,
        config: RepoConfig,
        can_reveal: Box<dyn CanReveal>,
        can_update: Box<dyn CanUpdate>,
        adapters: Vec<Box<dyn Adapter<D::Version>>>,
    ) -> Self {
        let dispatcher = Dispatcher::new(identity, config, can_reveal, can_update);
        let doc_watchers: DocWatchers = Arc::new(Mutex::new(HashMap::new()));
        let (shell, envelope_tx) = Shell::new(dispatcher, doc_watchers.clone());
        tokio::spawn(shell.run(adapters));
        Self { envelope_tx, request_ids: Arc::new(RequestIdAllocator::new()), doc_watchers }
    }

    /// Ensures `doc_id` is present locally, syncing with every established
    /// peer if it is not yet known (§6 `ensureDocument`). Resolves once the
    /// document has content, or rejects on timeout or disconnection.
    pub async fn ensure_document(&self, doc_id: DocumentId) -> RequestCompletion {
        self.correlated(|request_id| Message::EnsureDocument { doc_id, request_id: Some(request_id) }).await
    }

    /// Removes `doc_id` locally and asks every established peer to do the
    /// same (§6 `deleteDocument`).
    pub async fn delete_document(&self, doc_id: DocumentId) -> RequestCompletion {
        self.correlated(|request_id| Message::DeleteDocument { doc_id, request_id: Some(request_id) }).await
    }

    /// Registers a request before sending the message that can resolve it —
    /// both sends go through the same ordered inbox, so the shell always
    /// processes the registration first even when the triggering message
    /// resolves it immediately (e.g. `ensure_document` on an already-ready
    /// document).
    async fn correlated(&self, build: impl FnOnce(RequestId) -> Message<D::Version>) -> RequestCompletion {
        let request_id = self.request_ids.next();
        let (tx, rx) = oneshot::channel();
        let _ = self.envelope_tx.send(Envelope::RegisterRequest { request_id, responder: tx });
        let _ = self.envelope_tx.send(Envelope::Core(build(request_id)));
        rx.await.unwrap_or(Err(RequestRejection::Disconnected))
    }

    /// Applies `mutate` directly to the local CRDT document for `doc_id` —
    /// the "application layer mutates the external CRDT engine directly"
    /// path (§6). The document's own `subscribe` hook (armed the moment
    /// `ensure_document` first creates or loads it) turns the mutation into
    /// a `LocalChangeEvent` dispatch, the same re-entry fan-out (§4.5) uses
    /// for an imported sync. Returns `false` if `doc_id` is not yet known
    /// locally; call `ensure_document` first.
    pub async fn mutate_document(&self, doc_id: DocumentId, mutate: impl FnOnce(&mut D) + Send + 'static) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.envelope_tx.send(Envelope::MutateDocument { doc_id, mutate: Box::new(mutate), respond: tx });
        rx.await.unwrap_or(false)
    }

    /// Registers `callback` to run (on the shell's task) whenever `doc_id`
    /// mutates, from either a local edit or an imported sync (§6
    /// `subscribeToDocument`). Distinct from the CRDT engine's own
    /// `subscribe()`, which only `cmd/subscribe-doc` wires up.
    pub fn subscribe_to_document(&self, doc_id: DocumentId, callback: impl Fn() + Send + Sync + 'static) {
        self.doc_watchers
            .lock()
            .expect("doc watcher lock is never held across a panic")
            .entry(doc_id.clone())
            .or_default()
            .push(Box::new(callback));
        let _ = self.envelope_tx.send(Envelope::Core(Message::SubscribeToDocument { doc_id }));
    }

    /// Snapshot of one peer's awareness and subscriptions (§6 `getPeerState`).
    pub async fn get_peer_state(&self, peer_id: PeerId) -> Option<PeerSnapshot> {
        let (tx, rx) = oneshot::channel();
        let _ = self.envelope_tx.send(Envelope::GetPeerState { peer_id, respond: tx });
        rx.await.ok().flatten()
    }

    /// Channels carrying `doc_id`, narrowed by `filter` (§6
    /// `getChannelsForDocument`). The filter runs here, over a plain
    /// snapshot — the shell never hands its live `Channel`/`PeerState` out.
    pub async fn get_channels_for_document(
        &self,
        doc_id: DocumentId,
        filter: impl Fn(&ChannelReadyState) -> bool,
    ) -> Vec<ChannelReadyState> {
        let (tx, rx) = oneshot::channel();
        let _ = self.envelope_tx.send(Envelope::GetChannelsForDocument { doc_id, respond: tx });
        rx.await.unwrap_or_default().into_iter().filter(filter).collect()
    }

    /// Per-channel loading state for `doc_id` (§6 `getReadyStates`) — the
    /// same rows `get_channels_for_document` returns, unfiltered.
    pub async fn get_ready_states(&self, doc_id: DocumentId) -> Vec<ChannelReadyState> {
        self.get_channels_for_document(doc_id, |_| true).await
    }
}
