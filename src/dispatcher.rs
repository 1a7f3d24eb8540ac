//! Message Router (§4.6): the single `dispatch()` entry point. Ties the four
//! protocol handlers together, owns request correlation and channel
//! lifecycle, and is `total` over the closed `Message` enum (SPEC_FULL
//! §4.6a) — every arm returns `Vec<Command>`, never panics on a message it
//! doesn't recognize.

use std::time::Instant;

use crate::channel::Channel;
use crate::config::RepoConfig;
use crate::crdt::CrdtDocument;
use crate::discovery;
use crate::establishment;
use crate::fanout;
use crate::ids::{ChannelId, DocumentId, RequestId};
use crate::message::{Command, LogLevel, Message, RequestOutcome, RequestRejection, Transmission};
use crate::model::{ActiveRequest, Identity, Model, RequestKind};
use crate::permissions::{CanReveal, CanUpdate};
use crate::sync_engine;

const PEER_GC_TIMEOUT_KEY: &str = "peer-gc";

fn ensure_timeout_key(request_id: RequestId) -> String {
    format!("ensure-{}", request_id.0)
}

/// Owns the model plus the two permission predicates and tunables it needs
/// to evaluate handlers, and drives `dispatch()` (§4.6).
pub struct Dispatcher<D: CrdtDocument> {
    pub model: Model<D>,
    pub config: RepoConfig,
    pub can_reveal: Box<dyn CanReveal>,
    pub can_update: Box<dyn CanUpdate>,
}

impl<D: CrdtDocument + Default> Dispatcher<D> {
    pub fn new(
        identity: Identity,
        config: RepoConfig,
        can_reveal: Box<dyn CanReveal>,
        can_update: Box<dyn CanUpdate>,
    ) -> Self {
        Self { model: Model::new(identity), config, can_reveal, can_update }
    }

    /// Initial commands to arm once, at construction — the peer-GC sweep.
    pub fn startup_commands(&self) -> Vec<Command<D::Version>> {
        match self.config.peer_idle_gc {
            Some(idle) => vec![Command::SetTimeout { key: PEER_GC_TIMEOUT_KEY.to_string(), duration: idle }],
            None => Vec::new(),
        }
    }

    /// The Message Router's single entry point. Mutates `self.model` in
    /// place and returns the commands the shell must execute; never calls
    /// itself re-entrantly — further processing is always expressed as a
    /// `Command::Enqueue` the shell redelivers on the next tick.
    pub fn dispatch(&mut self, message: Message<D::Version>) -> Vec<Command<D::Version>> {
        match message {
            Message::EstablishRequest { channel_id, identity } => {
                establishment::on_establish_message(&mut self.model, channel_id, identity, true)
            }
            Message::EstablishResponse { channel_id, identity } => {
                establishment::on_establish_message(&mut self.model, channel_id, identity, false)
            }
            Message::DirectoryRequest { channel_id } => {
                discovery::on_directory_request(&mut self.model, channel_id, self.can_reveal.as_ref())
            }
            Message::DirectoryResponse { channel_id, doc_ids } => {
                discovery::on_directory_response(&mut self.model, channel_id, doc_ids)
            }
            Message::SyncRequest { channel_id, docs } => {
                let mut commands = Vec::new();
                for entry in docs {
                    commands.extend(sync_engine::on_sync_request(
                        &mut self.model,
                        channel_id,
                        entry,
                        self.can_update.as_ref(),
                    ));
                }
                commands
            }
            Message::SyncResponse { channel_id, doc_id, transmission } => {
                let is_unavailable = matches!(transmission, Transmission::Unavailable);
                let mut commands =
                    sync_engine::on_sync_response(&mut self.model, channel_id, doc_id.clone(), transmission);
                if is_unavailable {
                    commands.extend(self.on_channel_reported_unavailable(channel_id, &doc_id));
                }
                commands.extend(self.maybe_resolve_ensure(&doc_id));
                commands
            }
            Message::DeleteRequest { channel_id, doc_id } => self.on_delete_request(channel_id, doc_id),
            Message::DeleteResponse { channel_id, doc_id, deleted } => {
                self.on_delete_response(channel_id, doc_id, deleted)
            }
            Message::ChannelGenerated { adapter_id, kind } => self.on_channel_generated(adapter_id, kind),
            Message::ChannelRemoved { channel_id } => self.on_channel_removed(channel_id),
            Message::LocalChangeEvent { doc_id } => {
                let mut commands = fanout::on_local_change(&mut self.model, doc_id.clone(), self.can_reveal.as_ref());
                commands.extend(self.maybe_resolve_ensure(&doc_id));
                commands
            }
            Message::EnsureDocument { doc_id, request_id } => self.on_ensure_document(doc_id, request_id),
            Message::DeleteDocument { doc_id, request_id } => self.on_delete_document(doc_id, request_id),
            Message::SubscribeToDocument { doc_id: _ } => {
                // Registering the caller's callback is `Repo`'s job (it owns
                // the callback registry); routing this through dispatch only
                // buys it the same FIFO ordering as everything else (§4.6a).
                Vec::new()
            }
            Message::TimeoutFired { key } => self.on_timeout_fired(key),
        }
    }

    fn on_channel_generated(&mut self, adapter_id: String, kind: crate::channel::ChannelKind) -> Vec<Command<D::Version>> {
        let channel_id = self.model.next_channel_id();
        self.model.channels.insert(channel_id, Channel::new_connected(channel_id, adapter_id, kind));
        vec![Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::EstablishRequest { channel_id, identity: self.model.identity.as_peer_identity() },
        }]
    }

    fn on_channel_removed(&mut self, channel_id: ChannelId) -> Vec<Command<D::Version>> {
        if let Some(channel) = self.model.channels.remove(&channel_id) {
            if let Some(peer_id) = channel.peer_id {
                if let Some(peer) = self.model.peers.get_mut(&peer_id) {
                    peer.channels.remove(&channel_id);
                }
            }
        }

        // §5: requests whose own sync-request went out on this channel are
        // implicitly rejected rather than left to wait on a peer they can no
        // longer reach.
        let mut commands = Vec::new();
        let dependent: Vec<RequestId> = self
            .model
            .active_requests
            .iter()
            .filter(|(_, req)| req.awaiting_channels.contains(&channel_id))
            .map(|(id, _)| *id)
            .collect();
        for request_id in dependent {
            if let Some(req) = self.model.active_requests.remove(&request_id) {
                commands.push(Command::RejectRequest { request_id, error: RequestRejection::Disconnected });
                if let Some(timeout_key) = req.timeout_key {
                    commands.push(Command::ClearTimeout { key: timeout_key });
                }
            }
        }

        self.model.assert_invariants();
        commands
    }

    fn on_delete_request(&mut self, channel_id: ChannelId, doc_id: DocumentId) -> Vec<Command<D::Version>> {
        if !self.model.is_established(channel_id) {
            return vec![Command::log(
                LogLevel::Warn,
                vec![("event", "protocol_violation_pre_establish".into()), ("channel_id", channel_id.to_string())],
            )];
        }
        let deleted = self.model.documents.remove(&doc_id).is_some();
        vec![Command::SendMessage {
            to_channel_id: channel_id,
            message: Message::DeleteResponse { channel_id, doc_id, deleted },
        }]
    }

    fn on_delete_response(&mut self, channel_id: ChannelId, doc_id: DocumentId, _deleted: bool) -> Vec<Command<D::Version>> {
        let now = Instant::now();
        if let Some(peer_id) = self.model.channels.get(&channel_id).and_then(|c| c.peer_id.clone()) {
            if let Some(peer) = self.model.peers.get_mut(&peer_id) {
                peer.document_awareness.insert(doc_id, crate::peer::DocumentAwareness::no(now));
            }
        }
        Vec::new()
    }

    fn on_ensure_document(&mut self, doc_id: DocumentId, request_id: Option<RequestId>) -> Vec<Command<D::Version>> {
        let already_ready = self.model.documents.get(&doc_id).map(|s| !s.doc.version().is_empty()).unwrap_or(false);
        if already_ready {
            return match request_id {
                Some(request_id) => vec![Command::ResolveRequest { request_id, payload: RequestOutcome::DocumentReady }],
                None => Vec::new(),
            };
        }

        let mut commands = Vec::new();
        if !self.model.documents.contains_key(&doc_id) {
            self.model.insert_document(doc_id.clone(), D::default());
            // A brand-new local document: subscribe now so the app's own
            // edits to it flow through fan-out (§4.5), not just edits that
            // arrive later via sync-response (§4.4).
            commands.push(Command::SubscribeDoc { doc_id: doc_id.clone() });
        }

        let doc_version = self.model.documents[&doc_id].doc.version();
        let mut awaiting_channels = std::collections::HashSet::new();
        for (channel_id, channel) in self.model.channels.iter() {
            if !channel.is_established() {
                continue;
            }
            awaiting_channels.insert(*channel_id);
            commands.push(Command::SendMessage {
                to_channel_id: *channel_id,
                message: Message::SyncRequest {
                    channel_id: *channel_id,
                    docs: vec![crate::message::SyncRequestEntry { doc_id: doc_id.clone(), requester_version: doc_version.clone() }],
                },
            });
        }

        if let Some(request_id) = request_id {
            let timeout_key = ensure_timeout_key(request_id);
            self.model.active_requests.insert(
                request_id,
                ActiveRequest { doc_id, kind: RequestKind::EnsureDocument, timeout_key: Some(timeout_key.clone()), awaiting_channels },
            );
            commands.push(Command::SetTimeout { key: timeout_key, duration: self.config.request_timeout });
        }
        commands
    }

    fn on_delete_document(&mut self, doc_id: DocumentId, request_id: Option<RequestId>) -> Vec<Command<D::Version>> {
        self.model.documents.remove(&doc_id);
        let mut commands = Vec::new();
        for peer in self.model.peers.values() {
            let established_channel = peer
                .channels
                .iter()
                .copied()
                .find(|id| self.model.channels.get(id).map(Channel::is_established).unwrap_or(false));
            if let Some(channel_id) = established_channel {
                commands.push(Command::SendMessage {
                    to_channel_id: channel_id,
                    message: Message::DeleteRequest { channel_id, doc_id: doc_id.clone() },
                });
            }
        }
        if let Some(request_id) = request_id {
            commands.push(Command::ResolveRequest { request_id, payload: RequestOutcome::DocumentDeleted });
        }
        commands
    }

    fn on_timeout_fired(&mut self, key: String) -> Vec<Command<D::Version>> {
        if key == PEER_GC_TIMEOUT_KEY {
            return self.run_peer_gc();
        }

        let expired = self
            .model
            .active_requests
            .iter()
            .find(|(_, req)| req.timeout_key.as_deref() == Some(key.as_str()))
            .map(|(id, _)| *id);
        match expired {
            Some(request_id) => {
                self.model.active_requests.remove(&request_id);
                vec![Command::RejectRequest { request_id, error: RequestRejection::Timeout }]
            }
            None => Vec::new(),
        }
    }

    fn run_peer_gc(&mut self) -> Vec<Command<D::Version>> {
        let Some(idle) = self.config.peer_idle_gc else {
            return Vec::new();
        };
        let now = Instant::now();
        for peer_id in self.model.idle_peers(now, idle) {
            self.model.peers.remove(&peer_id);
        }
        vec![Command::SetTimeout { key: PEER_GC_TIMEOUT_KEY.to_string(), duration: idle }]
    }

    /// A channel answered this request's own sync-request with `unavailable`
    /// (§4.4). Once every channel we asked has come back the same way and
    /// the document still hasn't been populated by some other route, the
    /// waiting `ensure_document` resolves as `DocumentUnavailable` instead
    /// of sitting until the generic request timeout fires (§6).
    fn on_channel_reported_unavailable(&mut self, channel_id: ChannelId, doc_id: &DocumentId) -> Vec<Command<D::Version>> {
        let matching = self
            .model
            .active_requests
            .iter_mut()
            .find(|(_, req)| req.doc_id == *doc_id && req.kind == RequestKind::EnsureDocument);
        let Some((&request_id, req)) = matching else {
            return Vec::new();
        };
        req.awaiting_channels.remove(&channel_id);
        if !req.awaiting_channels.is_empty() {
            return Vec::new();
        }

        let timeout_key = req.timeout_key.clone();
        self.model.active_requests.remove(&request_id);
        let mut commands = vec![Command::ResolveRequest { request_id, payload: RequestOutcome::DocumentUnavailable }];
        if let Some(timeout_key) = timeout_key {
            commands.push(Command::ClearTimeout { key: timeout_key });
        }
        commands
    }

    /// After a successful import, resolves any `ensure_document` waiting on
    /// `doc_id` once the document is no longer empty. Runs after every
    /// `SyncResponse`/`LocalChangeEvent`, so it fires regardless of which
    /// channel (if any) supplied the data — see `on_channel_reported_unavailable`
    /// above for the complementary "every channel said no" path (§9; see
    /// DESIGN.md).
    fn maybe_resolve_ensure(&mut self, doc_id: &DocumentId) -> Vec<Command<D::Version>> {
        let is_ready = self.model.documents.get(doc_id).map(|s| !s.doc.version().is_empty()).unwrap_or(false);
        if !is_ready {
            return Vec::new();
        }
        let matching = self
            .model
            .active_requests
            .iter()
            .find(|(_, req)| req.doc_id == *doc_id && req.kind == RequestKind::EnsureDocument)
            .map(|(id, req)| (*id, req.timeout_key.clone()));

        let Some((request_id, timeout_key)) = matching else {
            return Vec::new();
        };
        self.model.active_requests.remove(&request_id);
        let mut commands = vec![Command::ResolveRequest { request_id, payload: RequestOutcome::DocumentReady }];
        if let Some(timeout_key) = timeout_key {
            commands.push(Command::ClearTimeout { key: timeout_key });
        }
        commands
    }
}
