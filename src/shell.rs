//! The imperative shell (§2, §5): the only place in this crate that performs
//! I/O. It owns the [`Dispatcher`], drives the single-threaded cooperative
//! run loop, and executes every [`Command`] the dispatcher emits — sending
//! through adapters, arming/cancelling timeouts, resolving request futures,
//! and turning `cmd/log` into `log` crate calls. The update function itself
//! never suspends (§5); every `.await` in this crate lives here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::adapter::{Adapter, ChannelEvent, GeneratedChannel};
use crate::channel::ChannelKind;
use crate::crdt::CrdtDocument;
use crate::dispatcher::Dispatcher;
use crate::ids::{ChannelId, DocumentId, PeerId, RequestId};
use crate::message::{Command, LogLevel, Message, RequestOutcome, RequestRejection};
use crate::peer::AwarenessState;

/// What an `ensure_document`/`delete_document` caller eventually receives.
pub type RequestCompletion = Result<RequestOutcome, RequestRejection>;

/// A read-only snapshot of one peer's knowledge, safe to hand back across the
/// query boundary (the live `PeerState` never leaves the shell's task).
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub name: String,
    pub channels: Vec<ChannelId>,
    pub subscriptions: Vec<DocumentId>,
    pub document_awareness: Vec<(DocumentId, AwarenessState)>,
}

/// One row of `getChannelsForDocument` / `getReadyStates` (§6): channel
/// metadata plus whether the peer on that channel is known to hold the doc.
#[derive(Debug, Clone)]
pub struct ChannelReadyState {
    pub channel_id: ChannelId,
    pub adapter_id: String,
    pub kind: ChannelKind,
    pub peer_id: Option<PeerId>,
    /// True until awareness for this document on this channel's peer settles
    /// to `has` or `no` — i.e. still `unknown` or not yet recorded at all.
    pub loading: bool,
}

/// A registered `subscribeToDocument` callback, shared between [`crate::repo::Repo`]
/// (which registers) and the shell (which fires, after a `LocalChangeEvent`
/// dispatch — local origin and imported origin are indistinguishable here by
/// design, same as at the dispatch layer). Distinct from the CRDT engine's own
/// `subscribe()`, which `cmd/subscribe-doc` wires directly into the dispatch
/// loop; this is the outer, app-facing layer.
pub(crate) type DocWatchers = Arc<Mutex<HashMap<DocumentId, Vec<Box<dyn Fn() + Send + Sync>>>>>;

/// Messages the shell's inbox actually queues. A superset of [`Message`]:
/// request-correlation registration and state queries are shell-only
/// plumbing, never part of the dispatcher's closed message vocabulary
/// (SPEC_FULL §4.6a) — keeping them out of [`Message`] keeps that type a
/// faithful rendering of the wire table in §6 plus the local-only variants
/// §4.6a names, nothing more.
pub(crate) enum Envelope<D: CrdtDocument> {
    Core(Message<D::Version>),
    RegisterRequest { request_id: RequestId, responder: oneshot::Sender<RequestCompletion> },
    GetPeerState { peer_id: PeerId, respond: oneshot::Sender<Option<PeerSnapshot>> },
    GetChannelsForDocument { doc_id: DocumentId, respond: oneshot::Sender<Vec<ChannelReadyState>> },
    /// The "application layer mutates the external CRDT engine directly"
    /// path (§6): runs `mutate` against the live document state and relies
    /// on the document's own `subscribe` hook (armed by `cmd/subscribe-doc`)
    /// to re-enter as a `LocalChangeEvent`, the same way an imported sync
    /// does. `respond` carries whether `doc_id` was known locally at all.
    MutateDocument { doc_id: DocumentId, mutate: Box<dyn FnOnce(&mut D) + Send>, respond: oneshot::Sender<bool> },
}

pub struct Shell<D: CrdtDocument> {
    dispatcher: Dispatcher<D>,
    inbox_tx: mpsc::UnboundedSender<Envelope<D>>,
    inbox_rx: mpsc::UnboundedReceiver<Envelope<D>>,
    channel_outboxes: HashMap<ChannelId, mpsc::UnboundedSender<crate::message::WireMessage<D::Version>>>,
    adapter_channel_ids: HashMap<String, ChannelId>,
    pending_channels: HashMap<String, GeneratedChannel<D::Version>>,
    timeouts: HashMap<String, tokio::task::JoinHandle<()>>,
    pending_requests: HashMap<RequestId, oneshot::Sender<RequestCompletion>>,
    doc_watchers: DocWatchers,
}

impl<D: CrdtDocument + Default> Shell<D> {
    pub(crate) fn new(dispatcher: Dispatcher<D>, doc_watchers: DocWatchers) -> (Self, mpsc::UnboundedSender<Envelope<D>>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let handle = inbox_tx.clone();
        let shell = Self {
            dispatcher,
            inbox_tx,
            inbox_rx,
            channel_outboxes: HashMap::new(),
            adapter_channel_ids: HashMap::new(),
            pending_channels: HashMap::new(),
            timeouts: HashMap::new(),
            pending_requests: HashMap::new(),
            doc_watchers,
        };
        (shell, handle)
    }

    /// Drives the run loop until every sender to its inbox is dropped (i.e.
    /// the owning [`crate::repo::Repo`] and all its adapter handles are gone).
    pub(crate) async fn run(mut self, adapters: Vec<Box<dyn Adapter<D::Version>>>) {
        let startup = self.dispatcher.startup_commands();
        self.execute(startup).await;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ChannelEvent<D::Version>>();
        for mut adapter in adapters {
            adapter.start();
            let mut stream = adapter.events();
            let tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.recv().await {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                // Keep `adapter` alive for as long as it can still hand us
                // channels; deinit when its event stream finally closes.
                adapter.deinit();
            });
        }
        drop(events_tx);

        let mut adapters_done = false;
        loop {
            tokio::select! {
                maybe_envelope = self.inbox_rx.recv() => {
                    match maybe_envelope {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => break,
                    }
                }
                maybe_event = events_rx.recv(), if !adapters_done => {
                    match maybe_event {
                        Some(event) => self.handle_channel_event(event).await,
                        None => adapters_done = true,
                    }
                }
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope<D>) {
        match envelope {
            Envelope::Core(message) => {
                let notify_doc = match &message {
                    Message::LocalChangeEvent { doc_id } => Some(doc_id.clone()),
                    _ => None,
                };
                let commands = self.dispatcher.dispatch(message);
                self.execute(commands).await;
                if let Some(doc_id) = notify_doc {
                    self.notify_doc_watchers(&doc_id);
                }
            }
            Envelope::RegisterRequest { request_id, responder } => {
                self.pending_requests.insert(request_id, responder);
            }
            Envelope::GetPeerState { peer_id, respond } => {
                let snapshot = self.dispatcher.model.peers.get(&peer_id).map(|p| PeerSnapshot {
                    peer_id: p.identity.peer_id.clone(),
                    name: p.identity.name.clone(),
                    channels: p.channels.iter().copied().collect(),
                    subscriptions: p.subscriptions.iter().cloned().collect(),
                    document_awareness: p
                        .document_awareness
                        .iter()
                        .map(|(doc_id, a)| (doc_id.clone(), a.state))
                        .collect(),
                });
                let _ = respond.send(snapshot);
            }
            Envelope::MutateDocument { doc_id, mutate, respond } => {
                let known = if let Some(state) = self.dispatcher.model.documents.get_mut(&doc_id) {
                    mutate(&mut state.doc);
                    true
                } else {
                    false
                };
                let _ = respond.send(known);
            }
            Envelope::GetChannelsForDocument { doc_id, respond } => {
                let mut rows = Vec::new();
                for channel in self.dispatcher.model.channels.values() {
                    let (peer_id, loading) = match &channel.peer_id {
                        Some(peer_id) => {
                            let awareness = self
                                .dispatcher
                                .model
                                .peers
                                .get(peer_id)
                                .and_then(|p| p.awareness_of(&doc_id))
                                .map(|a| a.state);
                            let loading = !matches!(awareness, Some(AwarenessState::Has) | Some(AwarenessState::No));
                            (Some(peer_id.clone()), loading)
                        }
                        None => (None, true),
                    };
                    rows.push(ChannelReadyState {
                        channel_id: channel.channel_id,
                        adapter_id: channel.adapter_id.clone(),
                        kind: channel.kind,
                        peer_id,
                        loading,
                    });
                }
                let _ = respond.send(rows);
            }
        }
    }

    fn notify_doc_watchers(&self, doc_id: &DocumentId) {
        let watchers = self.doc_watchers.lock().expect("doc watcher lock is never held across a panic");
        if let Some(callbacks) = watchers.get(doc_id) {
            for callback in callbacks {
                callback();
            }
        }
    }

    async fn handle_channel_event(&mut self, event: ChannelEvent<D::Version>) {
        match event {
            ChannelEvent::Generated(generated) => {
                let adapter_id = generated.adapter_id.clone();
                let kind = generated.kind;
                self.pending_channels.insert(adapter_id.clone(), generated);
                let commands = self.dispatcher.dispatch(Message::ChannelGenerated { adapter_id, kind });
                self.execute(commands).await;
            }
            ChannelEvent::Removed { adapter_id } => {
                if let Some(channel_id) = self.adapter_channel_ids.remove(&adapter_id) {
                    self.channel_outboxes.remove(&channel_id);
                    let commands = self.dispatcher.dispatch(Message::ChannelRemoved { channel_id });
                    self.execute(commands).await;
                }
                self.pending_channels.remove(&adapter_id);
            }
        }
    }

    async fn execute(&mut self, commands: Vec<Command<D::Version>>) {
        for command in flatten(commands) {
            self.execute_one(command).await;
        }
    }

    async fn execute_one(&mut self, command: Command<D::Version>) {
        match command {
            Command::SendMessage { to_channel_id, message } => {
                self.bind_channel_if_needed(to_channel_id);
                if let Some((_, wire)) = message.into_wire() {
                    match self.channel_outboxes.get(&to_channel_id) {
                        Some(tx) => {
                            let _ = tx.send(wire);
                        }
                        None => log::warn!("send on unbound channel channel_id={to_channel_id:?}"),
                    }
                }
            }
            Command::Enqueue { message } => {
                let _ = self.inbox_tx.send(Envelope::Core(message));
            }
            Command::SubscribeDoc { doc_id } => {
                if let Some(state) = self.dispatcher.model.documents.get_mut(&doc_id) {
                    let tx = self.inbox_tx.clone();
                    let doc_id_for_callback = doc_id.clone();
                    state.doc.subscribe(Box::new(move |_version| {
                        let _ = tx.send(Envelope::Core(Message::LocalChangeEvent { doc_id: doc_id_for_callback.clone() }));
                    }));
                }
            }
            Command::SetTimeout { key, duration } => {
                if let Some(handle) = self.timeouts.remove(&key) {
                    handle.abort();
                }
                let tx = self.inbox_tx.clone();
                let key_for_task = key.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = tx.send(Envelope::Core(Message::TimeoutFired { key: key_for_task }));
                });
                self.timeouts.insert(key, handle);
            }
            Command::ClearTimeout { key } => {
                if let Some(handle) = self.timeouts.remove(&key) {
                    handle.abort();
                }
            }
            Command::ResolveRequest { request_id, payload } => {
                if let Some(responder) = self.pending_requests.remove(&request_id) {
                    let _ = responder.send(Ok(payload));
                }
            }
            Command::RejectRequest { request_id, error } => {
                if let Some(responder) = self.pending_requests.remove(&request_id) {
                    let _ = responder.send(Err(error));
                }
            }
            Command::Log { level, fields } => log_fields(level, &fields),
            Command::Batch { .. } => unreachable!("flatten() expands Batch before execute_one runs"),
        }
    }

    fn bind_channel_if_needed(&mut self, channel_id: ChannelId) {
        if self.channel_outboxes.contains_key(&channel_id) {
            return;
        }
        let Some(channel) = self.dispatcher.model.channels.get(&channel_id) else {
            return;
        };
        let adapter_id = channel.adapter_id.clone();
        let Some(generated) = self.pending_channels.remove(&adapter_id) else {
            return;
        };
        self.channel_outboxes.insert(channel_id, generated.outbound);
        self.adapter_channel_ids.insert(adapter_id, channel_id);
        let tx = self.inbox_tx.clone();
        let mut inbound = generated.inbound;
        tokio::spawn(async move {
            while let Some(wire) = inbound.recv().await {
                if tx.send(Envelope::Core(Message::from_wire(channel_id, wire))).is_err() {
                    break;
                }
            }
        });
    }
}

fn flatten<V>(commands: Vec<Command<V>>) -> Vec<Command<V>> {
    let mut out = Vec::with_capacity(commands.len());
    for command in commands {
        match command {
            Command::Batch { commands } => out.extend(flatten(commands)),
            other => out.push(other),
        }
    }
    out
}

fn log_fields(level: LogLevel, fields: &[(String, String)]) {
    let rendered = fields.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(" ");
    match level {
        LogLevel::Debug => log::debug!("{rendered}"),
        LogLevel::Info => log::info!("{rendered}"),
        LogLevel::Warn => log::warn!("{rendered}"),
        LogLevel::Error => log::error!("{rendered}"),
    }
}
