//! Adapter contract (§6): how a transport hands channels to the shell.
//!
//! A channel's wire is two `tokio` mpsc halves rather than a callback
//! object — `onReceive`/`send`/`stop` from the distilled spec's prose become
//! `inbound`/`outbound`/dropping the sender, which is the shape `tokio`
//! itself favors (see the teacher's own `gossip`/`log_sync` handles in
//! `network.rs`, all mpsc- or broadcast-backed).

use tokio::sync::mpsc;

use crate::channel::ChannelKind;
use crate::message::WireMessage;

/// A connected-but-not-yet-established channel, as handed from an adapter to
/// the shell. `adapter_id` is the adapter's own name for this connection
/// (used verbatim as the storage adapter's synthetic peer id). The wire
/// carries [`WireMessage`], not [`crate::message::Message`] — a channel's
/// `channel_id` doesn't exist yet when the adapter constructs this (§4.1);
/// the shell attaches it once `attachChannel` assigns one.
pub struct GeneratedChannel<V> {
    pub adapter_id: String,
    pub kind: ChannelKind,
    pub outbound: mpsc::UnboundedSender<WireMessage<V>>,
    pub inbound: mpsc::UnboundedReceiver<WireMessage<V>>,
}

/// What the shell's run loop drains from an adapter (§4.1's
/// `attachChannel`/`detachChannel` triggers).
pub enum ChannelEvent<V> {
    Generated(GeneratedChannel<V>),
    Removed { adapter_id: String },
}

/// A transport. `events()` is taken once, at `start()` time, and drained by
/// the shell for the adapter's lifetime; `deinit()` signals the adapter to
/// stop producing new channels and tear down what it has.
pub trait Adapter<V>: Send
where
    V: Send + 'static,
{
    fn events(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent<V>>;

    fn start(&mut self);

    fn deinit(&mut self);
}
