//! In-process bridge adapter (SPEC_FULL §6a, `ChannelKind::Bridge`).
//!
//! Connects two [`crate::repo::Repo`] instances directly through a pair of
//! `tokio::sync::mpsc` channels, with no wire serialization — the same
//! [`crate::message::WireMessage`] values cross in-process. This is the
//! transport every integration test in `tests/scenarios.rs` is wired
//! through; it plays the role the teacher's `network.rs` plays for its own
//! iroh-gossip overlay, minus any actual network I/O.

use tokio::sync::mpsc;

use crate::adapter::{Adapter, ChannelEvent, GeneratedChannel};
use crate::channel::ChannelKind;
use crate::message::WireMessage;

/// One end of an in-process bridge. `memory_bridge_pair` constructs two of
/// these, cross-wired, and each is handed to a separate `Repo::spawn` call.
pub struct MemoryBridgeAdapter<V> {
    adapter_id: String,
    generated: Option<GeneratedChannel<V>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent<V>>,
    events_rx: Option<mpsc::UnboundedReceiver<ChannelEvent<V>>>,
}

impl<V: Send + 'static> MemoryBridgeAdapter<V> {
    fn new(adapter_id: String, generated: GeneratedChannel<V>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self { adapter_id, generated: Some(generated), events_tx, events_rx: Some(events_rx) }
    }
}

impl<V: Send + 'static> Adapter<V> for MemoryBridgeAdapter<V> {
    fn events(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent<V>> {
        self.events_rx.take().expect("events() is only called once per adapter")
    }

    /// The bridge's one channel exists from the moment the pair is
    /// constructed; `start()` just announces it — there is no connection
    /// step to perform.
    fn start(&mut self) {
        if let Some(generated) = self.generated.take() {
            let _ = self.events_tx.send(ChannelEvent::Generated(generated));
        }
    }

    fn deinit(&mut self) {
        let _ = self.events_tx.send(ChannelEvent::Removed { adapter_id: self.adapter_id.clone() });
    }
}

/// Builds two cross-wired bridge adapters: whatever side A sends arrives as
/// side B's inbound, and vice versa. `adapter_id_a`/`adapter_id_b` become
/// each side's `GeneratedChannel::adapter_id`.
pub fn memory_bridge_pair<V: Send + 'static>(
    adapter_id_a: impl Into<String>,
    adapter_id_b: impl Into<String>,
) -> (MemoryBridgeAdapter<V>, MemoryBridgeAdapter<V>) {
    let id_a = adapter_id_a.into();
    let id_b = adapter_id_b.into();

    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel::<WireMessage<V>>();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel::<WireMessage<V>>();

    let generated_a = GeneratedChannel {
        adapter_id: id_a.clone(),
        kind: ChannelKind::Bridge,
        outbound: a_to_b_tx,
        inbound: b_to_a_rx,
    };
    let generated_b = GeneratedChannel {
        adapter_id: id_b.clone(),
        kind: ChannelKind::Bridge,
        outbound: b_to_a_tx,
        inbound: a_to_b_rx,
    };

    (MemoryBridgeAdapter::new(id_a, generated_a), MemoryBridgeAdapter::new(id_b, generated_b))
}
