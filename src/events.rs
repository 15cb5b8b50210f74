//! Probe event bus — typed progress events from every component.
//!
//! A `tokio::sync::broadcast` channel carrying [`ProbeEvent`] values. The
//! CLI, log sinks, or embedding applications subscribe independently; when
//! no subscriber exists, events are silently dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the probing engine emits. Serialized to JSON for downstream
/// consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProbeEvent {
    /// A probing run has started on a listing.
    ProbeStarted { source: String, controls: usize },
    /// The listing finished loading enough eligible cards.
    ListingReady { source: String, controls: usize },
    /// One product was added to the cart and its identity verified.
    ProductAdded { code: String, rank: u32 },
    /// A batch flush has started.
    FlushStarted { flush_index: usize, batch_size: usize },
    /// A batch flush completed: cart read, merged, and cleared.
    FlushComplete {
        flush_index: usize,
        lines_read: usize,
        unparsed_lines: usize,
        elapsed_ms: u64,
    },
    /// Cart clearing left residual lines behind (best-effort semantics).
    PartialCartClear { residual: usize },
    /// A response tripped a challenge signature; the run is aborting.
    ChallengeTripped { url: String, status: u16 },
    /// The run finished. `covered` vs `expected` is how callers judge the
    /// completeness of a partial result.
    ProbeFinished {
        source: String,
        products: usize,
        flushes: usize,
        covered: usize,
        expected: usize,
    },
}

/// The central event bus for a probing run.
pub struct EventBus {
    sender: broadcast::Sender<ProbeEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: ProbeEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.sender.subscribe()
    }
}
