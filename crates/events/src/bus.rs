//! Broadcast bus carrying orchestration progress events.
//!
//! Engine output arrives as per-task chunks, so the channel is sized for
//! bursts well beyond the phase concurrency limit. Slow subscribers lag
//! rather than block the scheduler: a lagged receiver skips ahead to the
//! oldest retained event and keeps going. Events published with no
//! subscriber at all are dropped and counted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Event, EventEnvelope};

/// Sized for output-chunk bursts from a full slate of concurrent tasks.
const DEFAULT_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wrap `event` in a fresh envelope and broadcast it.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: Event) -> usize {
        self.publish_envelope(EventEnvelope::new(event))
    }

    /// Broadcast an existing envelope, keeping its id and timestamp.
    ///
    /// Used when relaying notifications that were already enveloped, so
    /// every observer sees the same envelope identity.
    pub fn publish_envelope(&self, envelope: EventEnvelope) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(envelope) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(envelope)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(event = ?envelope.event, "event dropped, no subscribers");
                0
            }
        }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total events published, including dropped ones.
    pub fn event_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Events that found no subscriber at publish time.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .field("dropped_count", &self.dropped_count())
            .finish()
    }
}
