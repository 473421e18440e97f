//! Narrow notification sink consumed by host UIs.
//!
//! The orchestration core only ever calls `notify`; a dashboard, sidebar
//! or status bar implements this differently per target UI. The core
//! never imports a UI toolkit.

use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::types::{EventEnvelope, Severity};

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &EventEnvelope);
}

/// Forwards notifications onto the event bus.
pub struct EventBusNotifier {
    bus: EventBus,
}

impl EventBusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl Notifier for EventBusNotifier {
    fn notify(&self, event: &EventEnvelope) {
        self.bus.publish_envelope(event.clone());
    }
}

/// Logs notifications via tracing at a level matching their severity.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &EventEnvelope) {
        match event.event.severity() {
            Severity::Critical | Severity::High => {
                error!(event = ?event.event, "notification")
            }
            Severity::Medium => warn!(event = ?event.event, "notification"),
            Severity::Low => info!(event = ?event.event, "notification"),
        }
    }
}

/// Discards notifications. Useful in tests and headless runs.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &EventEnvelope) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Event;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_event_bus_notifier_forwards() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let notifier = EventBusNotifier::new(bus);

        let envelope = EventEnvelope::new(Event::SessionCancelled {
            session_id: Uuid::new_v4(),
        });
        notifier.notify(&envelope);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, envelope.id);
    }

    #[test]
    fn test_null_notifier_is_silent() {
        let notifier = NullNotifier;
        let envelope = EventEnvelope::new(Event::FeatureRecovered {
            feature: "dashboard".to_string(),
        });
        notifier.notify(&envelope);
    }
}
