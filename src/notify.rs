use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 1024;

/// Fire-and-forget dispatch of committed changes to delivery workers
/// (reminder e-mails, SMS) that live outside the engine. Events carry their
/// doctor id, so workers filter for themselves. Slow receivers lag and lose
/// messages; senders never block.
pub struct NotifyHub {
    firehose: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { firehose: broadcast::channel(CHANNEL_CAPACITY).0 }
    }

    /// Subscribe to every change in the tenant.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "kind" => event.kind()).increment(1);
        let _ = self.firehose.send(event.clone());
    }
}

/// JSON rendering of an event for external consumers.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| format!("{{\"kind\":\"{}\"}}", event.kind()))
}
