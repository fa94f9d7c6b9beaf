//! Fan-out of server events to every attached connection

use super::types::ServerEvent;
use tokio::sync::broadcast;

/// Cloneable sender side of the event bus
///
/// Sending never blocks; events sent while nobody listens are dropped.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn send(&self, event: ServerEvent) {
        tracing::trace!(
            event = event.kind(),
            session_id = event.session_id().unwrap_or("-"),
            "Broadcasting event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}
