use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::ServerEvent;

/// Events buffered per subscriber before a slow connection starts lagging.
pub const BROADCAST_CAPACITY: usize = 1024;

/// Fan-out of server events to every authenticated connection.
///
/// Only the coordinator publishes, so events reach every subscriber in the
/// order they were produced.
#[derive(Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<Arc<ServerEvent>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::with_capacity(BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ServerEvent) {
        // Ignore error - means no receivers
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ServerEvent>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}
