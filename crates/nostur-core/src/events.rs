use nostr::Event;
use tokio::sync::broadcast;

use crate::store::PersistentNotification;

const BUS_CAPACITY: usize = 1024;

/// Signals published by the worker
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// An event arrived from a relay and was stored
    NewEvent { relay_url: String, event: Box<Event> },
    /// A notification was stored
    NotificationCreated(PersistentNotification),
    RelayConnected { relay_url: String },
    RelayDisconnected { relay_url: String },
}

/// Fan-out channel for [`CoreEvent`]s.
///
/// Events are sent from the worker thread. Observers that drive a UI must
/// hand payloads off to their own thread. A slow observer skips events
/// rather than stalling the worker.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Returns how many observers received the event
    pub fn publish(&self, event: CoreEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
