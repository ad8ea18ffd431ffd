//! Event bus - broadcast channel for status events
//!
//! Fire-and-forget: no subscribers is fine, slow subscribers lag and drop
//! the oldest events.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::ForgeEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Broadcast bus for [`ForgeEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ForgeEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: ForgeEvent) {
        debug!(kind = event.kind(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to receive events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ForgeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
