//! In-process notification channels
//!
//! Catalog updates and job state transitions are fanned out to any number of
//! subscribers (UI, log display, CLI waiters) over a `tokio::sync::broadcast`
//! channel. Publishing never blocks and never fails when nobody listens.

use tokio::sync::broadcast;

/// Default buffer capacity for a channel.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out channel for one kind of event.
///
/// Events published from a single thread are delivered to every subscriber in
/// publish order. A subscriber that falls more than the channel capacity
/// behind observes `RecvError::Lagged` and should re-read current state.
pub struct EventBus<T: Clone> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    /// Create a bus with a specific channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: T) {
        // A SendError only means there are no receivers right now
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
