//! Synchronous fan-out of events to channel subscribers.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Delivers each published event to every live subscriber.
///
/// Publishing never blocks: subscriber channels are unbounded and
/// subscribers whose receiver was dropped are pruned on the next publish.
pub struct EventBus<T> {
    subscribers: Arc<Mutex<Vec<Sender<T>>>>,
}

impl<T: Clone> EventBus<T> {
    /// Create a bus without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a subscriber.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Register a subscriber whose first event is `initial`.
    pub fn subscribe_with(&self, initial: T) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        // Cannot fail, the receiver is alive.
        let _ = tx.send(initial);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}
