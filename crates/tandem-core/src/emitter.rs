//! Event subscription
//!
//! Components that publish events embed an [`EventBus`] and expose it
//! through the [`Emitter`] trait. Each subscriber gets its own unbounded
//! channel; subscribers whose receiver was dropped are pruned on emit.

use tokio::sync::mpsc;

/// Handle returned by [`Emitter::subscribe`]
pub type SubscriptionId = u64;

/// Something that publishes events of type `E`
pub trait Emitter<E: Clone> {
    /// Register a new subscriber
    fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>);

    /// Remove a subscriber; returns false if it was unknown
    fn unsubscribe(&mut self, id: SubscriptionId) -> bool;

    /// Deliver an event to every live subscriber
    fn emit(&mut self, event: E);
}

/// Fan-out event bus
#[derive(Debug)]
pub struct EventBus<E> {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<E>)>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            subscribers: Vec::new(),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<E: Clone> Emitter<E> for EventBus<E> {
    fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    fn emit(&mut self, event: E) {
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}
