//! Live broadcast of build lifecycle events.
//!
//! Uses a tokio broadcast channel: every subscriber gets an independent
//! receiver, events reach only receivers that exist at publish time, and a
//! single publisher's events arrive in publish order. Dropping a
//! [`Subscription`] unsubscribes it.

use tokio::sync::broadcast;

use crate::models::BuildEvent;

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 16;

pub type Subscription = broadcast::Receiver<BuildEvent>;

#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<BuildEvent>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Returns the number of subscribers reached. Publishing with nobody
    /// listening is not an error.
    pub fn publish(&self, event: BuildEvent) -> usize {
        let reached = self.sender.send(event).unwrap_or(0);
        tracing::debug!(?event, reached, "Published build event");
        reached
    }

    pub fn subscribe(&self) -> Subscription {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
