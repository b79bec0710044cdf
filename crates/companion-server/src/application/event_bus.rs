//! ConnectionEventBus: synchronous publish/subscribe for connection changes.
//!
//! Publishing calls every subscriber in subscription order before returning,
//! on the thread that triggered the change.  There is no buffering, so a
//! subscriber always observes the registry exactly as it was right after the
//! mutation that caused the event.
//!
//! Event payloads are clones.  A `ConnectionChanged { is_connected: false }`
//! session is already gone from the registry when it is published.

use companion_core::{MicProfile, Session};
use tracing::trace;

/// An event published by the lifecycle controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A session was registered (`true`) or removed (`false`).
    ConnectionChanged { session: Session, is_connected: bool },
    /// A mic profile's name was corrected to match its companion client.
    MicProfileChanged { profile: MicProfile },
}

/// Identifies a subscription for [`ConnectionEventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(&ConnectionEvent) + Send>;

/// Multicast point for [`ConnectionEvent`]s.
#[derive(Default)]
pub struct ConnectionEventBus {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
}

impl ConnectionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `callback`; it receives every event published from now on.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&ConnectionEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Detaches a subscriber.  Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
        self.subscribers.len() != before
    }

    /// Delivers `event` to every subscriber before returning.
    pub fn publish(&mut self, event: &ConnectionEvent) {
        trace!(
            "publishing {:?} to {} subscriber(s)",
            std::mem::discriminant(event),
            self.subscribers.len()
        );
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
