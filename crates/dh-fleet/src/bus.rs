//! In-process publish/subscribe fan-out
//!
//! The bus owns its subscriber collection outright; callers hold opaque
//! handles rather than references into it. Delivery is synchronous and in
//! subscription order, and a misbehaving subscriber can never break
//! delivery to the rest or leak back into the polling loop that published.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dh_core::events::StructuredEvent;

/// Callback invoked for every published event
pub type EventHandler = Arc<dyn Fn(&StructuredEvent) -> anyhow::Result<()> + Send + Sync>;

/// Opaque handle returned by `subscribe`; the only way to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Fan-out from one producer to any number of subscribers
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, EventHandler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler; later subscribers are invoked later
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&StructuredEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        SubscriptionHandle(id)
    }

    /// Remove a subscriber. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != handle.0);
        subscribers.len() != before
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver an event to every subscriber, in subscription order.
    ///
    /// Handler errors are logged; handler panics are caught. Either way the
    /// remaining subscribers still receive the event.
    pub fn publish(&self, event: &StructuredEvent) {
        let handlers: Vec<(u64, EventHandler)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handler)| (*id, Arc::clone(handler)))
            .collect();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(subscriber = id, error = %err, "event subscriber returned an error");
                }
                Err(_) => {
                    tracing::error!(subscriber = id, "event subscriber panicked");
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
