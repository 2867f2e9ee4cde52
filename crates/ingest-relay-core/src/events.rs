//! Synchronous subscriber lists.
//!
//! Used for channel state changes, inbound channel messages, and status
//! broadcasts. Subscribers run in registration order on the publishing
//! thread. A subscriber that panics is logged and skipped; the remaining
//! subscribers still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

/// Handle returned by [`SubscriberList::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered list of callbacks for events of type `E`.
pub struct SubscriberList<E> {
    subscribers: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
    prefix: &'static str,
    counter: std::sync::atomic::AtomicU64,
}

impl<E> SubscriberList<E> {
    pub fn new() -> Self {
        Self::with_prefix("sub")
    }

    /// Generated ids look like `{prefix}-{n}`, which keeps ids from
    /// different lists apart.
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            prefix,
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Register a callback under a generated id.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let id = SubscriptionId(format!("{}-{}", self.prefix, n));
        self.subscribe_as(id.clone(), callback);
        id
    }

    /// Register a callback under a caller-chosen id, replacing any
    /// previous callback with that id in place.
    pub fn subscribe_as<F>(&self, id: SubscriptionId, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut subs = self.subscribers.write();
        let callback: Callback<E> = Arc::new(callback);
        match subs.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = callback,
            None => subs.push((id, callback)),
        }
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(existing, _)| existing != id);
        subs.len() != before
    }

    /// Deliver `event` to every subscriber. Returns how many were called.
    pub fn dispatch(&self, event: &E) -> usize {
        // Clone the list so callbacks may (un)subscribe without deadlocking.
        let subs: Vec<(SubscriptionId, Callback<E>)> = self.subscribers.read().clone();
        for (id, callback) in &subs {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(subscriber = id.as_str(), "subscriber panicked; skipped");
            }
        }
        subs.len()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

impl<E> Default for SubscriberList<E> {
    fn default() -> Self {
        Self::new()
    }
}
