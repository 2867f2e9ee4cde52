//! Status fan-out to connected observers.
//!
//! Every [`StatusEvent`] goes to all current observers, synchronously and
//! in subscription order. The latest event per file is kept so that an
//! observer that reconnects can ask for a [`snapshot`](StatusBroadcaster::snapshot)
//! and then follow live events. Nothing here is persisted.

use dashmap::DashMap;
use ingest_relay_core::events::{SubscriberList, SubscriptionId};
use ingest_relay_core::models::{DerivedFile, FileSnapshot, StatusEvent};
use tracing::debug;

/// What observers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status(StatusEvent),
    Derived(DerivedFile),
}

#[derive(Default)]
pub struct StatusBroadcaster {
    latest: DashMap<String, StatusEvent>,
    observers: SubscriberList<Notification>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` as the file's latest state and deliver it. Returns
    /// the number of observers reached; with none, the event is dropped.
    pub fn publish(&self, event: StatusEvent) -> usize {
        self.latest.insert(event.file_id.clone(), event.clone());
        let reached = self.observers.dispatch(&Notification::Status(event));
        if reached == 0 {
            debug!("status event dropped: no observers");
        }
        reached
    }

    /// Announce that `original_file_id` now continues as `new_file_id`.
    pub fn publish_derived(&self, derived: DerivedFile) -> usize {
        if let Some((_, mut last)) = self.latest.remove(&derived.original_file_id) {
            last.file_id = derived.new_file_id.clone();
            self.latest.insert(derived.new_file_id.clone(), last);
        }
        self.observers.dispatch(&Notification::Derived(derived))
    }

    /// Register an observer under a caller-chosen id. Re-subscribing with
    /// the same id replaces the callback.
    pub fn subscribe<F>(&self, observer_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new(observer_id);
        self.observers.subscribe_as(id.clone(), callback);
        id
    }

    pub fn unsubscribe(&self, observer_id: &str) -> bool {
        self.observers.unsubscribe(&SubscriptionId::new(observer_id))
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Latest known state per requested file, in request order.
    pub fn snapshot(&self, file_ids: &[String]) -> Vec<FileSnapshot> {
        file_ids
            .iter()
            .map(|id| match self.latest.get(id) {
                Some(event) => FileSnapshot {
                    file_id: id.clone(),
                    state: Some(event.state),
                    stage_name: event.stage_name.clone(),
                    message: Some(event.message.clone()),
                },
                None => FileSnapshot {
                    file_id: id.clone(),
                    state: None,
                    stage_name: None,
                    message: None,
                },
            })
            .collect()
    }

    pub fn latest(&self, file_id: &str) -> Option<StatusEvent> {
        self.latest.get(file_id).map(|e| e.clone())
    }

    pub fn forget(&self, file_id: &str) {
        self.latest.remove(file_id);
    }

    pub fn clear(&self) {
        self.latest.clear();
    }
}
