//! Subscriber registry: event type -> ordered callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

/// Callback invoked with an inbound frame's payload.
pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    next_id: u64,
    entries: HashMap<String, Vec<(u64, Callback)>>,
}

impl SubscriberRegistry {
    fn insert(&mut self, event_type: &str, callback: Callback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries
            .entry(event_type.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    fn remove(&mut self, event_type: &str, id: u64) -> bool {
        let Some(list) = self.entries.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(entry_id, _)| *entry_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.entries.remove(event_type);
        }
        removed
    }

    /// Callbacks for `event_type`, in registration order.
    pub(crate) fn callbacks_for(&self, event_type: &str) -> Vec<Callback> {
        self.entries
            .get(event_type)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn len(&self, event_type: &str) -> usize {
        self.entries.get(event_type).map_or(0, Vec::len)
    }
}

pub(crate) type SharedRegistry = Arc<Mutex<SubscriberRegistry>>;

pub(crate) fn subscribe(
    registry: &SharedRegistry,
    event_type: &str,
    callback: Callback,
) -> Subscription {
    let id = registry.lock().insert(event_type, callback);
    Subscription {
        id,
        event_type: event_type.to_string(),
        registry: Arc::downgrade(registry),
    }
}

/// Handle returned by `subscribe`. Removes exactly one callback.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    event_type: String,
    registry: Weak<Mutex<SubscriberRegistry>>,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove this callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().remove(&self.event_type, self.id),
            None => false,
        }
    }
}
