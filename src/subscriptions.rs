//! Field-level change notification.
//!
//! Observable entities (tasks, file locks) publish a [`ChangeEvent`] for every
//! field whose value changed. Consumers register callbacks with a
//! [`ChangeNotifier`], either for all fields or for a single field name. The
//! contract is independent of any rendering framework: values are carried as
//! `serde_json::Value`.
//!
//! Callbacks run after the entity's own lock has been released, so a callback
//! may read the entity it is observing.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A single "this field changed" notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// Id of the entity that changed (task id or normalized lock path).
    pub source: String,
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    /// `None` receives every field.
    field: Option<String>,
    callback: Callback,
}

/// Thread-safe list of change callbacks.
///
/// Uses an internal `Mutex` so it can be shared across async tasks without
/// requiring `&mut self`.
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    /// Create a notifier with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive every change event.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(callback))
    }

    /// Receive change events for one field only.
    pub fn subscribe_field<F>(&self, field: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.register(Some(field.to_string()), Arc::new(callback))
    }

    fn register(&self, field: Option<String>, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.push(Subscriber {
            id,
            field,
            callback,
        });
        id
    }

    /// Remove a subscription. Returns `true` if it was present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Check if any subscriptions are registered.
    pub fn has_subscriptions(&self) -> bool {
        !self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Deliver events to matching subscribers.
    pub fn publish(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        // Snapshot the callbacks so a callback may (un)subscribe without deadlock.
        let targets: Vec<(Option<String>, Callback)> = {
            let subs = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.iter()
                .map(|s| (s.field.clone(), Arc::clone(&s.callback)))
                .collect()
        };

        for event in events {
            for (field, callback) in &targets {
                if field.as_deref().is_none_or(|f| f == event.field) {
                    callback(event);
                }
            }
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare two JSON objects key by key and report every top-level field
/// whose value differs.
pub fn diff_fields(source: &str, before: &Value, after: &Value) -> Vec<ChangeEvent> {
    let (Some(old_map), Some(new_map)) = (before.as_object(), after.as_object()) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for (key, new_value) in new_map {
        let old_value = old_map.get(key).cloned().unwrap_or(Value::Null);
        if &old_value != new_value {
            events.push(ChangeEvent {
                source: source.to_string(),
                field: key.clone(),
                old: old_value,
                new: new_value.clone(),
            });
        }
    }
    for (key, old_value) in old_map {
        if !new_map.contains_key(key) {
            events.push(ChangeEvent {
                source: source.to_string(),
                field: key.clone(),
                old: old_value.clone(),
                new: Value::Null,
            });
        }
    }
    events
}
