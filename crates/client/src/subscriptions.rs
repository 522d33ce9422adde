//! Event callbacks keyed by event name, with `*` matching every event.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tether_protocol::EventFrame;

pub const WILDCARD: &str = "*";

pub type EventCallback = Arc<dyn Fn(&EventFrame) + Send + Sync>;

type CallbackMap = HashMap<String, Vec<(u64, EventCallback)>>;

#[derive(Default)]
pub struct Subscriptions {
    callbacks: Arc<Mutex<CallbackMap>>,
    next_id: AtomicU64,
}

fn lock(map: &Mutex<CallbackMap>) -> MutexGuard<'_, CallbackMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event` until the returned guard is dropped.
    pub fn subscribe(&self, event: &str, callback: EventCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.callbacks)
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        Subscription {
            callbacks: Arc::downgrade(&self.callbacks),
            event: event.to_string(),
            id,
        }
    }

    /// Invoke every callback registered for the frame's event and for `*`.
    /// Callbacks run outside the lock, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, frame: &EventFrame) -> usize {
        let targets: Vec<EventCallback> = {
            let map = lock(&self.callbacks);
            [frame.event.as_str(), WILDCARD]
                .iter()
                .filter_map(|name| map.get(*name))
                .flatten()
                .map(|(_, cb)| Arc::clone(cb))
                .collect()
        };
        for callback in &targets {
            callback(frame);
        }
        targets.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.callbacks).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live registration. Dropping it removes the callback.
#[must_use = "the callback is removed when the subscription is dropped"]
pub struct Subscription {
    callbacks: Weak<Mutex<CallbackMap>>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove the callback now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(callbacks) = self.callbacks.upgrade() else {
            return;
        };
        let mut map = lock(&callbacks);
        if let Some(list) = map.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                map.remove(&self.event);
            }
        }
    }
}
