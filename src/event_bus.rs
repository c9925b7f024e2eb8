//! Many-to-many topic publish/subscribe.
//!
//! Delivery is synchronous: `emit` snapshots the current handler list for a
//! topic under the bus lock, releases the lock, then invokes handlers in
//! subscription order. A handler panic is caught and logged; it never
//! interrupts later handlers or the emitter.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Opaque handle returned by `subscribe`, needed to `unsubscribe` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`, returning an id that can later be
    /// passed to `unsubscribe`.
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.write().expect("event bus lock poisoned");
        subs.entry(topic.into())
            .or_default()
            .push(Subscriber { id, handler });
        id
    }

    /// Removes a previously registered handler. No-op if it is already gone.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut subs = self.subscribers.write().expect("event bus lock poisoned");
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|s| s.id != id);
        }
    }

    /// Delivers `payload` to every subscriber of `topic`, in the order they
    /// subscribed. The bus lock is held only long enough to clone the
    /// handler list; no handler ever runs while holding it.
    pub fn emit(&self, topic: &str, payload: Value) {
        let handlers: Vec<EventHandler> = {
            let subs = self.subscribers.read().expect("event bus lock poisoned");
            match subs.get(topic) {
                Some(list) => list.iter().map(|s| s.handler.clone()).collect(),
                None => return,
            }
        };

        for handler in handlers {
            let payload = payload.clone();
            let result = catch_unwind(AssertUnwindSafe(|| handler(&payload)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                tracing::error!(topic, message, "event handler panicked; continuing");
            }
        }
    }

    /// Number of handlers currently registered for `topic` (test/diagnostic
    /// helper).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .expect("event bus lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
