//! `ModuleContext` — the sanctioned surface a module uses to reach the
//! rest of the system. Modules never hold a strong reference
//! to the manager; the weak back-reference is lookup-only and never
//! extends the manager's lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use super::manager::ModuleManager;
use super::module_trait::Module;
use super::types::CallArgs;
use crate::error::AgentError;
use crate::event_bus::{EventBus, EventHandler, SubscriptionId};

/// Process-wide string-keyed typed map, serialised by a single mutex.
#[derive(Default)]
pub struct SharedState {
    values: Mutex<HashMap<String, Value>>,
}

impl SharedState {
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.values
            .lock()
            .expect("shared state lock poisoned")
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .expect("shared state lock poisoned")
            .get(key)
            .cloned()
    }
}

pub struct ModuleContext {
    manager: Weak<ModuleManager>,
    event_bus: Arc<EventBus>,
    shared: Arc<SharedState>,
    should_stop: Arc<AtomicBool>,
}

impl ModuleContext {
    pub(crate) fn new(
        manager: Weak<ModuleManager>,
        event_bus: Arc<EventBus>,
        shared: Arc<SharedState>,
        should_stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            manager,
            event_bus,
            shared,
            should_stop,
        }
    }

    /// Returns the registered module or `None`; never transfers ownership
    /// of the manager's registry.
    pub async fn get_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        let manager = self.manager.upgrade()?;
        manager.get(name).await
    }

    /// Delegates to `ModuleManager::call` with the same metrics
    /// accounting a manager-driven dispatch would get.
    pub async fn call(
        &self,
        name: &str,
        action: &str,
        args: CallArgs,
    ) -> Result<Value, AgentError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| AgentError::ModuleNotFound(name.to_string()))?;
        manager.call(name, action, args).await
    }

    pub fn emit(&self, topic: &str, payload: Value) {
        self.event_bus.emit(topic, payload);
    }

    pub fn subscribe(&self, topic: &str, handler: EventHandler) -> SubscriptionId {
        self.event_bus.subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        self.event_bus.unsubscribe(topic, id);
    }

    pub fn set_shared(&self, key: impl Into<String>, value: Value) {
        self.shared.set(key, value);
    }

    pub fn get_shared(&self, key: &str) -> Option<Value> {
        self.shared.get(key)
    }

    /// Cooperative stop flag modules should poll in long-running actions
    /// instead of being forcibly killed.
    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }
}
