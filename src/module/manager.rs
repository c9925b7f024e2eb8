//! `ModuleManager` — module lifecycle, dependency-ordered init/shutdown,
//! per-call metrics, validation gate.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;

use super::context::{ModuleContext, SharedState};
use super::module_trait::Module;
use super::types::{AtomicModuleMetrics, CallArgs, ModuleMetrics, ModulePriority, ModuleState};
use crate::error::AgentError;
use crate::event_bus::EventBus;

const DEFAULT_INIT_BUDGET: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

pub struct ModuleEntry {
    pub module: Arc<dyn Module>,
    pub state: RwLock<ModuleState>,
    pub metrics: AtomicModuleMetrics,
    pub source_path: Option<PathBuf>,
    pub source_timestamp: Option<SystemTime>,
}

/// A point-in-time description of a registered module, for introspection
/// and status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub priority: ModulePriority,
    pub dependencies: Vec<String>,
    pub state: ModuleState,
    pub metrics: ModuleMetrics,
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub total: usize,
    pub loaded: usize,
    pub error: usize,
    pub total_calls: u64,
    pub total_errors: u64,
    pub health_score: f64,
}

pub struct ModuleManager {
    registry: RwLock<HashMap<String, Arc<ModuleEntry>>>,
    event_bus: Arc<EventBus>,
    shared: Arc<SharedState>,
    should_stop: Arc<AtomicBool>,
    init_budget: Duration,
    shutdown_budget: Duration,
    self_weak: Weak<ModuleManager>,
}

impl ModuleManager {
    pub fn new(event_bus: Arc<EventBus>) -> Arc<Self> {
        Self::with_budgets(event_bus, DEFAULT_INIT_BUDGET, DEFAULT_SHUTDOWN_BUDGET)
    }

    pub fn with_budgets(
        event_bus: Arc<EventBus>,
        init_budget: Duration,
        shutdown_budget: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| ModuleManager {
            registry: RwLock::new(HashMap::new()),
            event_bus,
            shared: Arc::new(SharedState::default()),
            should_stop: Arc::new(AtomicBool::new(false)),
            init_budget,
            shutdown_budget,
            self_weak: weak.clone(),
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn context(&self) -> ModuleContext {
        ModuleContext::new(
            self.self_weak.clone(),
            self.event_bus.clone(),
            self.shared.clone(),
            self.should_stop.clone(),
        )
    }

    /// Registers `module`. Fails with `DuplicateModule` if the name is
    /// taken, `ValidationFailed` on interface breach.
    pub async fn register(&self, module: Arc<dyn Module>) -> Result<(), AgentError> {
        self.register_with_source(module, None, None).await
    }

    pub async fn register_with_source(
        &self,
        module: Arc<dyn Module>,
        source_path: Option<PathBuf>,
        source_timestamp: Option<SystemTime>,
    ) -> Result<(), AgentError> {
        let name = module.name().to_string();
        if name.trim().is_empty() {
            return Err(AgentError::ValidationFailed(
                "module name must not be empty".into(),
            ));
        }

        let mut registry = self.registry.write().await;
        if registry.contains_key(&name) {
            return Err(AgentError::DuplicateModule(name));
        }

        registry.insert(
            name,
            Arc::new(ModuleEntry {
                module,
                state: RwLock::new(ModuleState::Unloaded),
                metrics: AtomicModuleMetrics::default(),
                source_path,
                source_timestamp,
            }),
        );
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.registry.write().await.remove(name).is_some()
    }

    async fn entry(&self, name: &str) -> Result<Arc<ModuleEntry>, AgentError> {
        self.registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::ModuleNotFound(name.to_string()))
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.registry
            .read()
            .await
            .get(name)
            .map(|e| e.module.clone())
    }

    pub async fn state(&self, name: &str) -> Option<ModuleState> {
        let registry = self.registry.read().await;
        let entry = registry.get(name)?;
        Some(*entry.state.read().await)
    }

    /// Recursively initializes `name`'s dependencies before `name` itself,
    /// detecting cycles. Already-`Loaded`/`Active` modules are a no-op.
    pub async fn initialize(&self, name: &str) -> Result<(), AgentError> {
        let mut visiting = Vec::new();
        self.initialize_inner(name, &mut visiting).await
    }

    async fn initialize_inner(
        &self,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<(), AgentError> {
        if visiting.iter().any(|n| n == name) {
            return Err(AgentError::CircularDependency(name.to_string()));
        }

        let entry = self.entry(name).await?;
        {
            let state = *entry.state.read().await;
            if matches!(state, ModuleState::Loaded | ModuleState::Active) {
                return Ok(());
            }
        }

        visiting.push(name.to_string());
        for dep in entry.module.dependencies() {
            if let Err(err) = Box::pin(self.initialize_inner(&dep, visiting)).await {
                *entry.state.write().await = ModuleState::Error;
                visiting.pop();
                return Err(err);
            }
        }
        visiting.pop();

        *entry.state.write().await = ModuleState::Loading;
        let module = entry.module.clone();
        let ctx = Arc::new(self.context());
        let budget = self.init_budget;
        let start = Instant::now();

        let handle = tokio::spawn(async move { module.initialize(ctx).await });
        tokio::pin!(handle);
        let outcome = match tokio::time::timeout(budget, &mut handle).await {
            Ok(joined) => joined.map_err(|e| {
                AgentError::ExecutionError {
                    module: name.to_string(),
                    action: "initialize".to_string(),
                    source: Box::new(AgentError::ValidationFailed(e.to_string())),
                }
            })?,
            Err(_) => {
                tracing::warn!(module = name, ?budget, "module initialize exceeded budget");
                handle.await.map_err(|e| AgentError::ExecutionError {
                    module: name.to_string(),
                    action: "initialize".to_string(),
                    source: Box::new(AgentError::ValidationFailed(e.to_string())),
                })?
            }
        };

        match outcome {
            Ok(()) => {
                *entry.state.write().await = ModuleState::Loaded;
                self.event_bus.emit(
                    "module_initialized",
                    json!({ "name": name, "durationNanos": start.elapsed().as_nanos() as u64 }),
                );
                Ok(())
            }
            Err(err) => {
                *entry.state.write().await = ModuleState::Error;
                Err(err)
            }
        }
    }

    /// Inverse order teardown; bounded by `shutdownTimeout`. A timeout or
    /// a module error both sink the module into `Error`, not `Unloaded`.
    pub async fn shutdown(&self, name: &str) -> Result<(), AgentError> {
        let entry = self.entry(name).await?;
        *entry.state.write().await = ModuleState::Unloading;

        let module = entry.module.clone();
        let ctx = Arc::new(self.context());
        let budget = self.shutdown_budget;

        let handle = tokio::spawn(async move { module.shutdown(ctx).await });
        tokio::pin!(handle);
        let outcome = tokio::time::timeout(budget, &mut handle).await;

        match outcome {
            Ok(Ok(Ok(()))) => {
                *entry.state.write().await = ModuleState::Unloaded;
                self.event_bus.emit("module_shutdown", json!({ "name": name }));
                Ok(())
            }
            Ok(Ok(Err(err))) => {
                *entry.state.write().await = ModuleState::Error;
                Err(err)
            }
            Ok(Err(join_err)) => {
                *entry.state.write().await = ModuleState::Error;
                Err(AgentError::ExecutionError {
                    module: name.to_string(),
                    action: "shutdown".to_string(),
                    source: Box::new(AgentError::ValidationFailed(join_err.to_string())),
                })
            }
            Err(_elapsed) => {
                *entry.state.write().await = ModuleState::Error;
                Err(AgentError::TimeoutExceeded {
                    operation: "shutdown",
                    target: name.to_string(),
                    budget,
                })
            }
        }
    }

    /// Stable topological order derived from `dependencies()`, ties broken
    /// by name so the order is deterministic across runs.
    pub async fn topological_order(&self) -> Result<Vec<String>, AgentError> {
        let registry = self.registry.read().await;
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();

        let mut visited: HashSet<String> = HashSet::new();
        let mut visiting: Vec<String> = Vec::new();
        let mut order: Vec<String> = Vec::new();

        fn visit(
            name: &str,
            registry: &HashMap<String, Arc<ModuleEntry>>,
            visited: &mut HashSet<String>,
            visiting: &mut Vec<String>,
            order: &mut Vec<String>,
        ) -> Result<(), AgentError> {
            if visited.contains(name) {
                return Ok(());
            }
            if visiting.iter().any(|n| n == name) {
                return Err(AgentError::CircularDependency(name.to_string()));
            }
            visiting.push(name.to_string());
            if let Some(entry) = registry.get(name) {
                let mut deps = entry.module.dependencies();
                deps.sort();
                for dep in deps {
                    visit(&dep, registry, visited, visiting, order)?;
                }
            }
            visiting.pop();
            visited.insert(name.to_string());
            order.push(name.to_string());
            Ok(())
        }

        for name in &names {
            visit(name, &registry, &mut visited, &mut visiting, &mut order)?;
        }
        Ok(order)
    }

    pub async fn initialize_all(&self) -> Result<Vec<String>, AgentError> {
        let order = self.topological_order().await?;
        for name in &order {
            self.initialize(name).await?;
        }
        Ok(order)
    }

    pub async fn shutdown_all(&self) -> Result<Vec<String>, AgentError> {
        let mut order = self.topological_order().await?;
        order.reverse();
        for name in &order {
            if self.state(name).await == Some(ModuleState::Unloaded) {
                continue;
            }
            self.shutdown(name).await?;
        }
        Ok(order)
    }

    /// Looks up module and action, records one call in metrics, runs the
    /// action, and re-raises the original error wrapped as
    /// `ExecutionError` on failure.
    pub async fn call(
        &self,
        name: &str,
        action: &str,
        args: CallArgs,
    ) -> Result<serde_json::Value, AgentError> {
        let entry = self.entry(name).await?;

        if !entry.module.has_action(action) {
            return Err(AgentError::ActionNotFound {
                module: name.to_string(),
                action: action.to_string(),
            });
        }

        let ctx = Arc::new(self.context());
        let start = Instant::now();
        let result = entry.module.call(action, args, ctx).await;
        let elapsed = start.elapsed().as_nanos() as u64;

        match result {
            Ok(value) => {
                entry.metrics.record_success(elapsed);
                Ok(value)
            }
            Err(err) => {
                entry.metrics.record_failure(elapsed, err.to_string());
                Err(AgentError::ExecutionError {
                    module: name.to_string(),
                    action: action.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    pub async fn find_by_capability(&self, capability: &str) -> Vec<Arc<dyn Module>> {
        self.registry
            .read()
            .await
            .values()
            .filter(|e| e.module.has_action(capability))
            .map(|e| e.module.clone())
            .collect()
    }

    pub async fn list(&self) -> Vec<ModuleDescriptor> {
        let registry = self.registry.read().await;
        let mut descriptors = Vec::with_capacity(registry.len());
        for entry in registry.values() {
            descriptors.push(ModuleDescriptor {
                name: entry.module.name().to_string(),
                version: entry.module.version().to_string(),
                priority: entry.module.priority(),
                dependencies: entry.module.dependencies(),
                state: *entry.state.read().await,
                metrics: entry.metrics.snapshot(),
                source_path: entry.source_path.clone(),
            });
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub async fn system_health(&self) -> SystemHealth {
        let registry = self.registry.read().await;
        let mut loaded = 0usize;
        let mut error = 0usize;
        let mut total_calls = 0u64;
        let mut total_errors = 0u64;

        for entry in registry.values() {
            let state = *entry.state.read().await;
            match state {
                ModuleState::Loaded | ModuleState::Active => loaded += 1,
                ModuleState::Error => error += 1,
                _ => {}
            }
            let metrics = entry.metrics.snapshot();
            total_calls += metrics.calls;
            total_errors += metrics.errors;
        }

        let total = registry.len();
        let health_score = if total == 0 {
            100.0
        } else {
            (loaded as f64 / total as f64) * 100.0
        };

        SystemHealth {
            total,
            loaded,
            error,
            total_calls,
            total_errors,
            health_score,
        }
    }

    pub fn should_stop_flag(&self) -> Arc<AtomicBool> {
        self.should_stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::capability::Capability;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Module for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::new("say", "echoes its argument")]
        }
        async fn call(
            &self,
            action: &str,
            args: CallArgs,
            _ctx: Arc<ModuleContext>,
        ) -> Result<serde_json::Value, AgentError> {
            match action {
                "say" => Ok(args
                    .get("msg", 0)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)),
                other => Err(AgentError::ActionNotFound {
                    module: "echo".into(),
                    action: other.into(),
                }),
            }
        }
    }

    struct Boom;

    #[async_trait]
    impl Module for Boom {
        fn name(&self) -> &str {
            "bad"
        }
        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::new("boom", "always fails")]
        }
        async fn call(
            &self,
            _action: &str,
            _args: CallArgs,
            _ctx: Arc<ModuleContext>,
        ) -> Result<serde_json::Value, AgentError> {
            Err(AgentError::ValidationFailed("kaboom".into()))
        }
    }

    struct Dep {
        name: &'static str,
        deps: Vec<String>,
        order: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Module for Dep {
        fn name(&self) -> &str {
            self.name
        }
        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
        fn capabilities(&self) -> Vec<Capability> {
            Vec::new()
        }
        async fn initialize(&self, _ctx: Arc<ModuleContext>) -> Result<(), AgentError> {
            self.order.lock().unwrap().push(self.name.to_string());
            Ok(())
        }
        async fn call(
            &self,
            _action: &str,
            _args: CallArgs,
            _ctx: Arc<ModuleContext>,
        ) -> Result<serde_json::Value, AgentError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn register_and_call_echo() {
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager.register(Arc::new(Echo)).await.unwrap();
        manager.initialize("echo").await.unwrap();

        let result = manager
            .call("echo", "say", CallArgs::positional(["hello".into()]))
            .await
            .unwrap();
        assert_eq!(result, serde_json::Value::from("hello"));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager.register(Arc::new(Echo)).await.unwrap();
        let err = manager.register(Arc::new(Echo)).await.unwrap_err();
        assert_eq!(err.kind(), "DuplicateModule");
    }

    #[tokio::test]
    async fn failure_is_wrapped_as_execution_error_and_metrics_updated() {
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager.register(Arc::new(Boom)).await.unwrap();
        manager.initialize("bad").await.unwrap();

        let err = manager
            .call("bad", "boom", CallArgs::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ExecutionError");

        let descriptors = manager.list().await;
        let bad = descriptors.iter().find(|d| d.name == "bad").unwrap();
        assert_eq!(bad.metrics.calls, 1);
        assert_eq!(bad.metrics.errors, 1);
    }

    #[tokio::test]
    async fn dependencies_initialize_before_dependents() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager
            .register(Arc::new(Dep {
                name: "a",
                deps: vec![],
                order: order.clone(),
            }))
            .await
            .unwrap();
        manager
            .register(Arc::new(Dep {
                name: "b",
                deps: vec!["a".into()],
                order: order.clone(),
            }))
            .await
            .unwrap();
        manager
            .register(Arc::new(Dep {
                name: "c",
                deps: vec!["b".into()],
                order: order.clone(),
            }))
            .await
            .unwrap();

        let init_order = manager.initialize_all().await.unwrap();
        assert_eq!(init_order, vec!["a", "b", "c"]);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn circular_dependency_is_detected() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager
            .register(Arc::new(Dep {
                name: "x",
                deps: vec!["y".into()],
                order: order.clone(),
            }))
            .await
            .unwrap();
        manager
            .register(Arc::new(Dep {
                name: "y",
                deps: vec!["x".into()],
                order: order.clone(),
            }))
            .await
            .unwrap();

        let err = manager.initialize("x").await.unwrap_err();
        assert_eq!(err.kind(), "CircularDependency");
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager.register(Arc::new(Echo)).await.unwrap();
        manager.initialize("echo").await.unwrap();
        let err = manager
            .call("echo", "nope", CallArgs::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ActionNotFound");
    }

    #[tokio::test]
    async fn find_by_capability_scans_registry() {
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager.register(Arc::new(Echo)).await.unwrap();
        manager.register(Arc::new(Boom)).await.unwrap();
        let found = manager.find_by_capability("say").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "echo");
    }

    #[tokio::test]
    async fn system_health_reports_loaded_fraction() {
        let manager = ModuleManager::new(Arc::new(EventBus::new()));
        manager.register(Arc::new(Echo)).await.unwrap();
        manager.register(Arc::new(Boom)).await.unwrap();
        manager.initialize("echo").await.unwrap();

        let health = manager.system_health().await;
        assert_eq!(health.total, 2);
        assert_eq!(health.loaded, 1);
        assert!((health.health_score - 50.0).abs() < f64::EPSILON);
    }
}
