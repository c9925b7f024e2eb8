//! Black-box scenario tests exercising `Agent` end to end, through the
//! public crate API only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ellma_core::agent::{Agent, StatePaths};
use ellma_core::config::Config;
use ellma_core::dispatcher::Dispatched;
use ellma_core::error::AgentError;
use ellma_core::generator::MockTextGenerator;
use ellma_core::module::loader::InProcessModuleBuilder;
use ellma_core::module::{CallArgs, Capability, Module, ModuleBuilder, ModuleContext};
use serde_json::{json, Value};

struct Adder;

#[async_trait]
impl Module for Adder {
    fn name(&self) -> &str {
        "adder"
    }
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new("sum", "adds two numbers")]
    }
    async fn call(
        &self,
        action: &str,
        args: CallArgs,
        _ctx: Arc<ModuleContext>,
    ) -> Result<Value, AgentError> {
        if action != "sum" {
            return Err(AgentError::ActionNotFound {
                module: self.name().to_string(),
                action: action.to_string(),
            });
        }
        let a = args.get_i64("a", 0).unwrap_or(0);
        let b = args.get_i64("b", 1).unwrap_or(0);
        Ok(json!(a + b))
    }
}

/// Always fails its one action, to drive the failure-rate trigger.
struct Flaky;

#[async_trait]
impl Module for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new("boom", "always fails")]
    }
    async fn call(
        &self,
        _action: &str,
        _args: CallArgs,
        _ctx: Arc<ModuleContext>,
    ) -> Result<Value, AgentError> {
        Err(AgentError::ExecutionError {
            module: self.name().to_string(),
            action: "boom".to_string(),
            source: Box::new(AgentError::ValidationFailed("always fails".to_string())),
        })
    }
}

/// Depends on `adder`, so dependency-ordered `initialize_all` must bring
/// `adder` up first.
struct Dependent {
    init_order: Arc<AtomicU64>,
    slot: Arc<AtomicU64>,
}

#[async_trait]
impl Module for Dependent {
    fn name(&self) -> &str {
        "dependent"
    }
    fn dependencies(&self) -> Vec<String> {
        vec!["adder".to_string()]
    }
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::new("ping", "returns pong")]
    }
    async fn initialize(&self, _ctx: Arc<ModuleContext>) -> Result<(), AgentError> {
        let n = self.init_order.fetch_add(1, Ordering::SeqCst);
        self.slot.store(n, Ordering::SeqCst);
        Ok(())
    }
    async fn call(
        &self,
        _action: &str,
        _args: CallArgs,
        _ctx: Arc<ModuleContext>,
    ) -> Result<Value, AgentError> {
        Ok(json!("pong"))
    }
}

fn no_modules_builder() -> Arc<dyn ModuleBuilder> {
    Arc::new(InProcessModuleBuilder(|_: &str| -> Arc<dyn Module> {
        unreachable!("no generated modules expected in these scenarios")
    }))
}

#[tokio::test]
async fn simple_module_call_returns_its_result() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(
        Config::default(),
        no_modules_builder(),
        None,
        StatePaths::under(dir.path()),
    );
    agent.module_manager().register(Arc::new(Adder)).await.unwrap();
    agent.initialize_all().await.unwrap();

    let result = agent.execute("adder.sum --a=2 --b=3").await.unwrap();
    match result {
        Dispatched::Called(value) => assert_eq!(value, json!(5)),
        Dispatched::BuiltIn { .. } => panic!("expected a module call"),
    }
}

#[tokio::test]
async fn flag_and_positional_parsing_reach_the_module_call() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(
        Config::default(),
        no_modules_builder(),
        None,
        StatePaths::under(dir.path()),
    );
    agent.module_manager().register(Arc::new(Adder)).await.unwrap();
    agent.initialize_all().await.unwrap();

    // Positional arguments fall back to index-based lookup in `CallArgs`.
    let result = agent.execute("adder.sum 10 20").await.unwrap();
    match result {
        Dispatched::Called(value) => assert_eq!(value, json!(30)),
        Dispatched::BuiltIn { .. } => panic!("expected a module call"),
    }
}

#[tokio::test]
async fn dependency_ordering_initializes_dependencies_first() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(
        Config::default(),
        no_modules_builder(),
        None,
        StatePaths::under(dir.path()),
    );

    let order_counter = Arc::new(AtomicU64::new(0));
    let adder_slot = Arc::new(AtomicU64::new(u64::MAX));
    let dependent_slot = Arc::new(AtomicU64::new(u64::MAX));

    agent
        .module_manager()
        .register(Arc::new(Dependent {
            init_order: order_counter.clone(),
            slot: dependent_slot.clone(),
        }))
        .await
        .unwrap();
    agent.module_manager().register(Arc::new(Adder)).await.unwrap();

    let order = agent.initialize_all().await.unwrap();
    assert_eq!(order.iter().position(|n| n == "adder"), Some(0));
    assert_eq!(order.iter().position(|n| n == "dependent"), Some(1));
}

#[tokio::test]
async fn unknown_module_without_nlp_fallback_is_reported_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.shell.use_nlp = false;
    let agent = Agent::new(config, no_modules_builder(), None, StatePaths::under(dir.path()));
    agent.initialize_all().await.unwrap();

    let err = agent.execute("nonexistent.thing").await.unwrap_err();
    assert_eq!(err.kind(), "Dispatch");

    let snapshot = agent.telemetry().snapshot();
    assert_eq!(snapshot.commands_executed, 1);
    assert_eq!(snapshot.failed_executions, 1);
}

/// The literal undotted case: no module prefix at all, and not a member
/// of the finite builtin set either. Must fall through to `UnknownModule`
/// rather than being treated as an unhandled built-in.
#[tokio::test]
async fn unrecognized_undotted_command_without_nlp_fallback_is_reported_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.shell.use_nlp = false;
    let agent = Agent::new(config, no_modules_builder(), None, StatePaths::under(dir.path()));
    agent.initialize_all().await.unwrap();

    let err = agent.execute("please do something").await.unwrap_err();
    assert_eq!(err.kind(), "Dispatch");

    let snapshot = agent.telemetry().snapshot();
    assert_eq!(snapshot.commands_executed, 1);
    assert_eq!(snapshot.failed_executions, 1);
}

/// An unrecognized head with no prefix-matching suggestion, NL fallback
/// enabled, and a generator present: the mock rewrites it to a known
/// `module.action` command, and that rewrite is dispatched for real.
#[tokio::test]
async fn unknown_module_with_nlp_fallback_rewrites_and_dispatches_via_generator() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.shell.use_nlp = true;
    let generator = Arc::new(MockTextGenerator::new("adder.sum --a=4 --b=5"));
    let agent = Agent::new(config, no_modules_builder(), Some(generator), StatePaths::under(dir.path()));
    agent.module_manager().register(Arc::new(Adder)).await.unwrap();
    agent.initialize_all().await.unwrap();

    let result = agent.execute("please add four and five").await.unwrap();
    match result {
        Dispatched::Called(value) => assert_eq!(value, json!(9)),
        Dispatched::BuiltIn { .. } => panic!("expected a module call"),
    }

    let snapshot = agent.telemetry().snapshot();
    assert_eq!(snapshot.commands_executed, 1);
    assert_eq!(snapshot.successful_executions, 1);
}

/// Same setup, but the generator's rewrite is itself unrecognized: the
/// one-shot re-dispatch must fail terminally rather than looping.
#[tokio::test]
async fn unknown_module_with_nlp_fallback_reports_unknown_when_rewrite_is_unusable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.shell.use_nlp = true;
    let generator = Arc::new(MockTextGenerator::new("still garbage"));
    let agent = Agent::new(config, no_modules_builder(), Some(generator), StatePaths::under(dir.path()));
    agent.initialize_all().await.unwrap();

    let err = agent.execute("please do something").await.unwrap_err();
    assert_eq!(err.kind(), "Dispatch");

    let snapshot = agent.telemetry().snapshot();
    assert_eq!(snapshot.failed_executions, 1);
}

#[tokio::test]
async fn repeated_failures_raise_the_failure_rate_the_evolution_engine_would_see() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.evolution.min_commands_for_failure_check = 3;
    config.evolution.failure_rate_threshold = 0.3;
    let agent = Agent::new(config, no_modules_builder(), None, StatePaths::under(dir.path()));
    agent.module_manager().register(Arc::new(Flaky)).await.unwrap();
    agent.initialize_all().await.unwrap();

    for _ in 0..4 {
        let _ = agent.execute("flaky.boom").await;
    }

    let snapshot = agent.telemetry().snapshot();
    assert_eq!(snapshot.failed_executions, 4);
    assert!(snapshot.failed_executions as f64 / snapshot.commands_executed as f64 > 0.3);
}

#[tokio::test]
async fn forced_evolution_runs_even_when_disabled_in_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.evolution.enabled = false;
    let agent = Agent::new(config, no_modules_builder(), None, StatePaths::under(dir.path()));
    agent.initialize_all().await.unwrap();

    let cycle = agent.evolve(true).await;
    assert_eq!(cycle.status, ellma_core::evolution::CycleStatus::Success);
    assert_eq!(agent.evolution_history().await.len(), 1);
}

#[tokio::test]
async fn disabled_evolution_without_force_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.evolution.enabled = false;
    let agent = Agent::new(config, no_modules_builder(), None, StatePaths::under(dir.path()));
    agent.initialize_all().await.unwrap();

    let cycle = agent.evolve(false).await;
    assert_eq!(cycle.status, ellma_core::evolution::CycleStatus::Disabled);
}

#[tokio::test]
async fn save_state_then_restart_restores_telemetry_aggregate() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StatePaths::under(dir.path());
    {
        let agent = Agent::new(Config::default(), no_modules_builder(), None, StatePaths::under(dir.path()));
        agent.module_manager().register(Arc::new(Adder)).await.unwrap();
        agent.initialize_all().await.unwrap();
        agent.execute("adder.sum --a=1 --b=1").await.unwrap();
        agent.save_state().await.unwrap();
    }

    let restarted = Agent::new(Config::default(), no_modules_builder(), None, paths);
    let snapshot = restarted.telemetry().snapshot();
    assert_eq!(snapshot.commands_executed, 1);
    assert_eq!(snapshot.successful_executions, 1);
}

#[tokio::test]
async fn status_reports_loaded_module_count() {
    let dir = tempfile::tempdir().unwrap();
    let agent = Agent::new(
        Config::default(),
        no_modules_builder(),
        None,
        StatePaths::under(dir.path()),
    );
    agent.module_manager().register(Arc::new(Adder)).await.unwrap();
    agent.initialize_all().await.unwrap();

    let health = agent.status().await;
    assert_eq!(health.total, 1);
    assert_eq!(health.loaded, 1);
}
