//! `Agent` — the top-level orchestrator: owns the module registry, the
//! telemetry store, the dispatcher, and the evolution engine, and wires
//! automatic evolution triggers into every executed command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::config::Config;
use crate::dispatcher::{CommandDispatcher, Dispatched};
use crate::error::AgentError;
use crate::event_bus::EventBus;
use crate::evolution::{EvolutionCycle, EvolutionEngine};
use crate::generator::{GenerateOptions, TextGenerator};
use crate::module::{ModuleBuilder, ModuleLoader, ModuleManager, SystemHealth};
use crate::persistence::write_bytes_atomic;
use crate::telemetry::{CompletedTask, ResourceSnapshot, TelemetryStore};

/// Where an `Agent`'s mutable state lives on disk, relative to some data
/// directory the caller owns.
pub struct StatePaths {
    pub config: PathBuf,
    pub metrics: PathBuf,
    pub history: PathBuf,
    pub evolution_history: PathBuf,
    pub generated_modules: PathBuf,
}

impl StatePaths {
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            config: dir.join("config.yaml"),
            metrics: dir.join("metrics.json"),
            history: dir.join("history.json"),
            evolution_history: dir.join("evolution_history.json"),
            generated_modules: dir.join("generated"),
        }
    }
}

pub struct Agent {
    manager: Arc<ModuleManager>,
    telemetry: Arc<TelemetryStore>,
    dispatcher: CommandDispatcher,
    evolution: Arc<EvolutionEngine>,
    event_bus: Arc<EventBus>,
    generator: Option<Arc<dyn TextGenerator>>,
    config: tokio::sync::RwLock<Config>,
    paths: StatePaths,
}

impl Agent {
    /// Assembles an `Agent` from its collaborators. Telemetry's aggregate
    /// counters are restored from `paths` if present; a missing file is
    /// "no prior state", not an error.
    pub fn new(
        config: Config,
        module_builder: Arc<dyn ModuleBuilder>,
        generator: Option<Arc<dyn TextGenerator>>,
        paths: StatePaths,
    ) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::new());
        let manager = ModuleManager::new(event_bus.clone());
        let loader = Arc::new(ModuleLoader::new(
            module_builder,
            paths.generated_modules.clone(),
        ));

        let telemetry = Arc::new(
            TelemetryStore::load_aggregate(&paths.metrics)
                .map(TelemetryStore::from_aggregate)
                .unwrap_or_default(),
        );

        let evolution = Arc::new(EvolutionEngine::new(
            telemetry.clone(),
            manager.clone(),
            loader,
            generator.clone(),
            event_bus.clone(),
            config.evolution.clone(),
            paths.evolution_history.clone(),
            paths.generated_modules.clone(),
        ));

        let dispatcher = CommandDispatcher::new(manager.clone(), generator.clone());

        Arc::new(Self {
            manager,
            telemetry,
            dispatcher,
            evolution,
            event_bus,
            generator,
            config: tokio::sync::RwLock::new(config),
            paths,
        })
    }

    pub fn module_manager(&self) -> &Arc<ModuleManager> {
        &self.manager
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Brings every registered module up in dependency order. Call after
    /// registering whatever built-in modules the host wants before the
    /// first command.
    pub async fn initialize_all(&self) -> Result<Vec<String>, AgentError> {
        self.manager.initialize_all().await
    }

    /// Executes one command line: dispatches it, records the outcome in
    /// telemetry, and fires an automatic evolution cycle if the trigger
    /// condition is met. A built-in (non `module.action`) command is
    /// returned to the caller unexecuted — the agent core has no shell
    /// of its own.
    pub async fn execute(&self, line: &str) -> Result<Dispatched, AgentError> {
        let config = self.config.read().await.clone();
        let start = Instant::now();
        let result = self.dispatcher.dispatch(line, &config).await;
        let elapsed = start.elapsed().as_nanos() as u64;

        let (success, recorded_result) = match &result {
            Ok(Dispatched::Called(value)) => (true, Some(value.clone())),
            Ok(Dispatched::BuiltIn { .. }) => (true, None),
            Err(err) => (false, Some(Value::from(err.to_string()))),
        };
        self.telemetry.record(CompletedTask {
            command: line.to_string(),
            args: Vec::new(),
            kwargs: Default::default(),
            result: recorded_result,
            duration_nanos: elapsed,
            success,
            snapshot: ResourceSnapshot::default(),
        });

        if self.evolution.should_trigger().await {
            let evolution = self.evolution.clone();
            tokio::spawn(async move {
                evolution.run(false).await;
            });
        }

        result
    }

    /// Direct access to the loaded text generator, bypassing the
    /// dispatcher — used for free-form prompts rather than commands.
    pub async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<String, AgentError> {
        let generator = self.generator.clone().ok_or(AgentError::ModelNotLoaded)?;
        Ok(generator.generate(prompt, opts).await?)
    }

    /// Runs one evolution cycle on demand.
    pub async fn evolve(&self, force: bool) -> EvolutionCycle {
        self.evolution.run(force).await
    }

    pub async fn evolution_history(&self) -> Vec<EvolutionCycle> {
        self.evolution.history().await
    }

    pub async fn status(&self) -> SystemHealth {
        self.manager.system_health().await
    }

    /// Persists telemetry and config to `paths`. Evolution history is
    /// persisted incrementally by the engine itself after every cycle.
    pub async fn save_state(&self) -> Result<(), AgentError> {
        self.telemetry.persist(&self.paths.metrics, &self.paths.history)?;
        let config = self.config.read().await;
        let yaml = config.to_yaml()?;
        write_bytes_atomic(&self.paths.config, yaml.as_bytes())?;
        Ok(())
    }

    /// Shuts every module down in reverse dependency order and persists
    /// state. Errors from individual module shutdowns are reported but do
    /// not stop the remaining teardown.
    pub async fn close(&self) -> Result<(), AgentError> {
        let shutdown_result = self.manager.shutdown_all().await;
        self.save_state().await?;
        shutdown_result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::capability::Capability;
    use crate::module::context::ModuleContext;
    use crate::module::loader::InProcessModuleBuilder;
    use crate::module::module_trait::Module;
    use crate::module::CallArgs;
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
            _action: &str,
            args: CallArgs,
            _ctx: Arc<ModuleContext>,
        ) -> Result<Value, AgentError> {
            Ok(args.get("msg", 0).cloned().unwrap_or(Value::Null))
        }
    }

    fn test_agent(dir: &tempfile::TempDir) -> Arc<Agent> {
        let builder: Arc<dyn ModuleBuilder> =
            Arc::new(InProcessModuleBuilder(|_: &str| -> Arc<dyn Module> { Arc::new(Echo) }));
        Agent::new(Config::default(), builder, None, StatePaths::under(dir.path()))
    }

    #[tokio::test]
    async fn execute_dispatches_and_records_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(&dir);
        agent.module_manager().register(Arc::new(Echo)).await.unwrap();
        agent.initialize_all().await.unwrap();

        let dispatched = agent.execute("echo.say hello").await.unwrap();
        match dispatched {
            Dispatched::Called(value) => assert_eq!(value, Value::from("hello")),
            Dispatched::BuiltIn { .. } => panic!("expected a module call"),
        }

        let snapshot = agent.telemetry().snapshot();
        assert_eq!(snapshot.commands_executed, 1);
        assert_eq!(snapshot.successful_executions, 1);
    }

    #[tokio::test]
    async fn unknown_module_without_generator_is_reported_and_recorded_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(&dir);
        agent.initialize_all().await.unwrap();

        let err = agent.execute("missing.action").await.unwrap_err();
        assert_eq!(err.kind(), "Dispatch");

        let snapshot = agent.telemetry().snapshot();
        assert_eq!(snapshot.failed_executions, 1);
    }

    #[tokio::test]
    async fn builtin_command_is_returned_unexecuted() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(&dir);
        agent.initialize_all().await.unwrap();

        let dispatched = agent.execute("status --verbose").await.unwrap();
        match dispatched {
            Dispatched::BuiltIn { command, .. } => assert_eq!(command, "status"),
            Dispatched::Called(_) => panic!("expected a built-in"),
        }
    }

    #[tokio::test]
    async fn generate_without_a_loaded_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(&dir);
        let err = agent
            .generate("hello", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ModelNotLoaded");
    }
}
