//! `EvolutionEngine` — the six-phase Analyse → Identify → Generate → Test
//! → Integrate → Learn pipeline. At most one cycle runs at a time, guarded
//! by `is_evolving`; the engine never raises to its caller, it always
//! returns a cycle record whose `status` distinguishes the outcome.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use sysinfo::{Disks, System};
use tokio::sync::{Mutex, RwLock};

use crate::config::EvolutionConfig;
use crate::event_bus::EventBus;
use crate::generator::{GenerateOptions, TextGenerator};
use crate::module::{ModuleLoader, ModuleManager};
use crate::persistence::{backup_before_overwrite, write_json_atomic};
use crate::telemetry::TelemetryStore;

use super::templates::{arg_validator_source, retry_wrapper_source, ttl_cache_source};
use super::types::{
    Analysis, CycleStatus, EvolutionCycle, FailureCluster, Integration, Opportunity,
    Priority, ResourceUsage, Solution, TestStatus,
};

const HIGH_FAILURE_RATE_THRESHOLD: f64 = 0.1;
const PROBLEMATIC_SUCCESS_RATE: f64 = 0.8;
const PROBLEMATIC_DURATION_NANOS: u64 = 5_000_000_000;
const HIGH_MEMORY_PERCENT: f32 = 80.0;
const MAX_FAILURE_EXCERPTS: usize = 5;
const MIN_DISK_MB: u64 = 2 * 1024;

fn unix_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

/// Resets `is_evolving` when a cycle finishes, on every exit path
/// including an early return.
struct EvolvingGuard<'a>(&'a AtomicBool);

impl Drop for EvolvingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct EvolutionEngine {
    telemetry: Arc<TelemetryStore>,
    manager: Arc<ModuleManager>,
    loader: Arc<ModuleLoader>,
    generator: Option<Arc<dyn TextGenerator>>,
    event_bus: Arc<EventBus>,
    config: RwLock<EvolutionConfig>,
    learning_rate: Mutex<f64>,
    is_evolving: AtomicBool,
    history: Mutex<Vec<EvolutionCycle>>,
    history_path: PathBuf,
    generated_dir: PathBuf,
}

impl EvolutionEngine {
    pub fn new(
        telemetry: Arc<TelemetryStore>,
        manager: Arc<ModuleManager>,
        loader: Arc<ModuleLoader>,
        generator: Option<Arc<dyn TextGenerator>>,
        event_bus: Arc<EventBus>,
        config: EvolutionConfig,
        history_path: PathBuf,
        generated_dir: PathBuf,
    ) -> Self {
        let learning_rate = config.learning_rate;
        let history = Self::load_history(&history_path).unwrap_or_default();
        Self {
            telemetry,
            manager,
            loader,
            generator,
            event_bus,
            config: RwLock::new(config),
            learning_rate: Mutex::new(learning_rate),
            is_evolving: AtomicBool::new(false),
            history: Mutex::new(history),
            history_path,
            generated_dir,
        }
    }

    fn load_history(path: &PathBuf) -> Option<Vec<EvolutionCycle>> {
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub async fn set_config(&self, config: EvolutionConfig) {
        *self.config.write().await = config;
    }

    pub async fn history(&self) -> Vec<EvolutionCycle> {
        self.history.lock().await.clone()
    }

    /// Whether an automatic trigger fires right now, given the current
    /// telemetry snapshot: either the command-count interval is hit, or
    /// the failure rate exceeds its threshold once enough commands ran.
    pub async fn should_trigger(&self) -> bool {
        let config = self.config.read().await;
        if !config.auto_improve {
            return false;
        }
        let aggregate = self.telemetry.snapshot();
        let commands = aggregate.commands_executed;

        let interval_hit =
            commands > 0 && config.evolution_interval > 0 && commands % config.evolution_interval as u64 == 0;

        let failure_rate = if commands == 0 {
            0.0
        } else {
            aggregate.failed_executions as f64 / commands as f64
        };
        let failure_hit = commands >= config.min_commands_for_failure_check as u64
            && failure_rate > config.failure_rate_threshold;

        interval_hit || failure_hit
    }

    /// Runs one cycle. `force` bypasses the `enabled`/resource-constrained
    /// preconditions but never the single-flight guard.
    pub async fn run(&self, force: bool) -> EvolutionCycle {
        let config = self.config.read().await.clone();

        if !config.enabled && !force {
            return EvolutionCycle {
                status: CycleStatus::Disabled,
                ..EvolutionCycle::started(uuid::Uuid::new_v4().to_string(), unix_nanos())
            };
        }

        if self
            .is_evolving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return EvolutionCycle {
                status: CycleStatus::Busy,
                ..EvolutionCycle::started(uuid::Uuid::new_v4().to_string(), unix_nanos())
            };
        }
        let _guard = EvolvingGuard(&self.is_evolving);

        let mut cycle = EvolutionCycle::started(uuid::Uuid::new_v4().to_string(), unix_nanos());

        let resources = self.sample_resources();
        let resource_constrained = resources.available_memory_mb < config.min_memory_mb as u64
            || resources.available_disk_mb < MIN_DISK_MB;
        if !force && resource_constrained {
            cycle.finish(CycleStatus::ResourceConstrained, unix_nanos());
            tracing::info!(
                cycle_id = %cycle.id,
                started_at = %cycle.started_at_rfc3339(),
                "evolution cycle skipped: resource constrained"
            );
            self.event_bus.emit("evolution_cycle_finished", json!({ "status": "resource_constrained" }));
            self.append_history(cycle.clone()).await;
            return cycle;
        }

        let analysis = self.analyse(resources).await;
        cycle.opportunities = self.identify(&analysis).await;
        cycle.solutions = self.generate(&cycle.opportunities).await;
        self.test(&mut cycle.solutions);
        cycle.integrations = self.integrate(&cycle.solutions, &config).await;
        self.learn(&mut cycle).await;
        cycle.analysis = Some(analysis);

        cycle.finish(CycleStatus::Success, unix_nanos());
        self.telemetry.record_evolution_cycle();
        let modules_created = cycle.integrations.iter().filter(|i| i.succeeded).count() as u64;
        if modules_created > 0 {
            self.telemetry.record_modules_created(modules_created);
        }
        tracing::info!(
            cycle_id = %cycle.id,
            started_at = %cycle.started_at_rfc3339(),
            finished_at = %cycle.finished_at_rfc3339().unwrap_or_default(),
            modules_created,
            "evolution cycle finished"
        );
        self.event_bus.emit("evolution_cycle_finished", json!({ "status": "success" }));
        self.append_history(cycle.clone()).await;
        cycle
    }

    fn sample_resources(&self) -> ResourceUsage {
        let mut system = System::new();
        system.refresh_memory();
        let total_kb = system.total_memory();
        let available_kb = system.available_memory();
        let memory_percent = if total_kb == 0 {
            0.0
        } else {
            100.0 * (1.0 - available_kb as f32 / total_kb as f32)
        };

        let disks = Disks::new_with_refreshed_list();
        let available_disk_mb = disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| disks.iter().next())
            .map(|disk| disk.available_space() / 1024 / 1024)
            .unwrap_or(u64::MAX);

        ResourceUsage {
            memory_percent,
            available_memory_mb: available_kb / 1024,
            available_disk_mb,
            cpu_percent: 0.0,
        }
    }

    async fn analyse(&self, resources: ResourceUsage) -> Analysis {
        let aggregate = self.telemetry.snapshot();
        let commands = aggregate.commands_executed;
        let success_rate = if commands == 0 {
            1.0
        } else {
            aggregate.successful_executions as f64 / commands as f64
        };
        let failure_rate = if commands == 0 { 0.0 } else { 1.0 - success_rate };
        let avg_duration_nanos = if commands == 0 {
            0
        } else {
            aggregate.total_execution_nanos / commands
        };

        let problematic_commands: Vec<String> = aggregate
            .per_command
            .iter()
            .filter(|(_, agg)| {
                let total = agg.success + agg.fail;
                if total == 0 {
                    return false;
                }
                let rate = agg.success as f64 / total as f64;
                let avg_nanos = agg.total_nanos / total;
                rate < PROBLEMATIC_SUCCESS_RATE || avg_nanos > PROBLEMATIC_DURATION_NANOS
            })
            .map(|(command, _)| command.clone())
            .collect();

        let failure_clusters = self.failure_clusters().await;

        Analysis {
            success_rate,
            failure_rate,
            avg_duration_nanos,
            per_command: aggregate.per_command,
            problematic_commands,
            resource_usage: resources,
            failure_clusters,
        }
    }

    async fn failure_clusters(&self) -> Vec<FailureCluster> {
        use std::collections::HashMap;
        let mut clusters: HashMap<String, FailureCluster> = HashMap::new();
        for record in self.telemetry.history(1_000) {
            if record.success {
                continue;
            }
            let cluster = clusters.entry(record.command.clone()).or_insert_with(|| FailureCluster {
                command: record.command.clone(),
                count: 0,
                excerpts: Vec::new(),
            });
            cluster.count += 1;
            if cluster.excerpts.len() < MAX_FAILURE_EXCERPTS {
                cluster.excerpts.push(record.truncated_result.clone());
            }
        }
        let mut clusters: Vec<FailureCluster> = clusters.into_values().collect();
        clusters.sort_by(|a, b| b.count.cmp(&a.count).then(a.command.cmp(&b.command)));
        clusters
    }

    async fn identify(&self, analysis: &Analysis) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();
        let now = unix_nanos();

        if analysis.failure_rate > HIGH_FAILURE_RATE_THRESHOLD {
            opportunities.push(Opportunity {
                id: uuid::Uuid::new_v4().to_string(),
                kind: "HighFailureRate".to_string(),
                category: "reliability".to_string(),
                priority: Priority::High,
                description: format!("overall failure rate {:.1}% exceeds threshold", analysis.failure_rate * 100.0),
                metrics: Some(json!({ "failureRate": analysis.failure_rate })),
                suggested_actions: vec!["improve_error_handling".to_string()],
                impact: "high".to_string(),
                effort: "medium".to_string(),
                created_at_unix_nanos: now,
            });
        }

        for command in &analysis.problematic_commands {
            let module = command.split('.').next().unwrap_or(command.as_str());
            if self.manager.get(module).await.is_none() {
                opportunities.push(Opportunity {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: "MissingCapability".to_string(),
                    category: "coverage".to_string(),
                    priority: Priority::Medium,
                    description: format!("{command} is invoked but module {module} is not registered"),
                    metrics: None,
                    suggested_actions: vec![format!("create_new_modules {module}")],
                    impact: "medium".to_string(),
                    effort: "high".to_string(),
                    created_at_unix_nanos: now,
                });
            } else {
                opportunities.push(Opportunity {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: "SlowOrFlakyCommand".to_string(),
                    category: "performance".to_string(),
                    priority: Priority::Medium,
                    description: format!("{command} is slow or frequently fails"),
                    metrics: None,
                    suggested_actions: vec![format!("fix_{}_command", command.replace('.', "_"))],
                    impact: "medium".to_string(),
                    effort: "low".to_string(),
                    created_at_unix_nanos: now,
                });
            }
        }

        if analysis.resource_usage.memory_percent > HIGH_MEMORY_PERCENT {
            opportunities.push(Opportunity {
                id: uuid::Uuid::new_v4().to_string(),
                kind: "HighMemory".to_string(),
                category: "resources".to_string(),
                priority: Priority::Medium,
                description: format!("memory usage at {:.1}%", analysis.resource_usage.memory_percent),
                metrics: Some(json!({ "memoryPercent": analysis.resource_usage.memory_percent })),
                suggested_actions: vec!["optimize_execution".to_string()],
                impact: "medium".to_string(),
                effort: "medium".to_string(),
                created_at_unix_nanos: now,
            });
        }

        if let Some(generator) = &self.generator {
            if let Some(extra) = self.ask_generator_for_opportunities(generator.as_ref(), analysis).await {
                opportunities.extend(extra);
            }
        }

        opportunities.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.created_at_unix_nanos.cmp(&a.created_at_unix_nanos))
        });
        opportunities
    }

    /// Prompts the generator with the analysis as a JSON envelope and
    /// merges its reply, a JSON array of opportunity-shaped objects,
    /// tolerating partial or total failure silently.
    async fn ask_generator_for_opportunities(
        &self,
        generator: &dyn TextGenerator,
        analysis: &Analysis,
    ) -> Option<Vec<Opportunity>> {
        let envelope = serde_json::to_string(analysis).ok()?;
        let prompt = format!(
            "Given this telemetry analysis, suggest additional improvement opportunities as a \
             JSON array of objects with fields type, category, priority (low|medium|high), \
             description, suggestedActions (array of strings), impact, effort:\n{envelope}"
        );
        let reply = generator.generate(&prompt, &GenerateOptions::default()).await.ok()?;
        let raw: Vec<Value> = serde_json::from_str(&reply).ok()?;

        let now = unix_nanos();
        let opportunities = raw
            .into_iter()
            .filter_map(|entry| {
                let kind = entry.get("type")?.as_str()?.to_string();
                let description = entry.get("description")?.as_str()?.to_string();
                let priority = match entry.get("priority").and_then(Value::as_str) {
                    Some("high") => Priority::High,
                    Some("low") => Priority::Low,
                    _ => Priority::Medium,
                };
                let suggested_actions = entry
                    .get("suggestedActions")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                Some(Opportunity {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind,
                    category: entry.get("category").and_then(Value::as_str).unwrap_or("generated").to_string(),
                    priority,
                    description,
                    metrics: None,
                    suggested_actions,
                    impact: entry.get("impact").and_then(Value::as_str).unwrap_or("unknown").to_string(),
                    effort: entry.get("effort").and_then(Value::as_str).unwrap_or("unknown").to_string(),
                    created_at_unix_nanos: now,
                })
            })
            .collect();
        Some(opportunities)
    }

    /// Strategy matrix: dispatches each opportunity's first suggested
    /// action to a fixed template or, for anything a template doesn't
    /// cover, the generator.
    async fn generate(&self, opportunities: &[Opportunity]) -> Vec<Solution> {
        let mut solutions = Vec::new();
        for opportunity in opportunities {
            let action = opportunity
                .suggested_actions
                .first()
                .cloned()
                .unwrap_or_else(|| opportunity.kind.clone());
            let timestamp = unix_nanos();
            let slug = action
                .split_whitespace()
                .next()
                .unwrap_or("opportunity")
                .replace(|c: char| !c.is_ascii_alphanumeric(), "_");
            let module_name = format!("{slug}_{timestamp}");

            let solution = if action.starts_with("create_new_modules") {
                self.generate_new_module(opportunity, &module_name, &action).await
            } else if action.starts_with("improve_error_handling") {
                Some(self.fixed_solution(opportunity, &module_name, "improve_error_handling", retry_wrapper_source(&module_name, &action)))
            } else if action.starts_with("optimize_execution") {
                Some(self.fixed_solution(opportunity, &module_name, "optimize_execution", ttl_cache_source(&module_name, &action)))
            } else if action.starts_with("fix_") && action.ends_with("_command") {
                Some(self.fixed_solution(opportunity, &module_name, "fix_command", arg_validator_source(&module_name, &action)))
            } else {
                self.generate_generic_fragment(opportunity, &module_name, &action).await
            };

            if let Some(solution) = solution {
                solutions.push(solution);
            }
        }
        solutions
    }

    fn fixed_solution(&self, opportunity: &Opportunity, module_name: &str, kind: &str, source_code: String) -> Solution {
        Solution {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity_id: opportunity.id.clone(),
            kind: kind.to_string(),
            description: opportunity.description.clone(),
            module_name: module_name.to_string(),
            source_code,
            priority: opportunity.priority,
            test_status: TestStatus::Unvalidated,
            test_message: None,
        }
    }

    async fn generate_new_module(&self, opportunity: &Opportunity, module_name: &str, action: &str) -> Option<Solution> {
        let generator = self.generator.as_ref()?;
        let prompt = format!(
            "Write a complete Rust module named `{module_name}` addressing: {action}. \
             Use only the standard library and serde/serde_json, no `unsafe` blocks. \
             The module must export `#[no_mangle] pub unsafe extern \"C\" fn \
             ellma_module_vtable() -> *const ModuleVTable`, a `#[repr(C)]` struct with \
             `name`, `capabilities_json`, `call`, and `free_string` function-pointer \
             fields of type `unsafe extern \"C\" fn`, each operating on nul-terminated \
             C strings and JSON payloads — this is the only symbol the loader binds."
        );
        let source_code = generator.generate(&prompt, &GenerateOptions::default()).await.ok()?;
        Some(self.fixed_solution(opportunity, module_name, "create_new_modules", source_code))
    }

    async fn generate_generic_fragment(&self, opportunity: &Opportunity, module_name: &str, action: &str) -> Option<Solution> {
        let generator = self.generator.as_ref()?;
        let prompt = format!(
            "Write a small Rust source fragment for module `{module_name}` implementing: {action}"
        );
        let source_code = generator.generate(&prompt, &GenerateOptions::default()).await.ok()?;
        Some(self.fixed_solution(opportunity, module_name, "generic", source_code))
    }

    /// Static validation only: a syntactic parse of `source_code`. Empty
    /// source is an error, not merely invalid.
    fn test(&self, solutions: &mut [Solution]) {
        for solution in solutions.iter_mut() {
            if solution.source_code.trim().is_empty() {
                solution.test_status = TestStatus::Error;
                solution.test_message = Some("generator returned empty source".to_string());
                continue;
            }
            match syn::parse_file(&solution.source_code) {
                Ok(_) => solution.test_status = TestStatus::Validated,
                Err(e) => {
                    solution.test_status = TestStatus::Invalid;
                    solution.test_message = Some(e.to_string());
                }
            }
        }
    }

    async fn integrate(&self, solutions: &[Solution], config: &EvolutionConfig) -> Vec<Integration> {
        let mut integrations = Vec::new();
        for solution in solutions {
            if solution.test_status != TestStatus::Validated {
                continue;
            }

            let registered = self.manager.list().await.len() as u32;
            if registered >= config.max_modules {
                integrations.push(Integration {
                    module_name: solution.module_name.clone(),
                    succeeded: false,
                    message: Some("max_modules cap reached".to_string()),
                });
                continue;
            }

            integrations.push(self.integrate_one(solution).await);
        }
        integrations
    }

    async fn integrate_one(&self, solution: &Solution) -> Integration {
        let path = self.generated_dir.join(format!("{}.rs", solution.module_name));
        if let Err(e) = write_json_atomic_text(&path, &solution.source_code) {
            return Integration {
                module_name: solution.module_name.clone(),
                succeeded: false,
                message: Some(format!("failed to persist source: {e}")),
            };
        }

        let mtime = SystemTime::now();
        let module = match self.loader.load(&solution.module_name, &path, &solution.source_code, mtime).await {
            Ok(Some(module)) => module,
            Ok(None) => {
                return Integration {
                    module_name: solution.module_name.clone(),
                    succeeded: true,
                    message: Some("unchanged source, reused cached instance".to_string()),
                }
            }
            Err(e) => {
                return Integration {
                    module_name: solution.module_name.clone(),
                    succeeded: false,
                    message: Some(e.to_string()),
                }
            }
        };

        if let Err(e) = self.manager.register_with_source(module, Some(path), Some(mtime)).await {
            return Integration {
                module_name: solution.module_name.clone(),
                succeeded: false,
                message: Some(e.to_string()),
            };
        }
        if let Err(e) = self.manager.initialize(&solution.module_name).await {
            return Integration {
                module_name: solution.module_name.clone(),
                succeeded: false,
                message: Some(e.to_string()),
            };
        }

        Integration {
            module_name: solution.module_name.clone(),
            succeeded: true,
            message: None,
        }
    }

    async fn learn(&self, cycle: &mut EvolutionCycle) {
        let any_succeeded = cycle.integrations.iter().any(|i| i.succeeded);
        if any_succeeded {
            let mut rate = self.learning_rate.lock().await;
            *rate = (*rate * 1.1).min(1.0);
            cycle.learning_summary = Some(format!("learning_rate raised to {:.4}", *rate));
        } else {
            cycle.learning_summary = Some("no successful integrations this cycle".to_string());
        }
    }

    async fn append_history(&self, cycle: EvolutionCycle) {
        let mut history = self.history.lock().await;
        let _ = backup_before_overwrite(&self.history_path, unix_nanos() as u64 / 1_000_000_000);
        history.push(cycle);
        if write_json_atomic(&self.history_path, &*history).is_err() {
            tracing::warn!("failed to persist evolution history");
        }
    }
}

fn write_json_atomic_text(path: &std::path::Path, text: &str) -> std::io::Result<()> {
    crate::persistence::write_bytes_atomic(path, text.as_bytes())
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
            _args: CallArgs,
            _ctx: Arc<ModuleContext>,
        ) -> Result<Value, crate::error::AgentError> {
            Ok(Value::from("hi"))
        }
    }

    fn test_engine() -> (Arc<TelemetryStore>, Arc<ModuleManager>, EvolutionEngine) {
        let telemetry = Arc::new(TelemetryStore::new());
        let event_bus = Arc::new(EventBus::new());
        let manager = ModuleManager::new(event_bus.clone());
        let builder = InProcessModuleBuilder(|name: &str| -> Arc<dyn Module> { Arc::new(NamedStub(name.to_string())) });
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(ModuleLoader::new(Arc::new(builder), dir.path().join("work")));
        let engine = EvolutionEngine::new(
            telemetry.clone(),
            manager.clone(),
            loader,
            None,
            event_bus,
            EvolutionConfig::default(),
            dir.path().join("evolution_history.json"),
            dir.path().join("generated"),
        );
        (telemetry, manager, engine)
    }

    struct NamedStub(String);

    #[async_trait]
    impl Module for NamedStub {
        fn name(&self) -> &str {
            &self.0
        }
        fn capabilities(&self) -> Vec<Capability> {
            Vec::new()
        }
        async fn call(
            &self,
            _action: &str,
            _args: CallArgs,
            _ctx: Arc<ModuleContext>,
        ) -> Result<Value, crate::error::AgentError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn disabled_config_short_circuits_to_disabled_status() {
        let (_, _, engine) = test_engine();
        engine
            .set_config(EvolutionConfig {
                enabled: false,
                ..EvolutionConfig::default()
            })
            .await;
        let cycle = engine.run(false).await;
        assert_eq!(cycle.status, CycleStatus::Disabled);
    }

    #[tokio::test]
    async fn forced_run_bypasses_disabled_precondition() {
        let (_, _, engine) = test_engine();
        engine
            .set_config(EvolutionConfig {
                enabled: false,
                ..EvolutionConfig::default()
            })
            .await;
        let cycle = engine.run(true).await;
        assert_ne!(cycle.status, CycleStatus::Disabled);
    }

    #[tokio::test]
    async fn concurrent_run_returns_busy() {
        let (_, _, engine) = test_engine();
        let engine = Arc::new(engine);
        let guard = EvolvingGuard(&engine.is_evolving);
        engine.is_evolving.store(true, Ordering::SeqCst);

        let cycle = engine.run(true).await;
        assert_eq!(cycle.status, CycleStatus::Busy);
        drop(guard);
    }

    #[tokio::test]
    async fn every_run_appends_exactly_one_history_entry() {
        let (_, _, engine) = test_engine();
        assert_eq!(engine.history().await.len(), 0);
        engine.run(true).await;
        assert_eq!(engine.history().await.len(), 1);
        engine.run(true).await;
        assert_eq!(engine.history().await.len(), 2);
    }

    #[tokio::test]
    async fn high_failure_rate_produces_an_opportunity_and_a_retry_wrapper_solution() {
        let (telemetry, manager, engine) = test_engine();
        manager.register(Arc::new(Echo)).await.unwrap();
        manager.initialize("echo").await.unwrap();

        for _ in 0..2 {
            telemetry.record(crate::telemetry::CompletedTask {
                command: "echo.say".to_string(),
                args: Vec::new(),
                kwargs: Default::default(),
                result: None,
                duration_nanos: 10,
                success: false,
                snapshot: Default::default(),
            });
        }

        let cycle = engine.run(true).await;
        assert!(cycle.opportunities.iter().any(|o| o.kind == "HighFailureRate"));
        assert!(cycle
            .solutions
            .iter()
            .any(|s| s.kind == "improve_error_handling" && s.test_status == TestStatus::Validated));
    }
}
