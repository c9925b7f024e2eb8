//! Typed configuration: every known key gets a field with a documented
//! default; anything else round-trips through a side table instead of
//! being rejected (see DESIGN.md, Open Question 1).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub enabled: bool,
    pub auto_improve: bool,
    pub evolution_interval: u32,
    pub max_modules: u32,
    pub backup_before_evolution: bool,
    pub learning_rate: f64,
    /// Unused by any phase today; preserved as a forward-compatible knob.
    pub exploration_rate: f64,
    pub max_depth: u32,
    pub max_iterations: u32,
    pub max_memory_mb: u32,
    pub max_runtime_minutes: u32,
    pub cpu_threads: u32,
    pub enable_parallel: bool,
    pub enable_rollback: bool,
    pub enable_benchmark: bool,
    pub allow_new_modules: bool,
    pub allow_module_removal: bool,
    pub min_module_usage: u32,
    pub target_success_rate: f64,
    pub target_execution_time: f64,
    pub min_improvement: f64,
    pub min_memory_mb: u32,
    /// Not in the enumerated config-key list but needed by the automatic
    /// evolution trigger; defaults match its documented values.
    pub failure_rate_threshold: f64,
    pub min_commands_for_failure_check: u32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_improve: true,
            evolution_interval: 50,
            max_modules: 100,
            backup_before_evolution: true,
            learning_rate: 0.1,
            exploration_rate: 0.2,
            max_depth: 5,
            max_iterations: 100,
            max_memory_mb: 4096,
            max_runtime_minutes: 30,
            cpu_threads: 0,
            enable_parallel: false,
            enable_rollback: true,
            enable_benchmark: false,
            allow_new_modules: true,
            allow_module_removal: false,
            min_module_usage: 5,
            target_success_rate: 0.95,
            target_execution_time: 1.0,
            min_improvement: 0.01,
            min_memory_mb: 1024,
            failure_rate_threshold: 0.2,
            min_commands_for_failure_check: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub use_nlp: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self { use_nlp: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub evolution: EvolutionConfig,
    pub shell: ShellConfig,
    /// Keys this struct does not model, preserved verbatim on load and
    /// emitted back out on save.
    #[serde(flatten)]
    pub unknown: HashMap<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evolution: EvolutionConfig::default(),
            shell: ShellConfig::default(),
            unknown: HashMap::new(),
        }
    }
}

impl Config {
    /// Parses `yaml`, defaulting every key this struct doesn't recognize
    /// and stashing everything it doesn't model into `unknown`.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
