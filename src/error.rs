//! Error taxonomy for the agent core.
//!
//! One `AgentError` enum covers every kind in the error handling design:
//! parse failures, unknown-module/action lookups, registration and
//! dependency failures, loader failures, call failures, timeouts, and the
//! evolution-specific status kinds. Collaborator errors convert in via
//! `#[from]` so call sites can use `?` without manual mapping.

use std::time::Duration;

use crate::generator::GeneratorError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("unknown module: {name}")]
    UnknownModule {
        name: String,
        suggestion: Option<String>,
    },

    #[error("module {module} has no action {action}")]
    UnknownAction { module: String, action: String },

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("module {module} exposes no action named {action}")]
    ActionNotFound { module: String, action: String },

    #[error("module already registered: {0}")]
    DuplicateModule(String),

    #[error("module validation failed: {0}")]
    ValidationFailed(String),

    #[error("circular dependency detected involving module {0}")]
    CircularDependency(String),

    #[error("failed to load module: {0}")]
    LoadFailed(#[from] crate::module::loader::LoadError),

    #[error("execution error in {module}.{action}: {source}")]
    ExecutionError {
        module: String,
        action: String,
        #[source]
        source: Box<AgentError>,
    },

    #[error("{operation} on {target} exceeded its {budget:?} budget")]
    TimeoutExceeded {
        operation: &'static str,
        target: String,
        budget: Duration,
    },

    #[error("an evolution cycle is already running")]
    EvolutionBusy,

    #[error("evolution cannot run: resources are constrained ({0})")]
    ResourceConstrained(String),

    #[error("test failure: {0}")]
    TestFailure(String),

    #[error("integration failure: {0}")]
    IntegrationFailure(String),

    #[error("text generator unavailable: {0}")]
    GeneratorUnavailable(#[from] GeneratorError),

    #[error("no text-generation module is loaded")]
    ModelNotLoaded,

    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Dispatch(#[from] crate::dispatcher::DispatchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Short, stable kind label — handy for tests and for any external
    /// caller that wants to branch on kind without matching the full enum.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ParseError(_) => "ParseError",
            AgentError::UnknownModule { .. } => "UnknownModule",
            AgentError::UnknownAction { .. } => "UnknownAction",
            AgentError::ModuleNotFound(_) => "ModuleNotFound",
            AgentError::ActionNotFound { .. } => "ActionNotFound",
            AgentError::DuplicateModule(_) => "DuplicateModule",
            AgentError::ValidationFailed(_) => "ValidationFailed",
            AgentError::CircularDependency(_) => "CircularDependency",
            AgentError::LoadFailed(_) => "LoadFailed",
            AgentError::ExecutionError { .. } => "ExecutionError",
            AgentError::TimeoutExceeded { .. } => "TimeoutExceeded",
            AgentError::EvolutionBusy => "EvolutionBusy",
            AgentError::ResourceConstrained(_) => "ResourceConstrained",
            AgentError::TestFailure(_) => "TestFailure",
            AgentError::IntegrationFailure(_) => "IntegrationFailure",
            AgentError::GeneratorUnavailable(_) => "GeneratorUnavailable",
            AgentError::ModelNotLoaded => "ModelNotLoaded",
            AgentError::Config(_) => "Config",
            AgentError::Dispatch(_) => "Dispatch",
            AgentError::Io(_) => "Io",
            AgentError::Serialization(_) => "Serialization",
        }
    }
}
