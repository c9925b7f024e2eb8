//! The `Module` trait — the registration contract every capability
//! provider satisfies.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::capability::Capability;
use super::context::ModuleContext;
use super::types::{CallArgs, ModulePriority};
use crate::error::AgentError;

/// A registered capability provider. `initialize`/`shutdown` default to
/// no-ops so simple modules only need to implement `name`, `capabilities`,
/// and `call`.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn priority(&self) -> ModulePriority {
        ModulePriority::Normal
    }

    /// Names of other registered modules this one depends on. The manager
    /// initializes every dependency before this module.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn capabilities(&self) -> Vec<Capability>;

    /// Returns `true` if this module exports an action named `action`.
    fn has_action(&self, action: &str) -> bool {
        self.capabilities().iter().any(|c| c.name == action)
    }

    async fn initialize(&self, _ctx: Arc<ModuleContext>) -> Result<(), AgentError> {
        Ok(())
    }

    async fn shutdown(&self, _ctx: Arc<ModuleContext>) -> Result<(), AgentError> {
        Ok(())
    }

    /// Invokes `action` with `args`. Implementations should return
    /// `AgentError::ActionNotFound` for actions they don't recognize so
    /// the manager's `Call` path reports a consistent error kind.
    async fn call(
        &self,
        action: &str,
        args: CallArgs,
        ctx: Arc<ModuleContext>,
    ) -> Result<Value, AgentError>;
}
