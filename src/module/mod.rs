//! The module subsystem: the `Module` registration contract,
//! the `ModuleManager` registry that owns lifecycle and dispatch, the
//! `ModuleLoader` that turns source text into a registered instance, and
//! the FFI adapter hot-reloaded modules go through.

pub mod capability;
pub mod context;
pub mod ffi;
pub mod loader;
pub mod manager;
pub mod module_trait;
pub mod types;

pub use capability::Capability;
pub use context::{ModuleContext, SharedState};
pub use ffi::{ForeignModule, ModuleVTable};
pub use loader::{CargoModuleBuilder, InProcessModuleBuilder, LoadError, ModuleBuilder, ModuleLoader, ScanReport};
pub use manager::{ModuleDescriptor, ModuleEntry, ModuleManager, SystemHealth};
pub use module_trait::Module;
pub use types::{AtomicModuleMetrics, CallArgs, ModuleMetrics, ModulePriority, ModuleState};
