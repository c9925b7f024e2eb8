//! # ellma-core
//!
//! A local command agent: commands come in as `module.action` lines, run
//! against a registry of modules, and every outcome feeds a telemetry
//! store. When enough commands have run, or the failure rate climbs too
//! high, an evolution engine analyses the telemetry, proposes and
//! statically validates new or patched modules, and loads the ones that
//! pass straight into the running registry.
//!
//! ## Module tour
//!
//! - [`module`] — the `Module` trait, the capability/metrics types
//!   around it, the dependency-ordered [`module::ModuleManager`]
//!   registry, and the dynamic-loading story ([`module::ModuleLoader`],
//!   a `dlopen`-based [`module::ForeignModule`] for modules built as
//!   their own cdylib, and an in-process builder for tests and
//!   first-party modules).
//! - [`dispatcher`] — parses a command line, resolves it to a module
//!   call or a built-in, coerces its arguments, and falls back to a
//!   [`generator::TextGenerator`] rewrite when a module name doesn't
//!   match and natural-language fallback is enabled.
//! - [`telemetry`] — a bounded ring of recent command outcomes plus
//!   running aggregates, persisted to disk.
//! - [`evolution`] — the self-improvement cycle: analyse telemetry,
//!   identify opportunities, generate solutions (fixed templates or an
//!   LLM), validate them syntactically, integrate the ones that pass,
//!   and adjust the learning rate.
//! - [`generator`] — the `TextGenerator` trait evolution and the
//!   dispatcher's NL fallback both depend on, plus a scripted mock for
//!   tests.
//! - [`config`] — typed configuration with defaults for every known key
//!   and a side table for anything this crate doesn't model yet.
//! - [`event_bus`] — a synchronous pub/sub bus modules and the engine
//!   use to observe each other without direct coupling.
//! - [`persistence`] — atomic JSON writes with timestamped backups,
//!   used everywhere state is written to disk.
//! - [`agent`] — [`agent::Agent`], the top-level object that wires all
//!   of the above together and is what a host binary actually holds.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod evolution;
pub mod generator;
pub mod module;
pub mod persistence;
pub mod telemetry;

pub use agent::{Agent, StatePaths};
pub use config::Config;
pub use error::AgentError;
pub use evolution::{EvolutionCycle, EvolutionEngine};
pub use module::{Module, ModuleManager};
