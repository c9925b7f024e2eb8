//! The evolution subsystem: telemetry-driven self-improvement.
//!
//! [`engine::EvolutionEngine`] runs one Analyse → Identify → Generate →
//! Test → Integrate → Learn cycle at a time; [`types`] is its data model
//! and [`templates`] supplies the fixed-source strategies the Generate
//! phase reaches for before falling back to a `TextGenerator`.

pub mod engine;
pub mod templates;
pub mod types;

pub use engine::EvolutionEngine;
pub use types::{
    Analysis, CycleStatus, EvolutionCycle, FailureCluster, Integration, Opportunity, Priority,
    ResourceUsage, Solution, TestStatus,
};
