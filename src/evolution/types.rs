//! Data model for a single evolution cycle: the six-phase
//! Analyse → Identify → Generate → Test → Integrate → Learn pipeline
//! produces one `EvolutionCycle` record per run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::telemetry::CommandAggregate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_percent: f32,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
    pub cpu_percent: f32,
}

/// Failures for one command head, with a capped sample of error excerpts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureCluster {
    pub command: String,
    pub count: u64,
    pub excerpts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub success_rate: f64,
    pub failure_rate: f64,
    pub avg_duration_nanos: u64,
    pub per_command: HashMap<String, CommandAggregate>,
    pub problematic_commands: Vec<String>,
    pub resource_usage: ResourceUsage,
    pub failure_clusters: Vec<FailureCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub category: String,
    pub priority: Priority,
    pub description: String,
    pub metrics: Option<Value>,
    pub suggested_actions: Vec<String>,
    pub impact: String,
    pub effort: String,
    pub created_at_unix_nanos: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Unvalidated,
    Validated,
    Invalid,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub id: String,
    pub opportunity_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub module_name: String,
    pub source_code: String,
    pub priority: Priority,
    pub test_status: TestStatus,
    pub test_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub module_name: String,
    pub succeeded: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Started,
    Success,
    Failed,
    Disabled,
    Busy,
    ResourceConstrained,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionCycle {
    pub id: String,
    pub started_at_unix_nanos: u128,
    pub finished_at_unix_nanos: Option<u128>,
    pub status: CycleStatus,
    pub analysis: Option<Analysis>,
    pub opportunities: Vec<Opportunity>,
    pub solutions: Vec<Solution>,
    pub integrations: Vec<Integration>,
    pub error: Option<String>,
    pub learning_summary: Option<String>,
}

impl EvolutionCycle {
    pub fn started(id: String, started_at_unix_nanos: u128) -> Self {
        Self {
            id,
            started_at_unix_nanos,
            finished_at_unix_nanos: None,
            status: CycleStatus::Started,
            analysis: None,
            opportunities: Vec::new(),
            solutions: Vec::new(),
            integrations: Vec::new(),
            error: None,
            learning_summary: None,
        }
    }

    pub fn finish(&mut self, status: CycleStatus, finished_at_unix_nanos: u128) {
        self.status = status;
        self.finished_at_unix_nanos = Some(finished_at_unix_nanos);
    }

    /// Human-readable start time for logs and history displays; the
    /// stored field stays raw nanoseconds so ordering and persistence
    /// never depend on a timezone-aware type.
    pub fn started_at_rfc3339(&self) -> String {
        unix_nanos_to_rfc3339(self.started_at_unix_nanos)
    }

    pub fn finished_at_rfc3339(&self) -> Option<String> {
        self.finished_at_unix_nanos.map(unix_nanos_to_rfc3339)
    }
}

fn unix_nanos_to_rfc3339(nanos: u128) -> String {
    let secs = (nanos / 1_000_000_000) as i64;
    let subsec_nanos = (nanos % 1_000_000_000) as u32;
    chrono::DateTime::from_timestamp(secs, subsec_nanos)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "invalid timestamp".to_string())
}
