//! `TelemetryStore` — a bounded task-history ring plus aggregate counters.
//! Single-writer / multi-reader: `record` is serialized by a mutex,
//! `snapshot`/`history` take a consistent point-in-time copy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::write_json_atomic;

const HISTORY_CAPACITY: usize = 1_000;
const PERSISTED_HISTORY_LEN: usize = 100;

/// One resource sample taken at task completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub load_avg_one: f32,
}

/// An immutable record of one completed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub timestamp_unix_nanos: u128,
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub truncated_result: String,
    pub duration_nanos: u64,
    pub success: bool,
    pub snapshot: ResourceSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandAggregate {
    pub success: u64,
    pub fail: u64,
    pub total_nanos: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAggregate {
    pub commands_executed: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_execution_nanos: u64,
    pub evolution_cycles: u64,
    pub modules_created: u64,
    pub first_command_at: Option<u128>,
    pub last_command_at: Option<u128>,
    pub per_command: HashMap<String, CommandAggregate>,
}

/// Input to `record`: a completed command's outcome, before it becomes an
/// immutable `TaskRecord`.
pub struct CompletedTask {
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub result: Option<Value>,
    pub duration_nanos: u64,
    pub success: bool,
    pub snapshot: ResourceSnapshot,
}

struct Inner {
    ring: std::collections::VecDeque<TaskRecord>,
    aggregate: PerformanceAggregate,
}

pub struct TelemetryStore {
    inner: Mutex<Inner>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: std::collections::VecDeque::with_capacity(HISTORY_CAPACITY),
                aggregate: PerformanceAggregate::default(),
            }),
        }
    }

    /// Rebuilds a store from a previously persisted aggregate. The task
    /// ring starts empty — only the aggregate counters, not individual
    /// records, survive a restart.
    pub fn from_aggregate(aggregate: PerformanceAggregate) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: std::collections::VecDeque::with_capacity(HISTORY_CAPACITY),
                aggregate,
            }),
        }
    }

    /// Appends `task` to the ring (oldest overwritten past capacity 1 000)
    /// and updates the aggregate, both under one lock acquisition so a
    /// reader never observes the two out of sync.
    pub fn record(&self, task: CompletedTask) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let truncated_result = task
            .result
            .map(|v| truncate(&v.to_string(), 2048))
            .unwrap_or_default();

        let record = TaskRecord {
            timestamp_unix_nanos: now,
            command: task.command.clone(),
            args: task.args,
            kwargs: task.kwargs,
            truncated_result,
            duration_nanos: task.duration_nanos,
            success: task.success,
            snapshot: task.snapshot,
        };

        let mut inner = self.inner.lock().expect("telemetry lock poisoned");
        if inner.ring.len() == HISTORY_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);

        let agg = &mut inner.aggregate;
        agg.commands_executed += 1;
        if task.success {
            agg.successful_executions += 1;
        } else {
            agg.failed_executions += 1;
        }
        agg.total_execution_nanos += task.duration_nanos;
        agg.first_command_at.get_or_insert(now);
        agg.last_command_at = Some(now);

        let entry = agg.per_command.entry(task.command).or_default();
        if task.success {
            entry.success += 1;
        } else {
            entry.fail += 1;
        }
        entry.total_nanos += task.duration_nanos;
    }

    pub fn record_evolution_cycle(&self) {
        self.inner
            .lock()
            .expect("telemetry lock poisoned")
            .aggregate
            .evolution_cycles += 1;
    }

    pub fn record_modules_created(&self, count: u64) {
        self.inner
            .lock()
            .expect("telemetry lock poisoned")
            .aggregate
            .modules_created += count;
    }

    /// A deep copy of the current aggregate.
    pub fn snapshot(&self) -> PerformanceAggregate {
        self.inner.lock().expect("telemetry lock poisoned").aggregate.clone()
    }

    /// The last `n` records, oldest first.
    pub fn history(&self, n: usize) -> Vec<TaskRecord> {
        let inner = self.inner.lock().expect("telemetry lock poisoned");
        let len = inner.ring.len();
        let skip = len.saturating_sub(n);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("telemetry lock poisoned").ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists the aggregate to `metrics_path` and the last 100 records to
    /// `history_path`, both atomically.
    pub fn persist(&self, metrics_path: &Path, history_path: &Path) -> std::io::Result<()> {
        let (aggregate, recent) = {
            let inner = self.inner.lock().expect("telemetry lock poisoned");
            (inner.aggregate.clone(), self.history_locked(&inner))
        };
        write_json_atomic(metrics_path, &aggregate)?;
        write_json_atomic(history_path, &recent)?;
        Ok(())
    }

    fn history_locked(&self, inner: &Inner) -> Vec<TaskRecord> {
        let len = inner.ring.len();
        let skip = len.saturating_sub(PERSISTED_HISTORY_LEN);
        inner.ring.iter().skip(skip).cloned().collect()
    }

    /// Reconstructs the aggregate from a previously persisted `metrics`
    /// file. History is not restored into the live ring; it is read-only
    /// once persisted.
    pub fn load_aggregate(path: &Path) -> std::io::Result<PerformanceAggregate> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn load_history(path: &Path) -> std::io::Result<Vec<TaskRecord>> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
