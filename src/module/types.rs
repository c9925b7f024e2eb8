//! Shared value types for the module subsystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scheduling priority a module declares for itself. Ordered low-to-high so
/// `Priority::Critical > Priority::Background` under the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModulePriority {
    Background,
    Low,
    Normal,
    High,
    Critical,
}

impl Default for ModulePriority {
    fn default() -> Self {
        ModulePriority::Normal
    }
}

/// Lifecycle state of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Active,
    Paused,
    Error,
    Unloading,
}

/// The arguments a parsed command (or a direct caller) passes to an action:
/// positional values in order, plus keyword values by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            kwargs: HashMap::new(),
        }
    }

    /// Looks up a keyword argument first, then falls back to the
    /// positional argument at `index` — convenient for modules that accept
    /// either calling convention for the same parameter.
    pub fn get(&self, name: &str, index: usize) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.positional.get(index))
    }

    pub fn get_str(&self, name: &str, index: usize) -> Option<&str> {
        self.get(name, index).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str, index: usize) -> Option<i64> {
        self.get(name, index).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str, index: usize) -> Option<f64> {
        self.get(name, index).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str, index: usize) -> Option<bool> {
        self.get(name, index).and_then(Value::as_bool)
    }
}

/// Point-in-time snapshot of a module's call metrics. Produced from the atomic counters in
/// [`AtomicModuleMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetrics {
    pub calls: u64,
    pub total_nanos: u64,
    pub avg_nanos: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub peak_mem_kb: Option<u64>,
    pub peak_cpu: Option<f32>,
}

/// Atomic backing store for `ModuleMetrics`. Calls and duration are
/// updated lock-free; `last_error` uses a small mutex since it is a
/// string and only written on the (rare) failure path.
#[derive(Default)]
pub struct AtomicModuleMetrics {
    calls: AtomicU64,
    total_nanos: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    peak_mem_kb: AtomicU64,
    peak_cpu_millis: AtomicU64,
}

impl AtomicModuleMetrics {
    pub fn record_success(&self, duration_nanos: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(duration_nanos, Ordering::Relaxed);
    }

    pub fn record_failure(&self, duration_nanos: u64, error: String) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(duration_nanos, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("metrics lock poisoned") = Some(error);
    }

    pub fn record_resource_sample(&self, mem_kb: u64, cpu_percent: f32) {
        self.peak_mem_kb.fetch_max(mem_kb, Ordering::Relaxed);
        self.peak_cpu_millis
            .fetch_max((cpu_percent * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModuleMetrics {
        let calls = self.calls.load(Ordering::Relaxed);
        let total_nanos = self.total_nanos.load(Ordering::Relaxed);
        let avg_nanos = if calls == 0 { 0 } else { total_nanos / calls };
        let peak_mem_kb = self.peak_mem_kb.load(Ordering::Relaxed);
        let peak_cpu_millis = self.peak_cpu_millis.load(Ordering::Relaxed);
        ModuleMetrics {
            calls,
            total_nanos,
            avg_nanos,
            errors: self.errors.load(Ordering::Relaxed),
            last_error: self.last_error.lock().expect("metrics lock poisoned").clone(),
            peak_mem_kb: if peak_mem_kb == 0 { None } else { Some(peak_mem_kb) },
            peak_cpu: if peak_cpu_millis == 0 {
                None
            } else {
                Some(peak_cpu_millis as f32 / 1000.0)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_nanos_is_zero_with_no_calls() {
        let m = AtomicModuleMetrics::default();
        assert_eq!(m.snapshot().avg_nanos, 0);
    }

    #[test]
    fn avg_nanos_divides_total_by_calls() {
        let m = AtomicModuleMetrics::default();
        m.record_success(100);
        m.record_success(300);
        let snap = m.snapshot();
        assert_eq!(snap.calls, 2);
        assert_eq!(snap.total_nanos, 400);
        assert_eq!(snap.avg_nanos, 200);
    }

    #[test]
    fn failure_increments_errors_and_records_message() {
        let m = AtomicModuleMetrics::default();
        m.record_failure(50, "boom".into());
        let snap = m.snapshot();
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn call_args_prefers_kwarg_over_positional() {
        let mut args = CallArgs::positional(vec![Value::from(1)]);
        args.kwargs.insert("x".into(), Value::from(2));
        assert_eq!(args.get_i64("x", 0), Some(2));
        assert_eq!(args.get_i64("y", 0), Some(1));
    }
}
