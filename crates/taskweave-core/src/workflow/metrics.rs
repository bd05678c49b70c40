//! Process-lifetime execution metrics.
//!
//! Counters are lock-free atomics. The running mean of execution time uses
//! Welford's update under a small mutex, since it needs the count and the
//! mean to change together.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use taskweave_types::metrics::MetricsSnapshot;

#[derive(Debug, Default)]
struct RunningMean {
    count: u64,
    mean: f64,
}

/// Aggregates counts and timings across executions.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    suspended: AtomicU64,
    rollbacks: AtomicU64,
    compensations_failed: AtomicU64,
    execution_time: Mutex<RunningMean>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, elapsed_ms: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.observe_time(elapsed_ms);
    }

    pub fn record_failed(&self, elapsed_ms: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.observe_time(elapsed_ms);
    }

    /// An execution was parked (retry requested or user input required).
    pub fn record_suspended(&self) {
        self.suspended.fetch_add(1, Ordering::Relaxed);
    }

    /// A rollback ran, with `failures` compensations that did not succeed.
    pub fn record_rollback(&self, failures: usize) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.compensations_failed
            .fetch_add(failures as u64, Ordering::Relaxed);
    }

    fn observe_time(&self, elapsed_ms: u64) {
        let mut running = self
            .execution_time
            .lock()
            .expect("metrics lock poisoned");
        running.count += 1;
        running.mean += (elapsed_ms as f64 - running.mean) / running.count as f64;
    }

    /// Point-in-time view; `active_executions` comes from the execution registry.
    pub fn snapshot(&self, active_executions: usize) -> MetricsSnapshot {
        let average_execution_time_ms = self
            .execution_time
            .lock()
            .expect("metrics lock poisoned")
            .mean;
        MetricsSnapshot {
            executions_started: self.started.load(Ordering::Relaxed),
            executions_completed: self.completed.load(Ordering::Relaxed),
            executions_failed: self.failed.load(Ordering::Relaxed),
            executions_suspended: self.suspended.load(Ordering::Relaxed),
            rollbacks_executed: self.rollbacks.load(Ordering::Relaxed),
            compensations_failed: self.compensations_failed.load(Ordering::Relaxed),
            average_execution_time_ms,
            active_executions: active_executions as u64,
            captured_at: Utc::now(),
        }
    }
}
