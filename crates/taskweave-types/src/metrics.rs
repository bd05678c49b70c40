//! Point-in-time view of engine execution metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the engine's process-lifetime counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    /// Executions parked for retry or user input.
    pub executions_suspended: u64,
    /// Rollback unwinds performed (one per failed run with entries to compensate).
    pub rollbacks_executed: u64,
    /// Individual compensation handlers that returned an error.
    pub compensations_failed: u64,
    /// Running mean over finished executions, in milliseconds.
    pub average_execution_time_ms: f64,
    /// Executions currently running or parked.
    pub active_executions: u64,
    pub captured_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Fraction of finished executions that completed, or `None` before any finished.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.executions_completed + self.executions_failed;
        if finished == 0 {
            None
        } else {
            Some(self.executions_completed as f64 / finished as f64)
        }
    }
}
