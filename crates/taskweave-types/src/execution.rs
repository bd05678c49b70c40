//! Execution-time types: per-run state, step results, and execution results.
//!
//! One `ExecutionState` exists per workflow run. It is exclusively owned by
//! that run's step loop and is never shared with another execution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::optimization::{OptimizationStrategy, PlanRepair};
use crate::workflow::StepType;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// What a step handler returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    /// Keys merged into the execution context on success.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context_updates: Map<String, Value>,
    /// Data needed to compensate this step. Kept only for rollbackable steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<Value>,
    /// End the workflow early with this result as the final output.
    #[serde(default)]
    pub terminate: bool,
}

impl StepResult {
    /// A successful result carrying `result`.
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            context_updates: Map::new(),
            rollback_data: None,
            terminate: false,
        }
    }

    /// An unsuccessful result. The engine treats it like a handler error.
    pub fn failed(result: Value) -> Self {
        Self {
            success: false,
            ..Self::ok(result)
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }

    pub fn with_rollback(mut self, data: Value) -> Self {
        self.rollback_data = Some(data);
        self
    }

    pub fn terminating(mut self) -> Self {
        self.terminate = true;
        self
    }
}

/// One entry of the compensation stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    pub step_id: String,
    pub step_type: StepType,
    #[serde(default)]
    pub rollback_data: Value,
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Mutable state of a single workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Index into `order` of the next step to run.
    pub current_step_index: usize,
    /// Planned step order for this run.
    pub order: Vec<String>,
    pub context: Map<String, Value>,
    pub step_results: HashMap<String, StepResult>,
    /// Completed step IDs in completion order.
    pub completed_steps: Vec<String>,
    pub rollback_stack: Vec<RollbackEntry>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(
        execution_id: Uuid,
        workflow_id: impl Into<String>,
        order: Vec<String>,
        context: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Running,
            current_step_index: 0,
            order,
            context,
            step_results: HashMap::new(),
            completed_steps: Vec::new(),
            rollback_stack: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    /// The step the run will execute next, if any.
    pub fn current_step(&self) -> Option<&str> {
        self.order.get(self.current_step_index).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// How an execution call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every planned step ran.
    Completed,
    /// A step returned `terminate = true`.
    Terminated { step_id: String },
    /// A step in `retry_on` failed; the run is parked for resumption.
    RetryRequested { step_id: String, reason: String },
    /// A step in `prompt_on` failed; the run waits for user input.
    RequiresUserInput { step_id: String, reason: String },
    /// A fatal error aborted the run and rollback was attempted.
    Failed,
}

impl ExecutionOutcome {
    /// Whether the execution was parked and can be resumed.
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::RetryRequested { .. } | ExecutionOutcome::RequiresUserInput { .. }
        )
    }
}

/// Classification of a fatal execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DependencyUnmet,
    StepExecution,
    UnknownStepType,
    Cancelled,
    DeadlineExceeded,
    Abandoned,
}

/// A fatal failure, naming the step that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// Result of compensating a failed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Steps whose compensation ran successfully, in unwind order.
    pub compensated: Vec<String>,
    /// Steps with no registered compensation handler.
    pub skipped: Vec<String>,
    /// Steps whose compensation failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl RollbackReport {
    /// Number of compensation handlers invoked.
    pub fn attempted(&self) -> usize {
        self.compensated.len() + self.failed.len()
    }
}

/// Extra information attached to an execution result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Strategy of the plan the run followed, if one was supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<OptimizationStrategy>,
    /// Repairs applied to the supplied plan.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<PlanRepair>,
    /// Steps the plan left out.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_steps: Vec<String>,
    /// Steps served from cache.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_hits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
}

/// What `execute_workflow` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub outcome: ExecutionOutcome,
    /// Final output (last step's result, or the terminating step's).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    pub execution_time_ms: u64,
    pub steps_completed: Vec<String>,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_result_builders() {
        let result = StepResult::ok(json!({"balance": 10}))
            .with_context("balance", json!(10))
            .with_rollback(json!({"hold_id": "h-1"}))
            .terminating();
        assert!(result.success);
        assert!(result.terminate);
        assert_eq!(result.context_updates["balance"], json!(10));
        assert_eq!(result.rollback_data, Some(json!({"hold_id": "h-1"})));

        let failed = StepResult::failed(json!("declined"));
        assert!(!failed.success);
        assert!(!failed.terminate);
    }

    #[test]
    fn test_step_result_deserialize_minimal() {
        let parsed: StepResult = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert_eq!(parsed, StepResult::ok(Value::Null));
    }

    #[test]
    fn test_execution_state_cursor() {
        let mut state = ExecutionState::new(
            Uuid::now_v7(),
            "wf",
            vec!["a".to_string(), "b".to_string()],
            Map::new(),
        );
        assert_eq!(state.status, ExecutionStatus::Running);
        assert_eq!(state.current_step(), Some("a"));
        state.completed_steps.push("a".to_string());
        state.current_step_index = 1;
        assert!(state.is_completed("a"));
        assert!(!state.is_completed("b"));
        assert_eq!(state.current_step(), Some("b"));
        state.current_step_index = 2;
        assert_eq!(state.current_step(), None);
    }

    #[test]
    fn test_outcome_serde_and_suspension() {
        let outcome = ExecutionOutcome::RequiresUserInput {
            step_id: "otp".to_string(),
            reason: "code expired".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"type\":\"requires_user_input\""));
        assert!(outcome.is_suspended());
        assert!(!ExecutionOutcome::Completed.is_suspended());
        assert!(!ExecutionOutcome::Failed.is_suspended());
    }

    #[test]
    fn test_rollback_report_attempted() {
        let report = RollbackReport {
            compensated: vec!["a".to_string()],
            skipped: vec!["b".to_string()],
            failed: vec![("c".to_string(), "boom".to_string())],
        };
        assert_eq!(report.attempted(), 2);
    }
}
