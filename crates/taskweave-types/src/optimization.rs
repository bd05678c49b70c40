//! Plan optimizer types: constraints, strategies, and the resulting plan.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// Limits a plan must satisfy (or be repaired to satisfy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Maximum operations in one parallel group (at least 1).
    #[serde(default = "default_max_parallel_operations")]
    pub max_parallel_operations: usize,
    /// Upper bound on the plan's estimated time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    /// Upper bound on the plan's estimated cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_cost: Option<f64>,
    /// Lower bound on the plan's estimated reliability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reliability: Option<f64>,
}

fn default_max_parallel_operations() -> usize {
    3
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_parallel_operations: default_max_parallel_operations(),
            max_execution_time_ms: None,
            max_total_cost: None,
            min_reliability: None,
        }
    }
}

impl Constraints {
    pub fn with_max_parallel(max_parallel_operations: usize) -> Self {
        Self {
            max_parallel_operations,
            ..Self::default()
        }
    }

    /// `max_parallel_operations`, floored at 1.
    pub fn parallel_limit(&self) -> usize {
        self.max_parallel_operations.max(1)
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// The interchangeable optimization algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    GreedyTime,
    GreedyCost,
    CriticalPath,
    DynamicProgramming,
    GeneticBalanced,
}

impl OptimizationStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            OptimizationStrategy::GreedyTime => "greedy_time",
            OptimizationStrategy::GreedyCost => "greedy_cost",
            OptimizationStrategy::CriticalPath => "critical_path",
            OptimizationStrategy::DynamicProgramming => "dynamic_programming",
            OptimizationStrategy::GeneticBalanced => "genetic_balanced",
        }
    }

    /// Whether identical input always yields an identical plan.
    pub const fn is_deterministic(self) -> bool {
        !matches!(self, OptimizationStrategy::GeneticBalanced)
    }
}

impl std::fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller wants the plan to favor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationTarget {
    Speed,
    Cost,
    Reliability,
    #[default]
    Balanced,
}

/// Strategy request: an explicit strategy, or automatic selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyHint {
    /// Forces a specific strategy when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<OptimizationStrategy>,
    #[serde(default)]
    pub target: OptimizationTarget,
}

impl StrategyHint {
    pub fn auto(target: OptimizationTarget) -> Self {
        Self {
            strategy: None,
            target,
        }
    }

    pub fn force(strategy: OptimizationStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            target: OptimizationTarget::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Steps scheduled to execute concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub operations: Vec<String>,
    pub estimated_time_ms: u64,
}

/// Which constraint a repair addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    MaxParallelOperations,
    MaxExecutionTime,
    MaxTotalCost,
    MinReliability,
}

/// What the repair pass did about a violated constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    /// An oversized group was split.
    SplitGroup,
    /// Low-priority steps were removed.
    DroppedSteps,
    /// Parallel groups were serialized.
    Serialized,
    /// The violation could not be repaired; the plan is returned annotated.
    Unresolved,
}

/// An explicit record of a constraint violation and its repair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRepair {
    pub constraint: ConstraintKind,
    pub action: RepairAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_steps: Vec<String>,
    pub detail: String,
}

/// Output of the optimizer: execution order plus parallel groupings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationPlan {
    pub workflow_id: String,
    pub ordered_steps: Vec<String>,
    pub parallel_groups: Vec<ParallelGroup>,
    pub estimated_time_ms: u64,
    pub estimated_cost: f64,
    pub estimated_reliability: f64,
    pub strategy: OptimizationStrategy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<PlanRepair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_steps: Vec<String>,
}

impl OptimizationPlan {
    /// Whether any violation was left unrepaired.
    pub fn has_unresolved_violations(&self) -> bool {
        self.repairs
            .iter()
            .any(|r| r.action == RepairAction::Unresolved)
    }

    /// Whether the plan satisfies every constraint outright.
    pub fn satisfies(&self, constraints: &Constraints) -> bool {
        let parallel_ok = self
            .parallel_groups
            .iter()
            .all(|g| g.operations.len() <= constraints.parallel_limit());
        let time_ok = constraints
            .max_execution_time_ms
            .is_none_or(|max| self.estimated_time_ms <= max);
        let cost_ok = constraints
            .max_total_cost
            .is_none_or(|max| self.estimated_cost <= max + f64::EPSILON);
        let reliability_ok = constraints
            .min_reliability
            .is_none_or(|min| self.estimated_reliability + f64::EPSILON >= min);
        parallel_ok && time_ok && cost_ok && reliability_ok
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
