//! Multi-strategy plan optimizer.
//!
//! - `profile` -- planning view of a workflow and schedule estimation
//! - `greedy` -- fastest-first and cheapest-first list scheduling
//! - `critical_path` -- longest-chain-first rounds
//! - `dynamic` -- exhaustive subset search for small workflows
//! - `genetic` -- seedable evolutionary search for larger ones
//! - `repair` -- constraint validation and repair applied to every plan

pub mod critical_path;
pub mod dynamic;
pub mod genetic;
pub mod greedy;
pub mod profile;
pub mod repair;

use taskweave_types::optimization::{
    Constraints, OptimizationPlan, OptimizationStrategy, OptimizationTarget, StrategyHint,
};
use taskweave_types::workflow::WorkflowDefinition;
use thiserror::Error;

use crate::workflow::definition::WorkflowError;

use self::profile::PlanProfile;

/// Workflows up to this size default to a greedy strategy.
const GREEDY_MAX_STEPS: usize = 3;
/// Workflows up to this size default to critical-path scheduling.
const CRITICAL_PATH_MAX_STEPS: usize = 6;

/// Errors from plan optimization.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("{steps} steps is too many for exhaustive search (max {max})")]
    TooLargeForExhaustiveSearch { steps: usize, max: usize },
}

/// Produces execution plans for workflow definitions.
///
/// Stateless apart from the optional genetic seed; every strategy except
/// genetic-balanced is a pure function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    seed: Option<u64>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the genetic strategy's seed so its plans are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    /// Default strategy for a workflow of `step_count` steps.
    pub fn select_strategy(step_count: usize, target: OptimizationTarget) -> OptimizationStrategy {
        if step_count <= GREEDY_MAX_STEPS {
            if target == OptimizationTarget::Cost {
                OptimizationStrategy::GreedyCost
            } else {
                OptimizationStrategy::GreedyTime
            }
        } else if step_count <= CRITICAL_PATH_MAX_STEPS {
            OptimizationStrategy::CriticalPath
        } else {
            OptimizationStrategy::GeneticBalanced
        }
    }

    /// Plan `definition` under `constraints`.
    ///
    /// The returned plan either satisfies every constraint or lists the
    /// repairs applied and any violation left unresolved.
    pub fn optimize(
        &self,
        definition: &WorkflowDefinition,
        constraints: &Constraints,
        hint: StrategyHint,
    ) -> Result<OptimizationPlan, OptimizerError> {
        let profile = PlanProfile::from_definition(definition)?;
        let strategy = hint
            .strategy
            .unwrap_or_else(|| Self::select_strategy(profile.len(), hint.target));
        let limit = constraints.parallel_limit();

        let mut schedule = match strategy {
            OptimizationStrategy::GreedyTime => greedy::by_duration(&profile, limit),
            OptimizationStrategy::GreedyCost => greedy::by_cost(&profile, limit),
            OptimizationStrategy::CriticalPath => critical_path::schedule(&profile, limit),
            OptimizationStrategy::DynamicProgramming => dynamic::schedule(&profile, limit)?,
            OptimizationStrategy::GeneticBalanced => {
                let seed = self.seed.unwrap_or_else(rand::random);
                tracing::debug!(workflow = definition.id.as_str(), seed, "genetic search seed");
                genetic::schedule(&profile, constraints, hint.target, seed)
            }
        };

        let outcome = repair::repair(&profile, &mut schedule, constraints);
        let plan = profile.to_plan(&schedule, strategy, outcome.repairs, &outcome.dropped);

        tracing::info!(
            workflow = definition.id.as_str(),
            strategy = %strategy,
            groups = plan.parallel_groups.len(),
            estimated_time_ms = plan.estimated_time_ms,
            estimated_cost = plan.estimated_cost,
            estimated_reliability = plan.estimated_reliability,
            repairs = plan.repairs.len(),
            "workflow optimized"
        );
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::profile::tests::definition;
    use crate::workflow::dag::DependencyGraph;
    use taskweave_types::optimization::RepairAction;
    use taskweave_types::workflow::{StepSpec, StepType};

    fn eight_steps() -> WorkflowDefinition {
        definition(&[
            ("auth", 500, 1.0, &[]),
            ("accounts", 1000, 2.0, &["auth"]),
            ("cards", 800, 2.0, &["auth"]),
            ("loans", 900, 2.0, &["auth"]),
            ("fx", 300, 1.0, &[]),
            ("merge", 400, 1.0, &["accounts", "cards", "loans"]),
            ("report", 1500, 1.5, &["merge", "fx"]),
            ("deliver", 1200, 1.5, &["report"]),
        ])
    }

    fn assert_plan_is_executable(def: &WorkflowDefinition, plan: &OptimizationPlan) {
        let graph = DependencyGraph::from_definition(def).unwrap();
        assert!(graph.respects_order(&plan.ordered_steps));
        for group in &plan.parallel_groups {
            for op in &group.operations {
                let others: Vec<&String> = group.operations.iter().filter(|o| *o != op).collect();
                assert!(graph.can_run_in_parallel(op, &others), "{op} in {group:?}");
            }
        }
    }

    #[test]
    fn strategy_selection_by_size() {
        use OptimizationStrategy::*;
        let balanced = OptimizationTarget::Balanced;
        assert_eq!(Optimizer::select_strategy(3, balanced), GreedyTime);
        assert_eq!(Optimizer::select_strategy(2, OptimizationTarget::Cost), GreedyCost);
        assert_eq!(Optimizer::select_strategy(4, balanced), CriticalPath);
        assert_eq!(Optimizer::select_strategy(6, OptimizationTarget::Cost), CriticalPath);
        assert_eq!(Optimizer::select_strategy(7, balanced), GeneticBalanced);
    }

    #[test]
    fn three_independent_steps_share_one_group() {
        let def = definition(&[("a", 1000, 1.0, &[]), ("b", 2000, 1.0, &[]), ("c", 1500, 1.0, &[])]);
        let plan = Optimizer::new()
            .optimize(&def, &Constraints::with_max_parallel(3), StrategyHint::default())
            .unwrap();
        assert_eq!(plan.strategy, OptimizationStrategy::GreedyTime);
        assert_eq!(plan.parallel_groups.len(), 1);
        assert_eq!(plan.parallel_groups[0].operations.len(), 3);
        assert_eq!(plan.estimated_time_ms, 2000);
        assert!(plan.repairs.is_empty());
    }

    #[test]
    fn exhaustive_search_parallelizes_independent_pair() {
        let def = definition(&[("a", 500, 2.0, &[]), ("b", 700, 3.0, &[])]);
        let plan = Optimizer::new()
            .optimize(
                &def,
                &Constraints::default(),
                StrategyHint::force(OptimizationStrategy::DynamicProgramming),
            )
            .unwrap();
        assert_eq!(plan.parallel_groups.len(), 1);
        assert!((plan.estimated_cost - 5.0).abs() < 1e-9);
        assert_eq!(plan.estimated_time_ms, 700);
    }

    #[test]
    fn exhaustive_search_refuses_large_workflows() {
        let steps: Vec<StepSpec> = (0..11)
            .map(|i| StepSpec::new(format!("s{i}"), StepType::Computation))
            .collect();
        let mut def = eight_steps();
        def.steps = steps;
        let err = Optimizer::new()
            .optimize(
                &def,
                &Constraints::default(),
                StrategyHint::force(OptimizationStrategy::DynamicProgramming),
            )
            .unwrap_err();
        assert!(matches!(err, OptimizerError::TooLargeForExhaustiveSearch { .. }));
    }

    #[test]
    fn deterministic_strategies_are_idempotent() {
        let def = eight_steps();
        let constraints = Constraints::default();
        let optimizer = Optimizer::new();
        for strategy in [
            OptimizationStrategy::GreedyTime,
            OptimizationStrategy::GreedyCost,
            OptimizationStrategy::CriticalPath,
            OptimizationStrategy::DynamicProgramming,
        ] {
            let a = optimizer.optimize(&def, &constraints, StrategyHint::force(strategy)).unwrap();
            let b = optimizer.optimize(&def, &constraints, StrategyHint::force(strategy)).unwrap();
            assert_eq!(a, b, "{strategy}");
            assert_eq!(a.strategy, strategy);
            assert_eq!(a.ordered_steps.len(), 8);
            assert_plan_is_executable(&def, &a);
        }
    }

    #[test]
    fn seeded_genetic_is_reproducible() {
        let def = eight_steps();
        let optimizer = Optimizer::with_seed(99);
        let a = optimizer.optimize(&def, &Constraints::default(), StrategyHint::default()).unwrap();
        let b = optimizer.optimize(&def, &Constraints::default(), StrategyHint::default()).unwrap();
        assert_eq!(a.strategy, OptimizationStrategy::GeneticBalanced);
        assert_eq!(a, b);
        assert_plan_is_executable(&def, &a);
    }

    #[test]
    fn every_plan_satisfies_or_is_annotated() {
        let def = eight_steps();
        let tight = [
            Constraints::with_max_parallel(1),
            Constraints {
                max_execution_time_ms: Some(3000),
                ..Constraints::default()
            },
            Constraints {
                max_total_cost: Some(4.0),
                ..Constraints::default()
            },
            Constraints {
                min_reliability: Some(0.9999),
                ..Constraints::default()
            },
        ];
        let optimizer = Optimizer::with_seed(5);
        for constraints in &tight {
            for strategy in [
                OptimizationStrategy::GreedyTime,
                OptimizationStrategy::GreedyCost,
                OptimizationStrategy::CriticalPath,
                OptimizationStrategy::DynamicProgramming,
                OptimizationStrategy::GeneticBalanced,
            ] {
                let plan = optimizer
                    .optimize(&def, constraints, StrategyHint::force(strategy))
                    .unwrap();
                assert!(
                    plan.satisfies(constraints) || plan.has_unresolved_violations(),
                    "{strategy} under {constraints:?}: {plan:?}"
                );
                assert!(
                    plan.parallel_groups
                        .iter()
                        .all(|g| g.operations.len() <= constraints.parallel_limit())
                );
                assert_plan_is_executable(&def, &plan);
            }
        }
    }

    #[test]
    fn serialized_critical_path_plan_reports_sequential_time() {
        let def = definition(&[
            ("a", 1000, 1.0, &[]),
            ("x", 1000, 1.0, &[]),
            ("y", 1000, 1.0, &[]),
            ("z", 1000, 1.0, &[]),
        ]);
        let hint = StrategyHint::force(OptimizationStrategy::CriticalPath);
        let reliable = Constraints {
            max_parallel_operations: 5,
            min_reliability: Some(0.995),
            ..Constraints::default()
        };

        let plan = Optimizer::new().optimize(&def, &reliable, hint).unwrap();
        assert_eq!(plan.parallel_groups.len(), 4);
        assert_eq!(plan.estimated_time_ms, 4000);
        assert!(plan.satisfies(&reliable));

        let bounded = Constraints {
            max_execution_time_ms: Some(3500),
            ..reliable
        };
        let plan = Optimizer::new().optimize(&def, &bounded, hint).unwrap();
        assert_eq!(plan.parallel_groups.len(), 1);
        assert_eq!(plan.estimated_time_ms, 1000);
        assert!(!plan.satisfies(&bounded));
        assert!(plan.has_unresolved_violations());
    }

    #[test]
    fn dropped_steps_reported() {
        let def = eight_steps();
        let constraints = Constraints {
            max_total_cost: Some(8.0),
            ..Constraints::default()
        };
        let plan = Optimizer::new()
            .optimize(&def, &constraints, StrategyHint::force(OptimizationStrategy::GreedyTime))
            .unwrap();
        assert!(!plan.dropped_steps.is_empty());
        assert!(plan.repairs.iter().any(|r| r.action == RepairAction::DroppedSteps));
        assert!(plan.satisfies(&constraints));
        for dropped in &plan.dropped_steps {
            assert!(!plan.ordered_steps.contains(dropped));
        }
    }

    #[test]
    fn invalid_definition_rejected() {
        let mut def = eight_steps();
        def.steps[0].dependencies = vec!["deliver".to_string()];
        assert!(matches!(
            Optimizer::new().optimize(&def, &Constraints::default(), StrategyHint::default()),
            Err(OptimizerError::InvalidWorkflow(WorkflowError::CycleDetected(_)))
        ));
    }
}
