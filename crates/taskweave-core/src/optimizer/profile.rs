//! Planning view of a workflow: dependency graph plus per-step estimates,
//! and the schedule representation every strategy produces.

use taskweave_types::optimization::{OptimizationPlan, OptimizationStrategy, ParallelGroup, PlanRepair};
use taskweave_types::workflow::{StepEstimate, WorkflowDefinition};

use crate::workflow::dag::DependencyGraph;
use crate::workflow::definition::{WorkflowError, validate_definition};

/// Reliability multiplier applied once per extra concurrent operation in a group.
pub const CONCURRENCY_RELIABILITY_FACTOR: f64 = 1.0 - 0.005;

/// Estimated totals of a schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub time_ms: u64,
    pub cost: f64,
    pub reliability: f64,
}

/// How a schedule's wall-clock time is estimated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeModel {
    /// Groups run back to back: sum of each group's longest member.
    GroupSum,
    /// The critical chain overlaps the off-path groups: the larger of the
    /// chain's total and the packed off-path time.
    ///
    /// Optimistic: a critical step sharing a round with a longer off-path
    /// step is not charged for the wait. Only valid while groups run
    /// concurrently; a serialized schedule uses `GroupSum`.
    Overlapped { critical: Vec<bool> },
}

/// Ordered parallel groups of step indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub groups: Vec<Vec<usize>>,
    pub time_model: TimeModel,
}

impl Schedule {
    pub fn new(groups: Vec<Vec<usize>>) -> Self {
        Self {
            groups,
            time_model: TimeModel::GroupSum,
        }
    }

    /// Step indices in execution order.
    pub fn order(&self) -> Vec<usize> {
        self.groups.iter().flatten().copied().collect()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.groups.iter().any(|g| g.contains(&index))
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Remove a step, dropping its group if it becomes empty.
    pub fn remove(&mut self, index: usize) {
        for group in &mut self.groups {
            group.retain(|&i| i != index);
        }
        self.groups.retain(|g| !g.is_empty());
    }
}

/// A validated workflow with its dependency graph and estimates, indexed by
/// declaration order.
#[derive(Debug, Clone)]
pub struct PlanProfile {
    pub workflow_id: String,
    pub graph: DependencyGraph,
    pub estimates: Vec<StepEstimate>,
}

impl PlanProfile {
    pub fn from_definition(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        validate_definition(def)?;
        Ok(Self {
            workflow_id: def.id.clone(),
            graph: DependencyGraph::from_definition(def)?,
            estimates: def.steps.iter().map(|s| s.effective_estimate()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn duration(&self, index: usize) -> u64 {
        self.estimates[index].duration_ms
    }

    pub fn cost(&self, index: usize) -> f64 {
        self.estimates[index].cost
    }

    /// Time of running every step one after another.
    pub fn sequential_time(&self) -> u64 {
        self.estimates.iter().map(|e| e.duration_ms).sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.estimates.iter().map(|e| e.cost).sum()
    }

    fn group_time(&self, group: &[usize]) -> u64 {
        group.iter().map(|&i| self.duration(i)).max().unwrap_or(0)
    }

    /// Estimate a schedule's time, cost, and reliability.
    pub fn estimate(&self, schedule: &Schedule) -> Estimate {
        let time_ms = match &schedule.time_model {
            TimeModel::GroupSum => schedule.groups.iter().map(|g| self.group_time(g)).sum(),
            TimeModel::Overlapped { critical } => {
                let chain: u64 = schedule
                    .order()
                    .into_iter()
                    .filter(|&i| critical[i])
                    .map(|i| self.duration(i))
                    .sum();
                let packed: u64 = schedule
                    .groups
                    .iter()
                    .map(|g| {
                        g.iter()
                            .filter(|&&i| !critical[i])
                            .map(|&i| self.duration(i))
                            .max()
                            .unwrap_or(0)
                    })
                    .sum();
                chain.max(packed)
            }
        };

        let cost = schedule.order().into_iter().map(|i| self.cost(i)).sum();

        let reliability = schedule
            .groups
            .iter()
            .map(|g| {
                let steps: f64 = g.iter().map(|&i| self.estimates[i].reliability).product();
                let extra = g.len().saturating_sub(1) as i32;
                steps * CONCURRENCY_RELIABILITY_FACTOR.powi(extra)
            })
            .product();

        Estimate {
            time_ms,
            cost,
            reliability,
        }
    }

    /// Whether every group is internally independent and every step's
    /// scheduled prerequisites sit in earlier groups.
    pub fn is_valid(&self, schedule: &Schedule) -> bool {
        let mut placed = vec![None; self.len()];
        for (g, group) in schedule.groups.iter().enumerate() {
            for &i in group {
                if placed[i].is_some() {
                    return false;
                }
                placed[i] = Some(g);
            }
        }
        schedule.groups.iter().enumerate().all(|(g, group)| {
            group.iter().all(|&i| {
                self.graph
                    .prerequisite_indices(i)
                    .iter()
                    .all(|&p| placed[p].is_none_or(|pg| pg < g))
                    && group.iter().all(|&j| j == i || !self.graph.connected(i, j))
            })
        })
    }

    /// Render a schedule as a plan.
    pub fn to_plan(
        &self,
        schedule: &Schedule,
        strategy: OptimizationStrategy,
        repairs: Vec<PlanRepair>,
        dropped: &[usize],
    ) -> OptimizationPlan {
        let estimate = self.estimate(schedule);
        OptimizationPlan {
            workflow_id: self.workflow_id.clone(),
            ordered_steps: schedule
                .order()
                .into_iter()
                .map(|i| self.graph.id(i).to_string())
                .collect(),
            parallel_groups: schedule
                .groups
                .iter()
                .map(|g| ParallelGroup {
                    operations: g.iter().map(|&i| self.graph.id(i).to_string()).collect(),
                    estimated_time_ms: self.group_time(g),
                })
                .collect(),
            estimated_time_ms: estimate.time_ms,
            estimated_cost: estimate.cost,
            estimated_reliability: estimate.reliability,
            strategy,
            repairs,
            dropped_steps: dropped.iter().map(|&i| self.graph.id(i).to_string()).collect(),
        }
    }
}

/// List scheduling shared by the greedy strategies.
///
/// Repeatedly opens a group and fills it with ready steps (all prerequisites
/// in closed groups) in `priority` order, while each candidate is
/// independent of the current members and the group has room.
pub fn fill_groups(profile: &PlanProfile, priority: &[usize], width: usize) -> Vec<Vec<usize>> {
    let n = profile.len();
    let mut done = vec![false; n];
    let mut remaining = n;
    let mut groups = Vec::new();

    while remaining > 0 {
        let mut group: Vec<usize> = Vec::new();
        for &i in priority {
            if group.len() >= width {
                break;
            }
            let ready = !done[i]
                && profile
                    .graph
                    .prerequisite_indices(i)
                    .iter()
                    .all(|&p| done[p]);
            if ready && profile.graph.independent_of_all(i, &group) {
                group.push(i);
            }
        }
        if group.is_empty() {
            // Unreachable for an acyclic graph; bail out rather than spin.
            break;
        }
        for &i in &group {
            done[i] = true;
        }
        remaining -= group.len();
        groups.push(group);
    }
    groups
}
