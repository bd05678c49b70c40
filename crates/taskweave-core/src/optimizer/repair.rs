//! Post-optimization validation and repair.
//!
//! Runs after every strategy, in a fixed order:
//! 1. oversized groups are split, overflow moving into a following group
//! 2. time and cost overruns drop the lowest-priority leaf steps
//! 3. a reliability shortfall serializes parallel groups when that fixes it
//!
//! Whatever cannot be repaired is recorded as `RepairAction::Unresolved`.
//! Every repair is logged and returned; nothing is changed silently.

use taskweave_types::optimization::{ConstraintKind, Constraints, PlanRepair, RepairAction};

use super::profile::{Estimate, PlanProfile, Schedule};

/// Repairs applied to a schedule plus the steps removed from it.
#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub repairs: Vec<PlanRepair>,
    pub dropped: Vec<usize>,
}

pub fn repair(profile: &PlanProfile, schedule: &mut Schedule, constraints: &Constraints) -> RepairOutcome {
    let mut outcome = RepairOutcome::default();
    split_oversized(profile, schedule, constraints.parallel_limit(), &mut outcome);

    if let Some(max) = constraints.max_execution_time_ms {
        drop_until(
            profile,
            schedule,
            ConstraintKind::MaxExecutionTime,
            |e| e.time_ms <= max,
            &format!("estimated time exceeds {} ms", max),
            &mut outcome,
        );
    }
    if let Some(max) = constraints.max_total_cost {
        drop_until(
            profile,
            schedule,
            ConstraintKind::MaxTotalCost,
            |e| e.cost <= max + f64::EPSILON,
            &format!("estimated cost exceeds {}", max),
            &mut outcome,
        );
    }
    if let Some(min) = constraints.min_reliability {
        serialize_for_reliability(profile, schedule, constraints, min, &mut outcome);
    }

    outcome
}

fn record(outcome: &mut RepairOutcome, repair: PlanRepair) {
    tracing::warn!(
        constraint = ?repair.constraint,
        action = ?repair.action,
        steps = ?repair.affected_steps,
        detail = repair.detail.as_str(),
        "plan repaired"
    );
    outcome.repairs.push(repair);
}

fn ids(profile: &PlanProfile, indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| profile.graph.id(i).to_string()).collect()
}

fn split_oversized(
    profile: &PlanProfile,
    schedule: &mut Schedule,
    limit: usize,
    outcome: &mut RepairOutcome,
) {
    let mut split = Vec::new();
    let mut groups = Vec::with_capacity(schedule.groups.len());
    for group in std::mem::take(&mut schedule.groups) {
        if group.len() <= limit {
            groups.push(group);
            continue;
        }
        split.extend_from_slice(&group[limit..]);
        groups.extend(group.chunks(limit).map(<[usize]>::to_vec));
    }
    schedule.groups = groups;

    if !split.is_empty() {
        record(
            outcome,
            PlanRepair {
                constraint: ConstraintKind::MaxParallelOperations,
                action: RepairAction::SplitGroup,
                affected_steps: ids(profile, &split),
                detail: format!("groups split to at most {} operations", limit),
            },
        );
    }
}

/// A scheduled step nothing else scheduled depends on.
fn is_leaf(profile: &PlanProfile, schedule: &Schedule, index: usize) -> bool {
    profile
        .graph
        .dependent_indices(index)
        .iter()
        .all(|&d| !schedule.contains(d))
}

/// Lowest priority first; among equals, the later-declared step.
fn next_drop(profile: &PlanProfile, schedule: &Schedule) -> Option<usize> {
    if schedule.len() <= 1 {
        return None;
    }
    schedule
        .order()
        .into_iter()
        .filter(|&i| is_leaf(profile, schedule, i))
        .min_by_key(|&i| (profile.estimates[i].priority, std::cmp::Reverse(i)))
}

fn drop_until(
    profile: &PlanProfile,
    schedule: &mut Schedule,
    constraint: ConstraintKind,
    within: impl Fn(&Estimate) -> bool,
    detail: &str,
    outcome: &mut RepairOutcome,
) {
    if within(&profile.estimate(schedule)) {
        return;
    }

    let mut dropped = Vec::new();
    while !within(&profile.estimate(schedule)) {
        let Some(victim) = next_drop(profile, schedule) else {
            break;
        };
        schedule.remove(victim);
        dropped.push(victim);
    }

    if !dropped.is_empty() {
        record(
            outcome,
            PlanRepair {
                constraint,
                action: RepairAction::DroppedSteps,
                affected_steps: ids(profile, &dropped),
                detail: format!("{}; dropped lowest-priority steps", detail),
            },
        );
        outcome.dropped.extend_from_slice(&dropped);
    }
    if !within(&profile.estimate(schedule)) {
        record(
            outcome,
            PlanRepair {
                constraint,
                action: RepairAction::Unresolved,
                affected_steps: vec![],
                detail: format!("{}; no droppable steps remain", detail),
            },
        );
    }
}

fn serialize_for_reliability(
    profile: &PlanProfile,
    schedule: &mut Schedule,
    constraints: &Constraints,
    min: f64,
    outcome: &mut RepairOutcome,
) {
    let meets = |e: &Estimate| e.reliability + f64::EPSILON >= min;
    let current = profile.estimate(schedule);
    if meets(&current) {
        return;
    }

    let parallel: Vec<usize> = schedule
        .groups
        .iter()
        .filter(|g| g.len() > 1)
        .flatten()
        .copied()
        .collect();
    if !parallel.is_empty() {
        // One step at a time: nothing overlaps any more.
        let serialized = Schedule::new(schedule.order().into_iter().map(|i| vec![i]).collect());
        let estimate = profile.estimate(&serialized);
        let time_ok = constraints
            .max_execution_time_ms
            .is_none_or(|max| estimate.time_ms <= max || current.time_ms > max);
        if meets(&estimate) && time_ok {
            *schedule = serialized;
            record(
                outcome,
                PlanRepair {
                    constraint: ConstraintKind::MinReliability,
                    action: RepairAction::Serialized,
                    affected_steps: ids(profile, &parallel),
                    detail: format!("parallel groups serialized to reach reliability {}", min),
                },
            );
            return;
        }
    }

    record(
        outcome,
        PlanRepair {
            constraint: ConstraintKind::MinReliability,
            action: RepairAction::Unresolved,
            affected_steps: vec![],
            detail: format!(
                "estimated reliability {:.4} below {}",
                current.reliability, min
            ),
        },
    );
}
