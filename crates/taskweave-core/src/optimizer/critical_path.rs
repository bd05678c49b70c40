//! Critical-path scheduling.
//!
//! Finds the longest duration-weighted dependency chain, then builds rounds:
//! each round takes the ready chain step (if any) plus the longest ready
//! off-path steps up to the parallel limit. Time is estimated as the chain
//! overlapping the packed off-path work.

use super::profile::{PlanProfile, Schedule, TimeModel};

/// Indices on the longest chain, flagged per step.
pub fn critical_steps(profile: &PlanProfile) -> Vec<bool> {
    let n = profile.len();
    let mut finish = vec![0u64; n];
    let mut via: Vec<Option<usize>> = vec![None; n];

    for id in profile.graph.topological_order() {
        let Some(i) = profile.graph.index_of(&id) else {
            continue;
        };
        let best = profile
            .graph
            .prerequisite_indices(i)
            .iter()
            .copied()
            .max_by_key(|&p| (finish[p], std::cmp::Reverse(p)));
        finish[i] = profile.duration(i) + best.map_or(0, |p| finish[p]);
        via[i] = best;
    }

    let mut critical = vec![false; n];
    let end = (0..n).max_by_key(|&i| (finish[i], std::cmp::Reverse(i)));
    let mut cursor = end;
    while let Some(i) = cursor {
        critical[i] = true;
        cursor = via[i];
    }
    critical
}

/// Total duration of the longest chain.
pub fn critical_path_time(profile: &PlanProfile, critical: &[bool]) -> u64 {
    (0..profile.len())
        .filter(|&i| critical[i])
        .map(|i| profile.duration(i))
        .sum()
}

pub fn schedule(profile: &PlanProfile, max_parallel: usize) -> Schedule {
    let n = profile.len();
    let critical = critical_steps(profile);

    // Off-path candidates, longest first; ties by declaration order.
    let mut off_path: Vec<usize> = (0..n).filter(|&i| !critical[i]).collect();
    off_path.sort_by_key(|&i| std::cmp::Reverse(profile.duration(i)));

    let mut done = vec![false; n];
    let mut remaining = n;
    let mut groups = Vec::new();
    let ready = |i: usize, done: &[bool]| {
        !done[i]
            && profile
                .graph
                .prerequisite_indices(i)
                .iter()
                .all(|&p| done[p])
    };

    while remaining > 0 {
        let mut group: Vec<usize> = Vec::new();
        if let Some(c) = (0..n).find(|&i| critical[i] && ready(i, &done)) {
            group.push(c);
        }
        for &i in &off_path {
            if group.len() >= max_parallel {
                break;
            }
            if ready(i, &done) && profile.graph.independent_of_all(i, &group) {
                group.push(i);
            }
        }
        if group.is_empty() {
            break;
        }
        for &i in &group {
            done[i] = true;
        }
        remaining -= group.len();
        groups.push(group);
    }

    Schedule {
        groups,
        time_model: TimeModel::Overlapped { critical },
    }
}
