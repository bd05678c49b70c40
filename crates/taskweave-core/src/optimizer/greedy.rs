//! Greedy strategies: fastest-first and cheapest-first list scheduling.

use super::profile::{PlanProfile, Schedule, fill_groups};

/// Greedy-cost only pairs steps that are mutually independent.
const ESSENTIAL_PAIR_WIDTH: usize = 2;

/// Shortest steps first, batched up to `max_parallel` per group.
pub fn by_duration(profile: &PlanProfile, max_parallel: usize) -> Schedule {
    let mut priority: Vec<usize> = (0..profile.len()).collect();
    priority.sort_by_key(|&i| profile.duration(i));
    Schedule::new(fill_groups(profile, &priority, max_parallel))
}

/// Cheapest steps first. Parallelism lowers time, not cost, so only
/// independent pairs are batched.
pub fn by_cost(profile: &PlanProfile, max_parallel: usize) -> Schedule {
    let mut priority: Vec<usize> = (0..profile.len()).collect();
    priority.sort_by(|&a, &b| profile.cost(a).total_cmp(&profile.cost(b)));
    Schedule::new(fill_groups(
        profile,
        &priority,
        max_parallel.min(ESSENTIAL_PAIR_WIDTH),
    ))
}
