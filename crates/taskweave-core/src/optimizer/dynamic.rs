//! Exhaustive subset search.
//!
//! For every subset of steps (as a bitmask), the best sub-schedule is built
//! from every split into two halves, combined either sequentially (when the
//! first half never depends on the second) or in parallel (when every cross
//! pair is independent and the merged groups fit the parallel limit). Scored
//! by `cost + normalized_time`, lower is better.

use super::OptimizerError;
use super::profile::{PlanProfile, Schedule};

/// Largest workflow the subset search accepts.
pub const DP_MAX_STEPS: usize = 10;

#[derive(Debug, Clone)]
struct Entry {
    groups: Vec<Vec<usize>>,
    score: f64,
}

pub fn schedule(profile: &PlanProfile, max_parallel: usize) -> Result<Schedule, OptimizerError> {
    let n = profile.len();
    if n > DP_MAX_STEPS {
        return Err(OptimizerError::TooLargeForExhaustiveSearch {
            steps: n,
            max: DP_MAX_STEPS,
        });
    }

    let time_scale = profile.sequential_time().max(1) as f64;
    let score = |groups: &[Vec<usize>]| -> f64 {
        let cost: f64 = groups.iter().flatten().map(|&i| profile.cost(i)).sum();
        let time: u64 = groups
            .iter()
            .map(|g| g.iter().map(|&i| profile.duration(i)).max().unwrap_or(0))
            .sum();
        cost + time as f64 / time_scale
    };

    let members = |mask: usize| -> Vec<usize> { (0..n).filter(|&i| mask & (1 << i) != 0).collect() };

    let full = (1usize << n) - 1;
    let mut best: Vec<Option<Entry>> = vec![None; full + 1];
    for i in 0..n {
        let groups = vec![vec![i]];
        best[1 << i] = Some(Entry {
            score: score(&groups),
            groups,
        });
    }

    for mask in 1..=full {
        if mask.count_ones() < 2 {
            continue;
        }
        let mut winner: Option<Entry> = None;

        // Enumerate proper non-empty submasks as the first half.
        let mut first = (mask - 1) & mask;
        while first > 0 {
            let second = mask & !first;
            if let (Some(a), Some(b)) = (&best[first], &best[second]) {
                let (a_steps, b_steps) = (members(first), members(second));

                let sequential_ok = a_steps
                    .iter()
                    .all(|&x| b_steps.iter().all(|&y| !profile.graph.reaches(y, x)));
                if sequential_ok {
                    let groups: Vec<Vec<usize>> =
                        a.groups.iter().chain(b.groups.iter()).cloned().collect();
                    consider(&mut winner, groups, &score);
                }

                let independent = a_steps
                    .iter()
                    .all(|&x| b_steps.iter().all(|&y| !profile.graph.connected(x, y)));
                if independent && let Some(groups) = zip_groups(&a.groups, &b.groups, max_parallel) {
                    consider(&mut winner, groups, &score);
                }
            }
            first = (first - 1) & mask;
        }
        best[mask] = winner;
    }

    let groups = best[full]
        .take()
        .map(|e| e.groups)
        .unwrap_or_else(|| (0..n).map(|i| vec![i]).collect());
    Ok(Schedule::new(groups))
}

fn consider(winner: &mut Option<Entry>, groups: Vec<Vec<usize>>, score: &impl Fn(&[Vec<usize>]) -> f64) {
    let s = score(&groups);
    if winner.as_ref().is_none_or(|w| s < w.score - 1e-12) {
        *winner = Some(Entry { groups, score: s });
    }
}

/// Merge two independent sub-schedules group by group.
fn zip_groups(a: &[Vec<usize>], b: &[Vec<usize>], max_parallel: usize) -> Option<Vec<Vec<usize>>> {
    let len = a.len().max(b.len());
    let mut merged = Vec::with_capacity(len);
    for k in 0..len {
        let mut group: Vec<usize> = a.get(k).cloned().unwrap_or_default();
        group.extend(b.get(k).into_iter().flatten().copied());
        if group.len() > max_parallel {
            return None;
        }
        group.sort_unstable();
        merged.push(group);
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::profile::tests::profile;

    #[test]
    fn independent_pair_runs_in_parallel() {
        let p = profile(&[("a", 500, 2.0, &[]), ("b", 700, 3.0, &[])]);
        let schedule = schedule(&p, 3).unwrap();
        assert_eq!(schedule.groups, vec![vec![0, 1]]);
        let e = p.estimate(&schedule);
        assert!((e.cost - 5.0).abs() < 1e-9);
        assert_eq!(e.time_ms, 700);
    }

    #[test]
    fn parallel_limit_of_one_serializes() {
        let p = profile(&[("a", 500, 2.0, &[]), ("b", 700, 3.0, &[])]);
        let schedule = schedule(&p, 1).unwrap();
        assert_eq!(schedule.groups.len(), 2);
        assert_eq!(p.estimate(&schedule).time_ms, 1200);
    }

    #[test]
    fn respects_dependencies() {
        let p = profile(&[
            ("a", 100, 1.0, &[]),
            ("b", 300, 1.0, &["a"]),
            ("c", 200, 1.0, &[]),
            ("d", 100, 1.0, &["b", "c"]),
        ]);
        let schedule = schedule(&p, 2).unwrap();
        assert!(p.is_valid(&schedule));
        assert_eq!(schedule.len(), 4);
        // a, then b || c, then d
        assert_eq!(schedule.groups, vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(p.estimate(&schedule).time_ms, 500);
    }

    #[test]
    fn too_large_rejected() {
        let steps: Vec<(String, u64, f64, Vec<&str>)> = (0..11)
            .map(|i| (format!("s{i}"), 10, 1.0, vec![]))
            .collect();
        let refs: Vec<(&str, u64, f64, &[&str])> = steps
            .iter()
            .map(|(id, ms, c, d)| (id.as_str(), *ms, *c, d.as_slice()))
            .collect();
        let p = profile(&refs);
        assert!(matches!(
            schedule(&p, 3),
            Err(OptimizerError::TooLargeForExhaustiveSearch { steps: 11, max: 10 })
        ));
    }
}
