//! Genetic search over step orderings and group breaks.
//!
//! A chromosome is a priority permutation plus one "break before" flag per
//! step. Decoding walks the priority-respecting topological order and opens
//! a new group on a break flag, a full group, or a dependency on a current
//! member, so every chromosome decodes to a valid schedule.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use taskweave_types::optimization::{Constraints, OptimizationTarget};

use super::profile::{PlanProfile, Schedule};

const POPULATION: usize = 20;
const GENERATIONS: usize = 25;
const ELITE: usize = 4;
const MUTATION_RATE: f64 = 0.1;
const BREAK_RATE: f64 = 0.3;
/// Added to the fitness of a schedule per violated limit.
const VIOLATION_PENALTY: f64 = 1.0;

/// Relative weight of time, cost, and unreliability in the fitness score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub time: f64,
    pub cost: f64,
    pub reliability: f64,
}

impl Weights {
    pub fn for_target(target: OptimizationTarget) -> Self {
        let (time, cost, reliability) = match target {
            OptimizationTarget::Speed => (0.7, 0.2, 0.1),
            OptimizationTarget::Cost => (0.2, 0.7, 0.1),
            OptimizationTarget::Reliability => (0.2, 0.1, 0.7),
            OptimizationTarget::Balanced => (0.4, 0.3, 0.3),
        };
        Self {
            time,
            cost,
            reliability,
        }
    }
}

#[derive(Debug, Clone)]
struct Chromosome {
    order: Vec<usize>,
    /// Indexed by step, not by position.
    breaks: Vec<bool>,
}

impl Chromosome {
    fn random(n: usize, rng: &mut StdRng) -> Self {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let breaks = (0..n).map(|_| rng.random_bool(BREAK_RATE)).collect();
        Self { order, breaks }
    }

    /// Order crossover: `self`'s prefix, then `other`'s remaining genes in its order.
    fn crossover(&self, other: &Self, rng: &mut StdRng) -> Self {
        let n = self.order.len();
        let point = if n > 1 { rng.random_range(1..n) } else { n };
        let mut order: Vec<usize> = self.order[..point].to_vec();
        let mut taken = vec![false; n];
        for &g in &order {
            taken[g] = true;
        }
        order.extend(other.order.iter().copied().filter(|&g| !taken[g]));
        let breaks = (0..n)
            .map(|i| if taken[i] { self.breaks[i] } else { other.breaks[i] })
            .collect();
        Self { order, breaks }
    }

    fn mutate(&mut self, rng: &mut StdRng) {
        let n = self.order.len();
        if n < 2 {
            return;
        }
        if rng.random_bool(MUTATION_RATE) {
            let (a, b) = (rng.random_range(0..n), rng.random_range(0..n));
            self.order.swap(a, b);
        }
        if rng.random_bool(MUTATION_RATE) {
            let i = rng.random_range(0..n);
            self.breaks[i] = !self.breaks[i];
        }
    }

    fn decode(&self, profile: &PlanProfile, max_parallel: usize) -> Schedule {
        let n = self.order.len();
        let mut rank = vec![0; n];
        for (pos, &g) in self.order.iter().enumerate() {
            rank[g] = pos;
        }

        let mut done = vec![false; n];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();

        for _ in 0..n {
            // Highest-priority step whose prerequisites are all placed.
            let Some(next) = (0..n)
                .filter(|&i| !done[i] && !current.contains(&i))
                .filter(|&i| {
                    profile
                        .graph
                        .prerequisite_indices(i)
                        .iter()
                        .all(|&p| done[p] || current.contains(&p))
                })
                .min_by_key(|&i| rank[i])
            else {
                break;
            };

            let must_close = !current.is_empty()
                && (self.breaks[next]
                    || current.len() >= max_parallel
                    || !profile.graph.independent_of_all(next, &current));
            if must_close {
                for &i in &current {
                    done[i] = true;
                }
                groups.push(std::mem::take(&mut current));
            }
            current.push(next);
        }
        if !current.is_empty() {
            groups.push(current);
        }
        Schedule::new(groups)
    }
}

/// Evolve a schedule for `profile`. The same `seed` always yields the same schedule.
pub fn schedule(
    profile: &PlanProfile,
    constraints: &Constraints,
    target: OptimizationTarget,
    seed: u64,
) -> Schedule {
    let n = profile.len();
    let max_parallel = constraints.parallel_limit();
    let weights = Weights::for_target(target);
    let mut rng = StdRng::seed_from_u64(seed);

    let time_scale = profile.sequential_time().max(1) as f64;
    let cost_scale = profile.total_cost().max(f64::EPSILON);
    let fitness = |s: &Schedule| -> f64 {
        let e = profile.estimate(s);
        let mut score = weights.time * (e.time_ms as f64 / time_scale)
            + weights.cost * (e.cost / cost_scale)
            + weights.reliability * (1.0 - e.reliability);
        if constraints.max_execution_time_ms.is_some_and(|max| e.time_ms > max) {
            score += VIOLATION_PENALTY;
        }
        if constraints.max_total_cost.is_some_and(|max| e.cost > max + f64::EPSILON) {
            score += VIOLATION_PENALTY;
        }
        if constraints
            .min_reliability
            .is_some_and(|min| e.reliability + f64::EPSILON < min)
        {
            score += VIOLATION_PENALTY;
        }
        score
    };

    // Seed the population with the declaration order, unbroken.
    let mut population: Vec<Chromosome> = Vec::with_capacity(POPULATION);
    population.push(Chromosome {
        order: (0..n).collect(),
        breaks: vec![false; n],
    });
    while population.len() < POPULATION {
        population.push(Chromosome::random(n, &mut rng));
    }

    let rank = |population: Vec<Chromosome>| -> Vec<(f64, Chromosome)> {
        let mut scored: Vec<(f64, Chromosome)> = population
            .into_iter()
            .map(|c| (fitness(&c.decode(profile, max_parallel)), c))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored
    };

    let mut scored = rank(population);
    for generation in 0..GENERATIONS {
        let mut next: Vec<Chromosome> = scored.iter().take(ELITE).map(|(_, c)| c.clone()).collect();
        while next.len() < POPULATION {
            let a = tournament(&scored, &mut rng);
            let b = tournament(&scored, &mut rng);
            let mut child = a.crossover(b, &mut rng);
            child.mutate(&mut rng);
            next.push(child);
        }
        scored = rank(next);
        tracing::trace!(generation, best = scored[0].0, "genetic generation");
    }

    scored[0].1.decode(profile, max_parallel)
}

/// Better of two random picks.
fn tournament<'a>(scored: &'a [(f64, Chromosome)], rng: &mut StdRng) -> &'a Chromosome {
    let a = rng.random_range(0..scored.len());
    let b = rng.random_range(0..scored.len());
    // `scored` is sorted, so the lower index is the fitter one.
    &scored[a.min(b)].1
}
