//! Dependency graph analysis: cycle detection, stable topological order,
//! parallel waves, and transitive reachability.
//!
//! Uses `petgraph` to model step dependencies as a directed graph with edges
//! from prerequisite to dependent. `toposort` detects cycles, and a DFS from
//! every node precomputes the transitive closure so that "can these run in
//! parallel" queries are O(group size).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use taskweave_types::workflow::WorkflowDefinition;

use super::definition::WorkflowError;

/// Validated dependency DAG over a set of step IDs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    prerequisites: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// `reach[a][b]` is true when `b` transitively depends on `a`.
    reach: Vec<Vec<bool>>,
}

impl DependencyGraph {
    /// Build a graph from `(step_id, prerequisites)` pairs in declaration order.
    ///
    /// Fails on unknown dependencies and on cycles (including self-loops).
    pub fn new(nodes: Vec<(String, Vec<String>)>) -> Result<Self, WorkflowError> {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), i))
            .collect();

        let mut prerequisites = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];

        let mut graph = DiGraph::<usize, ()>::new();
        let node_indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

        for (to, (id, deps)) in nodes.iter().enumerate() {
            for dep in deps {
                let from = *index.get(dep).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        id, dep
                    ))
                })?;
                if prerequisites[to].contains(&from) {
                    continue;
                }
                prerequisites[to].push(from);
                dependents[from].push(to);
                graph.add_edge(node_indices[from], node_indices[to], ());
            }
        }

        // Topological sort -- detects cycles
        toposort(&graph, None).map_err(|cycle| {
            let id = &nodes[graph[cycle.node_id()]].0;
            WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", id))
        })?;

        let mut reach = vec![vec![false; nodes.len()]; nodes.len()];
        for (from, row) in reach.iter_mut().enumerate() {
            let mut dfs = Dfs::new(&graph, node_indices[from]);
            while let Some(nx) = dfs.next(&graph) {
                let to = graph[nx];
                if to != from {
                    row[to] = true;
                }
            }
        }

        Ok(Self {
            ids: nodes.into_iter().map(|(id, _)| id).collect(),
            index,
            prerequisites,
            dependents,
            reach,
        })
    }

    /// Build the graph of a workflow definition (step-level plus workflow-level edges).
    pub fn from_definition(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        Self::new(
            def.steps
                .iter()
                .map(|s| (s.id.clone(), def.prerequisites(&s.id)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Step IDs in declaration order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.index.get(step_id).copied()
    }

    pub fn id(&self, index: usize) -> &str {
        &self.ids[index]
    }

    /// Direct prerequisites of the step at `index`.
    pub fn prerequisite_indices(&self, index: usize) -> &[usize] {
        &self.prerequisites[index]
    }

    /// Direct dependents of the step at `index`.
    pub fn dependent_indices(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Whether `later` transitively depends on `earlier` (by index).
    pub fn reaches(&self, earlier: usize, later: usize) -> bool {
        self.reach[earlier][later]
    }

    /// Whether a dependency path connects the two steps in either direction.
    pub fn connected(&self, a: usize, b: usize) -> bool {
        self.reach[a][b] || self.reach[b][a]
    }

    /// Whether `step_id` transitively depends on `dependency_id`.
    pub fn depends_on(&self, step_id: &str, dependency_id: &str) -> bool {
        match (self.index_of(dependency_id), self.index_of(step_id)) {
            (Some(dep), Some(step)) => self.reach[dep][step],
            _ => false,
        }
    }

    /// True only if no direct or transitive dependency path connects `step_id`
    /// with any member of `group`, in either direction.
    ///
    /// Unknown IDs are never parallel-safe.
    pub fn can_run_in_parallel<S: AsRef<str>>(&self, step_id: &str, group: &[S]) -> bool {
        let Some(a) = self.index_of(step_id) else {
            return false;
        };
        group.iter().all(|member| match self.index_of(member.as_ref()) {
            Some(b) => a != b && !self.connected(a, b),
            None => false,
        })
    }

    /// Index-based variant of [`can_run_in_parallel`](Self::can_run_in_parallel).
    pub fn independent_of_all(&self, index: usize, group: &[usize]) -> bool {
        group.iter().all(|&b| b != index && !self.connected(index, b))
    }

    /// Stable topological order: among ready steps, declaration order wins.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self.prerequisites.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some(Reverse(next)) = ready.pop() {
            order.push(self.ids[next].clone());
            for &dep in &self.dependents[next] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    ready.push(Reverse(dep));
                }
            }
        }
        order
    }

    /// Group steps into waves by dependency depth.
    ///
    /// Every step in a wave has all prerequisites in earlier waves, so the
    /// members of one wave are mutually independent.
    pub fn execution_waves(&self) -> Vec<Vec<String>> {
        if self.ids.is_empty() {
            return vec![];
        }

        let mut depths: Vec<Option<usize>> = vec![None; self.ids.len()];
        for id in self.topological_order() {
            let i = self.index[&id];
            let depth = self.prerequisites[i]
                .iter()
                .map(|&p| depths[p].unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths[i] = Some(depth);
        }

        let max_depth = depths.iter().flatten().copied().max().unwrap_or(0);
        let mut waves: Vec<Vec<String>> = vec![vec![]; max_depth + 1];
        for (i, id) in self.ids.iter().enumerate() {
            waves[depths[i].unwrap_or(0)].push(id.clone());
        }
        waves
    }

    /// The transitive closure of a step's prerequisites, in declaration order.
    ///
    /// Unknown steps have no prerequisites.
    pub fn transitive_prerequisites(&self, step_id: &str) -> Vec<&str> {
        let Some(step) = self.index_of(step_id) else {
            return vec![];
        };
        (0..self.ids.len())
            .filter(|&i| self.reach[i][step])
            .map(|i| self.ids[i].as_str())
            .collect()
    }

    /// Whether `order` lists known steps, each at most once, with every
    /// prerequisite that is also in `order` appearing earlier.
    pub fn respects_order<S: AsRef<str>>(&self, order: &[S]) -> bool {
        let mut seen = HashSet::new();
        let included: HashSet<usize> = order
            .iter()
            .filter_map(|id| self.index_of(id.as_ref()))
            .collect();
        for id in order {
            let Some(i) = self.index_of(id.as_ref()) else {
                return false;
            };
            let ready = self.prerequisites[i]
                .iter()
                .all(|p| !included.contains(p) || seen.contains(p));
            if !ready || !seen.insert(i) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: build a graph from `(id, deps)` literals.
    fn graph(nodes: &[(&str, &[&str])]) -> Result<DependencyGraph, WorkflowError> {
        DependencyGraph::new(
            nodes
                .iter()
                .map(|(id, deps)| {
                    (
                        id.to_string(),
                        deps.iter().map(|d| d.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }

    // -----------------------------------------------------------------------
    // Wave computation
    // -----------------------------------------------------------------------

    #[test]
    fn test_no_dependencies_single_wave() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &[])]).unwrap();
        let waves = g.execution_waves();
        assert_eq!(waves.len(), 1, "all independent steps -> single wave");
        assert_eq!(waves[0], vec!["a", "b", "c"]);
    }

    #[test]
    fn test_diamond_three_waves() {
        // A -> {B, C} -> D
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]).unwrap();
        let waves = g.execution_waves();
        assert_eq!(waves, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_empty_graph() {
        let g = graph(&[]).unwrap();
        assert!(g.is_empty());
        assert!(g.execution_waves().is_empty());
        assert!(g.topological_order().is_empty());
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn test_cycle_detected() {
        let err = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
        assert!(err.to_string().contains("cycle detected"), "got: {err}");
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let err = graph(&[("a", &["a"])]).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = graph(&[("a", &["missing"])]).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"), "got: {err}");
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn test_topological_order_is_stable() {
        // Declared out of dependency order; ready steps keep declaration order.
        let g = graph(&[("report", &["fetch"]), ("auth", &[]), ("fetch", &["auth"]), ("audit", &[])])
            .unwrap();
        assert_eq!(g.topological_order(), vec!["auth", "fetch", "report", "audit"]);
        assert_eq!(g.topological_order(), g.topological_order());
    }

    #[test]
    fn test_respects_order() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]).unwrap();
        assert!(g.respects_order(&["a", "b", "c"]));
        assert!(!g.respects_order(&["b", "a", "c"]));
        assert!(!g.respects_order(&["a", "a", "b"]));
        assert!(!g.respects_order(&["a", "zzz"]));
        // Omitted prerequisites do not make a subset invalid.
        assert!(g.respects_order(&["a", "c"]));
    }

    // -----------------------------------------------------------------------
    // Transitive closure and parallel safety
    // -----------------------------------------------------------------------

    #[test]
    fn test_transitive_prerequisites() {
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &["c"])]).unwrap();
        assert_eq!(g.transitive_prerequisites("d"), vec!["a", "b", "c"]);
        assert!(g.transitive_prerequisites("a").is_empty());
        assert!(g.transitive_prerequisites("nonexistent").is_empty());
        assert!(g.depends_on("d", "a"));
        assert!(!g.depends_on("a", "d"));
    }

    #[test]
    fn test_can_run_in_parallel_uses_transitive_closure() {
        // a -> b -> c, d independent
        let g = graph(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]).unwrap();
        // No direct edge between a and c, but a transitive one.
        assert!(!g.can_run_in_parallel("a", &["c"]));
        assert!(!g.can_run_in_parallel("c", &["a"]));
        assert!(g.can_run_in_parallel("d", &["a", "b", "c"][..1]));
        assert!(g.can_run_in_parallel("d", &["c"]));
        assert!(!g.can_run_in_parallel("d", &["c", "a", "d"]));
        assert!(!g.can_run_in_parallel("unknown", &["a"]));
        assert!(g.can_run_in_parallel::<&str>("a", &[]));
    }

    #[test]
    fn test_can_run_in_parallel_is_symmetric() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b"]),
            ("e", &["c"]),
            ("f", &["d", "e"]),
            ("g", &[]),
        ])
        .unwrap();
        for x in g.ids() {
            for y in g.ids() {
                if x == y {
                    continue;
                }
                assert_eq!(
                    g.can_run_in_parallel(x, &[y]),
                    g.can_run_in_parallel(y, &[x]),
                    "asymmetric for {x}/{y}"
                );
            }
        }
        assert!(g.can_run_in_parallel("d", &["e", "g"]));
        assert!(!g.can_run_in_parallel("a", &["f"]));
    }

    #[test]
    fn test_complex_fork_join_waves() {
        //     A
        //    / \
        //   B   C
        //   |   |
        //   D   E
        //    \ /
        //     F
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b"]),
            ("e", &["c"]),
            ("f", &["d", "e"]),
        ])
        .unwrap();
        let waves = g.execution_waves();
        assert_eq!(waves.len(), 4);
        assert_eq!(waves[1].len(), 2);
        assert_eq!(waves[2].len(), 2);
        assert_eq!(waves[3], vec!["f"]);
    }
}
