//! Dependency graph over pipeline stages.
//!
//! Edges point from an upstream stage to the stage that depends on it. The
//! graph is validated once at construction: duplicate ids, references to
//! unknown stages and cycles are all rejected before any run exists.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::pipeline::DefinitionError;

/// What happens to a downstream stage when its upstream stage fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Downstream is blocked and skipped; it never starts
    #[serde(alias = "FAIL_TO_START")]
    FailToStart,

    /// Downstream proceeds as if the dependency had succeeded
    #[serde(alias = "IGNORE")]
    Ignore,

    /// Downstream is marked failed without running
    #[serde(alias = "CASCADE_FAIL")]
    CascadeFail,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::FailToStart
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailToStart => "fail_to_start",
            Self::Ignore => "ignore",
            Self::CascadeFail => "cascade_fail",
        };
        f.write_str(s)
    }
}

/// A dependency between two stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// Upstream stage id
    pub from: String,

    /// Downstream stage id
    pub to: String,

    pub policy: FailurePolicy,

    /// Artifact rules pulled from `from` before `to` runs
    pub artifacts: Vec<String>,
}

/// Validated directed acyclic graph of stages
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Stage ids in declaration order
    stages: Vec<String>,

    /// Stage id -> declaration index
    index: HashMap<String, usize>,

    edges: Vec<DependencyEdge>,

    /// Edge indices grouped by downstream stage
    upstream: Vec<Vec<usize>>,

    /// Edge indices grouped by upstream stage
    downstream: Vec<Vec<usize>>,

    /// Deterministic topological order
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build and validate a graph
    pub fn new(stages: Vec<String>, edges: Vec<DependencyEdge>) -> Result<Self, DefinitionError> {
        let mut index = HashMap::with_capacity(stages.len());
        for (i, id) in stages.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateStage(id.clone()));
            }
        }

        let mut upstream = vec![Vec::new(); stages.len()];
        let mut downstream = vec![Vec::new(); stages.len()];

        for (edge_idx, edge) in edges.iter().enumerate() {
            let to = *index
                .get(&edge.to)
                .ok_or_else(|| DefinitionError::UnknownDownstream {
                    stage: edge.from.clone(),
                    downstream: edge.to.clone(),
                })?;
            let from = *index
                .get(&edge.from)
                .ok_or_else(|| DefinitionError::UnknownStage {
                    stage: edge.to.clone(),
                    dependency: edge.from.clone(),
                })?;
            upstream[to].push(edge_idx);
            downstream[from].push(edge_idx);
        }

        let mut graph = Self {
            stages,
            index,
            edges,
            upstream,
            downstream,
            order: Vec::new(),
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(DefinitionError::CycleDetected { cycle });
        }

        graph.order = graph.compute_order();
        Ok(graph)
    }

    /// Depth-first search tracking the recursion stack; returns the first
    /// cycle found as a closed path (first id repeated at the end).
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::OnStack;
            stack.push(node);

            for &edge_idx in &graph.downstream[node] {
                let next = graph.index[&graph.edges[edge_idx].to];
                match marks[next] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&n| graph.stages[n].clone())
                            .collect();
                        cycle.push(graph.stages[next].clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, next, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks[node] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.stages.len()];
        let mut stack = Vec::new();

        for node in 0..self.stages.len() {
            if marks[node] == Mark::Unvisited {
                if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn's algorithm; ties broken by declaration order
    fn compute_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(node) = ready.pop_first() {
            order.push(self.stages[node].clone());
            for &edge_idx in &self.downstream[node] {
                let next = self.index[&self.edges[edge_idx].to];
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }
        order
    }

    /// Stage ids in declaration order
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Execution order: every stage appears after all of its dependencies
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Edges whose downstream end is `stage_id`
    pub fn upstream(&self, stage_id: &str) -> impl Iterator<Item = &DependencyEdge> + '_ {
        self.index
            .get(stage_id)
            .map(|&i| self.upstream[i].as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&e| &self.edges[e])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
