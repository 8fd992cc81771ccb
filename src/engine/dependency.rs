//! Counts, for one backward start node, how many gradient deliveries each
//! reachable node will receive.
//!
//! A consumer delivers one summed gradient to each distinct producer it reads,
//! however many of its inputs refer to that producer. The start node expects a
//! single delivery: the seed.
use crate::compute_graph::{ComputeGraph, NodeId};
use crate::graph::{InnerGraph, Node};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

/// Expected deliveries per node reachable from `start` along producer edges.
pub fn count_dependencies<G: InnerGraph>(
    graph: &G,
    start: &G::NodeId,
) -> HashMap<G::NodeId, usize> {
    let mut expected = HashMap::new();
    if graph.get_node(start).is_none() {
        return expected;
    }
    expected.insert(start.clone(), 1);
    let mut visited = HashSet::from([start.clone()]);
    let mut stack = vec![start.clone()];
    while let Some(id) = stack.pop() {
        let Some(node) = graph.get_node(&id) else {
            continue;
        };
        let mut seen = HashSet::new();
        for producer in node.producers() {
            if !seen.insert(producer.clone()) {
                continue;
            }
            *expected.entry(producer.clone()).or_insert(0) += 1;
            if visited.insert(producer.clone()) {
                stack.push(producer);
            }
        }
    }
    expected
}

/// Compiled dependency counts for one start node, dense by node index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPlan {
    start: NodeId,
    expected: Vec<usize>,
}

impl DependencyPlan {
    pub fn compile(graph: &ComputeGraph, start: NodeId) -> Self {
        let mut expected = vec![0; graph.len()];
        for (id, count) in count_dependencies(graph, &start) {
            expected[id.index()] = count;
        }
        log::debug!(
            "Compiled dependencies from {}: {} reachable nodes",
            graph.node(start).map(|n| n.qualified_id()).unwrap_or("?"),
            expected.iter().filter(|c| **c > 0).count()
        );
        Self { start, expected }
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    pub fn expected(&self, id: NodeId) -> usize {
        self.expected.get(id.index()).copied().unwrap_or(0)
    }

    pub fn is_reachable(&self, id: NodeId) -> bool {
        self.expected(id) > 0
    }

    pub fn reachable_count(&self) -> usize {
        self.expected.iter().filter(|c| **c > 0).count()
    }

    /// Stores the expected counts on the graph's nodes.
    pub(crate) fn apply(&self, graph: &ComputeGraph) {
        for node in graph.iter() {
            node.expected
                .store(self.expected(node.id()), Ordering::Release);
        }
    }
}
