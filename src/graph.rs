//! Backbone traits shared by the runtime graph and the passes that walk it.
//!
//! The dependency compiler and the topology checks only need to know which nodes
//! a node consumes and in what order nodes execute, so they are written against
//! these traits rather than the concrete `ComputeGraph`.
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Node within a graph, viewed through the producers it consumes.
pub trait Node<NodeIdT: Clone + Eq + Hash + Debug> {
    /// Producer handles in input index order. A producer consumed in several
    /// positions appears once per position.
    fn producers(&self) -> impl Iterator<Item = NodeIdT>;
}

/// The inner structure of a graph: node handles plus execution order.
pub trait InnerGraph {
    type NodeId: Clone + Eq + Hash + Debug;
    type AnyNode: Node<Self::NodeId>;

    /// Deterministic iteration over node handles.
    fn nodes(&self) -> impl Iterator<Item = Self::NodeId>;

    fn get_node(&self, id: &Self::NodeId) -> Option<&Self::AnyNode>;

    /// Execution order starting at `start`, if `start` is part of the graph.
    fn execution_order_from(&self, start: &Self::NodeId) -> Option<Vec<Self::NodeId>>;
}

/// First `(consumer, producer)` pair in which the producer does not execute
/// before its consumer, if any.
pub fn find_order_violation<G: InnerGraph>(
    graph: &G,
    start: &G::NodeId,
) -> Option<(G::NodeId, G::NodeId)> {
    let order = graph.execution_order_from(start)?;
    let position: HashMap<G::NodeId, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();
    for (i, id) in order.iter().enumerate() {
        let node = graph.get_node(id)?;
        for producer in node.producers() {
            match position.get(&producer) {
                Some(p) if *p < i => {}
                _ => return Some((id.clone(), producer)),
            }
        }
    }
    None
}
