//! The runtime graph: one node per template operation per layer coordinate.
//!
//! Nodes live in an arena whose order is the execution order. Every input
//! reference is resolved while the graph is built, so a node can only consume
//! nodes that precede it and the order is topological by construction.
use crate::binding::{
    BindingCategory, BindingError, BindingTable, GradientSink, SharedTensor,
};
use crate::graph::{InnerGraph, find_order_violation};
use crate::primitives::Arity;
use crate::template::TemplateError;
use std::collections::HashMap;

pub mod builder;
pub mod node;
pub mod observer;

pub use builder::GraphBuilder;
pub use node::{GraphNode, NodeId, NodeInput, NodeKey, NodeState};
pub use observer::ForwardObserver;

#[derive(Debug, thiserror::Error)]
pub enum ComputeGraphError {
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Operation {op}: unknown primitive kind {kind}")]
    UnknownPrimitive { op: String, kind: String },
    #[error("Operation {op}: primitive {kind} takes {expected} inputs, template lists {actual}")]
    ArityMismatch {
        op: String,
        kind: String,
        expected: Arity,
        actual: usize,
    },
    #[error("Node {node}: input {reference} does not resolve to a constructed node")]
    UnresolvedReference { node: String, reference: String },
    #[error("Node {node}: operation finder {finder} points at {target}, which is not constructed")]
    FinderTargetMissing {
        node: String,
        finder: String,
        target: String,
    },
    #[error("Node {node}: {reference} is repeated more finely than its consumer; gather it instead")]
    FinerScopeReference { node: String, reference: String },
    #[error("Node {node}: gather of {reference} requires a finer-scoped operation")]
    InvalidGather { node: String, reference: String },
    #[error("Node {node}: gather of {reference} collected no nodes")]
    EmptyGather { node: String, reference: String },
    #[error("Node {node}: gradient binding {name} cannot be used as a forward input")]
    GradientAsInput { node: String, name: String },
    #[error("Node {node}: input {index} has a gradient target but is not a bound tensor")]
    GradientTargetOnNode { node: String, index: usize },
    #[error("Duplicate node id {0}")]
    DuplicateNode(String),
    #[error("No node with id {0}")]
    UnknownNode(String),
    #[error("Node {consumer} consumes {producer}, which does not execute before it")]
    TopologyViolation { consumer: String, producer: String },
}

/// What a lookup by category, name, and coordinate resolves to.
#[derive(Debug, Clone)]
pub enum Lookup {
    Node(NodeId),
    Tensor(SharedTensor),
    Gradient(GradientSink),
}

#[derive(Debug)]
pub struct ComputeGraph {
    nodes: Vec<GraphNode>,
    by_key: HashMap<NodeKey, NodeId>,
    by_qualified_id: HashMap<String, NodeId>,
    bindings: BindingTable,
    layers: usize,
    nested_layers: usize,
}

impl ComputeGraph {
    pub(crate) fn from_parts(
        nodes: Vec<GraphNode>,
        bindings: BindingTable,
        layers: usize,
        nested_layers: usize,
    ) -> Result<Self, ComputeGraphError> {
        let mut by_key = HashMap::new();
        let mut by_qualified_id = HashMap::new();
        for node in &nodes {
            if by_qualified_id
                .insert(node.qualified_id.clone(), node.id)
                .is_some()
            {
                return Err(ComputeGraphError::DuplicateNode(node.qualified_id.clone()));
            }
            by_key.insert(node.key.clone(), node.id);
        }
        Ok(Self {
            nodes,
            by_key,
            by_qualified_id,
            bindings,
            layers,
            nested_layers,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn nested_layers(&self) -> usize {
        self.nested_layers
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn first(&self) -> Option<NodeId> {
        self.nodes.first().map(|n| n.id)
    }

    pub fn last(&self) -> Option<NodeId> {
        self.nodes.last().map(|n| n.id)
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node_ref(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn node_by_key(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.by_key.get(key).map(|id| self.node_ref(*id))
    }

    /// Resolves a qualified id such as `"hidden_2_0"`.
    pub fn node_id(&self, qualified_id: &str) -> Option<NodeId> {
        self.by_qualified_id.get(qualified_id).copied()
    }

    pub fn require_node_id(&self, qualified_id: &str) -> Result<NodeId, ComputeGraphError> {
        self.node_id(qualified_id)
            .ok_or_else(|| ComputeGraphError::UnknownNode(qualified_id.to_string()))
    }

    /// Every instance of a template operation, in execution order.
    pub fn instances_of(&self, op: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.key.op == op)
            .map(|n| n.id)
            .collect()
    }

    pub fn execution_order(&self) -> Vec<NodeId> {
        self.first()
            .and_then(|first| self.execution_order_from(&first))
            .unwrap_or_default()
    }

    /// Resolves `name` at a coordinate. `OperationFinder` looks up either a
    /// registered finder or, failing that, a template operation id.
    pub fn lookup(
        &self,
        category: BindingCategory,
        name: &str,
        layer: usize,
        nested: usize,
    ) -> Result<Lookup, ComputeGraphError> {
        match category {
            BindingCategory::OperationFinder => {
                let qualified = match self.bindings.category(name) {
                    Some(BindingCategory::OperationFinder) => {
                        self.bindings.find_operation(name, layer, nested)?
                    }
                    _ => NodeKey::new(name, layer, nested).to_string(),
                };
                Ok(Lookup::Node(self.require_node_id(&qualified)?))
            }
            BindingCategory::Gradient => Ok(Lookup::Gradient(
                self.bindings.resolve_gradient(name, layer, nested)?,
            )),
            _ => {
                let actual = self
                    .bindings
                    .category(name)
                    .ok_or_else(|| BindingError::Missing(name.to_string()))?;
                if actual != category {
                    return Err(BindingError::CategoryMismatch {
                        name: name.to_string(),
                        expected: category,
                        actual,
                    }
                    .into());
                }
                Ok(Lookup::Tensor(
                    self.bindings.resolve_tensor(name, layer, nested)?,
                ))
            }
        }
    }

    /// Checks that every producer executes before each of its consumers.
    pub fn validate_topology(&self) -> Result<(), ComputeGraphError> {
        let Some(first) = self.first() else {
            return Ok(());
        };
        match find_order_violation(self, &first) {
            None => Ok(()),
            Some((consumer, producer)) => Err(ComputeGraphError::TopologyViolation {
                consumer: self.qualified_id_of(consumer),
                producer: self.qualified_id_of(producer),
            }),
        }
    }

    fn qualified_id_of(&self, id: NodeId) -> String {
        self.node(id)
            .map(|n| n.qualified_id.clone())
            .unwrap_or_else(|| format!("#{}", id.0))
    }

    pub fn reset_contributions(&self) {
        for node in &self.nodes {
            node.reset_contributions();
        }
    }
}

impl InnerGraph for ComputeGraph {
    type NodeId = NodeId;
    type AnyNode = GraphNode;

    fn nodes(&self) -> impl Iterator<Item = NodeId> {
        self.nodes.iter().map(|n| n.id)
    }

    fn get_node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.node(*id)
    }

    fn execution_order_from(&self, start: &NodeId) -> Option<Vec<NodeId>> {
        let mut order = vec![];
        let mut current = Some(self.node(*start)?.id);
        while let Some(id) = current {
            order.push(id);
            current = self.node_ref(id).next;
        }
        Some(order)
    }
}
