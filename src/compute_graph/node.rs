use crate::Tensor;
use crate::binding::{BindingCategory, GradientSink, SharedTensor};
use crate::primitives::Primitive;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Dense arena index of a node. Also its position in execution order.
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Identity of a node: template operation id plus layer coordinate.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeKey {
    pub op: String,
    pub layer: usize,
    pub nested: usize,
}

impl NodeKey {
    pub fn new(op: &str, layer: usize, nested: usize) -> Self {
        Self {
            op: op.to_string(),
            layer,
            nested,
        }
    }
}

impl core::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}_{}_{}", self.op, self.layer, self.nested)
    }
}

#[derive(Debug, Clone)]
pub enum NodeInput {
    Node(NodeId),
    /// Outputs of several nodes stacked along a new leading axis.
    Gather(Vec<NodeId>),
    Binding {
        name: String,
        category: BindingCategory,
        value: SharedTensor,
        gradient: Option<GradientSink>,
    },
}

impl NodeInput {
    pub fn producers(&self) -> &[NodeId] {
        match self {
            NodeInput::Node(id) => std::slice::from_ref(id),
            NodeInput::Gather(ids) => ids,
            NodeInput::Binding { .. } => &[],
        }
    }
}

/// What a forward pass leaves behind on a node: the resolved input values and
/// the output. Backward reads exactly this, and snapshots copy exactly this.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeState {
    pub inputs: Vec<Tensor>,
    pub output: Option<Tensor>,
}

pub struct GraphNode {
    pub(crate) id: NodeId,
    pub(crate) key: NodeKey,
    pub(crate) qualified_id: String,
    pub(crate) primitive: Arc<dyn Primitive>,
    pub(crate) inputs: Vec<NodeInput>,
    pub(crate) next: Option<NodeId>,
    pub(crate) publish: Option<(String, SharedTensor)>,
    pub(crate) state: RwLock<NodeState>,
    /// Sum of gradient contributions received for this node's output.
    pub(crate) upstream: Mutex<Option<Tensor>>,
    /// Calculated gradient per input, filled when the node fires.
    pub(crate) gradients: Mutex<Vec<Option<Tensor>>>,
    pub(crate) expected: AtomicUsize,
    pub(crate) received: AtomicUsize,
    pub(crate) fire_count: AtomicUsize,
}

impl GraphNode {
    pub(crate) fn new(
        id: NodeId,
        key: NodeKey,
        primitive: Arc<dyn Primitive>,
        inputs: Vec<NodeInput>,
        publish: Option<(String, SharedTensor)>,
    ) -> Self {
        let input_count = inputs.len();
        Self {
            id,
            qualified_id: key.to_string(),
            key,
            primitive,
            inputs,
            next: None,
            publish,
            state: RwLock::new(NodeState::default()),
            upstream: Mutex::new(None),
            gradients: Mutex::new(vec![None; input_count]),
            expected: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            fire_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn qualified_id(&self) -> &str {
        &self.qualified_id
    }

    pub fn kind(&self) -> &str {
        self.primitive.kind()
    }

    pub fn inputs(&self) -> &[NodeInput] {
        &self.inputs
    }

    pub fn next(&self) -> Option<NodeId> {
        self.next
    }

    pub fn published_as(&self) -> Option<&str> {
        self.publish.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn output(&self) -> Option<Tensor> {
        self.state.read().output.clone()
    }

    pub fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    pub fn expected_contributions(&self) -> usize {
        self.expected.load(Ordering::Acquire)
    }

    pub fn received_contributions(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    /// Times the backward primitive ran during the current pass.
    pub fn backward_fire_count(&self) -> usize {
        self.fire_count.load(Ordering::Acquire)
    }

    /// Accumulated gradient of this node's output for the current pass.
    pub fn accumulated_gradient(&self) -> Option<Tensor> {
        self.upstream.lock().clone()
    }

    pub fn input_gradient(&self, input_index: usize) -> Option<Tensor> {
        self.gradients.lock().get(input_index).cloned().flatten()
    }

    pub(crate) fn reset_contributions(&self) {
        self.received.store(0, Ordering::Release);
        self.fire_count.store(0, Ordering::Release);
        *self.upstream.lock() = None;
        for slot in self.gradients.lock().iter_mut() {
            *slot = None;
        }
    }
}

impl core::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("key", &self.qualified_id)
            .field("kind", &self.primitive.kind())
            .field("inputs", &self.inputs.len())
            .field("expected", &self.expected_contributions())
            .field("received", &self.received_contributions())
            .finish()
    }
}

impl crate::graph::Node<NodeId> for GraphNode {
    fn producers(&self) -> impl Iterator<Item = NodeId> {
        self.inputs
            .iter()
            .flat_map(|input| input.producers().iter().copied())
    }
}
