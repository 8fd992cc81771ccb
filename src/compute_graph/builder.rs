use crate::binding::{BindingCategory, BindingError, BindingTable};
use crate::compute_graph::node::{GraphNode, NodeId, NodeInput, NodeKey};
use crate::compute_graph::{ComputeGraph, ComputeGraphError};
use crate::primitives::PrimitiveRegistry;
use crate::template::{ArchitectureTemplate, InputSpec, OperationSpec, RepetitionScope};
use std::collections::HashMap;

/// Expands an architecture template into a [`ComputeGraph`].
///
/// Operations are instantiated in template order, grouped into runs of equal
/// repetition: a global operation once, a run of per-layer operations once per
/// layer, and inside a layer each run of per-nested-layer operations once per
/// nested layer. Inputs resolve against nodes already built, so a reference to
/// an operation that has not been instantiated yet is an error.
pub struct GraphBuilder<'a> {
    template: &'a ArchitectureTemplate,
    bindings: BindingTable,
    registry: &'a PrimitiveRegistry,
    layers: usize,
    nested_layers: usize,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        template: &'a ArchitectureTemplate,
        bindings: BindingTable,
        registry: &'a PrimitiveRegistry,
    ) -> Self {
        Self {
            template,
            bindings,
            registry,
            layers: template.layers,
            nested_layers: template.nested_layers,
        }
    }

    /// Overrides the template's repetition counts.
    pub fn with_layers(mut self, layers: usize, nested_layers: usize) -> Self {
        self.layers = layers;
        self.nested_layers = nested_layers;
        self
    }

    pub fn build(self) -> Result<ComputeGraph, ComputeGraphError> {
        let mut template = self.template.clone();
        template.layers = self.layers;
        template.nested_layers = self.nested_layers;
        template.validate()?;

        let mut state = BuildState {
            bindings: &self.bindings,
            registry: self.registry,
            scopes: template
                .operations
                .iter()
                .map(|op| (op.id.as_str(), op.scope))
                .collect(),
            nodes: vec![],
            by_key: HashMap::new(),
        };

        for run in scope_runs(&template.operations) {
            if run[0].scope == RepetitionScope::Global {
                for op in run {
                    state.instantiate(op, 0, 0)?;
                }
                continue;
            }
            for layer in 0..template.layers {
                for block in nested_blocks(run) {
                    if block[0].scope == RepetitionScope::PerNestedLayer {
                        for nested in 0..template.nested_layers {
                            for op in block {
                                state.instantiate(op, layer, nested)?;
                            }
                        }
                    } else {
                        for op in block {
                            state.instantiate(op, layer, 0)?;
                        }
                    }
                }
            }
        }

        log::debug!(
            "Built compute graph: {} nodes from {} operations ({} layers, {} nested)",
            state.nodes.len(),
            template.operations.len(),
            template.layers,
            template.nested_layers
        );
        let nodes = state.nodes;
        ComputeGraph::from_parts(nodes, self.bindings, template.layers, template.nested_layers)
    }
}

/// Maximal runs of consecutive operations that are either all global or all layered.
fn scope_runs(ops: &[OperationSpec]) -> Vec<&[OperationSpec]> {
    split_runs(ops, |op| op.scope == RepetitionScope::Global)
}

/// Maximal runs inside a layered run that share the same scope.
fn nested_blocks(ops: &[OperationSpec]) -> Vec<&[OperationSpec]> {
    split_runs(ops, |op| op.scope)
}

fn split_runs<K: PartialEq>(
    ops: &[OperationSpec],
    key: impl Fn(&OperationSpec) -> K,
) -> Vec<&[OperationSpec]> {
    let mut runs = vec![];
    let mut start = 0;
    for i in 1..=ops.len() {
        if i == ops.len() || key(&ops[i]) != key(&ops[start]) {
            runs.push(&ops[start..i]);
            start = i;
        }
    }
    runs
}

struct BuildState<'a> {
    bindings: &'a BindingTable,
    registry: &'a PrimitiveRegistry,
    scopes: HashMap<&'a str, RepetitionScope>,
    nodes: Vec<GraphNode>,
    by_key: HashMap<NodeKey, NodeId>,
}

impl BuildState<'_> {
    fn instantiate(
        &mut self,
        op: &OperationSpec,
        layer: usize,
        nested: usize,
    ) -> Result<NodeId, ComputeGraphError> {
        let key = NodeKey::new(&op.id, layer, nested);
        let qualified = key.to_string();

        let primitive =
            self.registry
                .get(&op.kind)
                .ok_or_else(|| ComputeGraphError::UnknownPrimitive {
                    op: op.id.clone(),
                    kind: op.kind.clone(),
                })?;
        if !primitive.arity().accepts(op.inputs.len()) {
            return Err(ComputeGraphError::ArityMismatch {
                op: op.id.clone(),
                kind: op.kind.clone(),
                expected: primitive.arity(),
                actual: op.inputs.len(),
            });
        }

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for (index, spec) in op.inputs.iter().enumerate() {
            inputs.push(self.resolve_input(op, &qualified, index, spec, layer, nested)?);
        }

        let publish = match &op.result_to {
            Some(name) => {
                let category = self
                    .bindings
                    .category(name)
                    .ok_or_else(|| BindingError::Missing(name.clone()))?;
                if category != BindingCategory::Intermediate {
                    return Err(BindingError::CategoryMismatch {
                        name: name.clone(),
                        expected: BindingCategory::Intermediate,
                        actual: category,
                    }
                    .into());
                }
                Some((
                    name.clone(),
                    self.bindings.resolve_tensor(name, layer, nested)?,
                ))
            }
            None => None,
        };

        let id = NodeId(self.nodes.len());
        if let Some(previous) = self.nodes.last_mut() {
            previous.next = Some(id);
        }
        log::trace!("Instantiated {qualified} ({})", op.kind);
        self.nodes
            .push(GraphNode::new(id, key.clone(), primitive, inputs, publish));
        self.by_key.insert(key, id);
        Ok(id)
    }

    fn resolve_input(
        &self,
        op: &OperationSpec,
        qualified: &str,
        index: usize,
        spec: &InputSpec,
        layer: usize,
        nested: usize,
    ) -> Result<NodeInput, ComputeGraphError> {
        let gradient_target = op.gradient_target(index);
        let no_gradient_target = || match gradient_target {
            Some(_) => Err(ComputeGraphError::GradientTargetOnNode {
                node: qualified.to_string(),
                index,
            }),
            None => Ok(()),
        };

        match spec {
            InputSpec::Gather { gather } => {
                no_gradient_target()?;
                let reference_scope = self.scopes.get(gather.as_str()).ok_or_else(|| {
                    ComputeGraphError::UnresolvedReference {
                        node: qualified.to_string(),
                        reference: gather.clone(),
                    }
                })?;
                if reference_scope.depth() <= op.scope.depth() {
                    return Err(ComputeGraphError::InvalidGather {
                        node: qualified.to_string(),
                        reference: gather.clone(),
                    });
                }
                let ids: Vec<NodeId> = self
                    .nodes
                    .iter()
                    .filter(|n| {
                        n.key.op == *gather
                            && match op.scope {
                                RepetitionScope::Global => true,
                                _ => n.key.layer == layer,
                            }
                    })
                    .map(|n| n.id)
                    .collect();
                if ids.is_empty() {
                    return Err(ComputeGraphError::EmptyGather {
                        node: qualified.to_string(),
                        reference: gather.clone(),
                    });
                }
                Ok(NodeInput::Gather(ids))
            }
            InputSpec::Name(name) => {
                if let Some(reference_scope) = self.scopes.get(name.as_str()) {
                    no_gradient_target()?;
                    if reference_scope.depth() > op.scope.depth() {
                        return Err(ComputeGraphError::FinerScopeReference {
                            node: qualified.to_string(),
                            reference: name.clone(),
                        });
                    }
                    let (l, n) = reference_scope.project(layer, nested);
                    let key = NodeKey::new(name, l, n);
                    return self.by_key.get(&key).map(|id| NodeInput::Node(*id)).ok_or_else(
                        || ComputeGraphError::UnresolvedReference {
                            node: qualified.to_string(),
                            reference: key.to_string(),
                        },
                    );
                }

                let category = self
                    .bindings
                    .category(name)
                    .ok_or_else(|| BindingError::Missing(name.clone()))?;
                match category {
                    BindingCategory::OperationFinder => {
                        no_gradient_target()?;
                        let target = self.bindings.find_operation(name, layer, nested)?;
                        let id = self
                            .nodes
                            .iter()
                            .find(|n| n.qualified_id == target)
                            .map(|n| n.id)
                            .ok_or_else(|| ComputeGraphError::FinderTargetMissing {
                                node: qualified.to_string(),
                                finder: name.clone(),
                                target: target.clone(),
                            })?;
                        Ok(NodeInput::Node(id))
                    }
                    category if category.is_tensor() => {
                        let value = self.bindings.resolve_tensor(name, layer, nested)?;
                        let gradient = gradient_target
                            .map(|target| self.bindings.resolve_gradient(target, layer, nested))
                            .transpose()?;
                        Ok(NodeInput::Binding {
                            name: name.clone(),
                            category,
                            value,
                            gradient,
                        })
                    }
                    _ => Err(ComputeGraphError::GradientAsInput {
                        node: qualified.to_string(),
                        name: name.clone(),
                    }),
                }
            }
        }
    }
}
