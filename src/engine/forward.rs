use crate::Tensor;
use crate::compute_graph::{ComputeGraph, ForwardObserver, NodeId, NodeInput, NodeState};
use crate::primitives::PrimitiveError;
use ndarray::{ArrayViewD, Axis};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Node {node}: producer {producer} has no output; run forward from an earlier node")]
    InputNotComputed { node: String, producer: String },
    #[error("Node {node}: gathered outputs cannot be stacked: {source}")]
    Gather {
        node: String,
        #[source]
        source: ndarray::ShapeError,
    },
    #[error("Node {node}: {source}")]
    Primitive {
        node: String,
        #[source]
        source: PrimitiveError,
    },
}

fn producer_output(
    graph: &ComputeGraph,
    node: &str,
    producer: NodeId,
) -> Result<Tensor, ForwardError> {
    let producer = graph.node_ref(producer);
    producer
        .state
        .read()
        .output
        .clone()
        .ok_or_else(|| ForwardError::InputNotComputed {
            node: node.to_string(),
            producer: producer.qualified_id.clone(),
        })
}

fn resolve_input(
    graph: &ComputeGraph,
    node: &str,
    input: &NodeInput,
) -> Result<Tensor, ForwardError> {
    match input {
        NodeInput::Node(producer) => producer_output(graph, node, *producer),
        NodeInput::Gather(producers) => {
            let outputs = producers
                .iter()
                .map(|p| producer_output(graph, node, *p))
                .collect::<Result<Vec<_>, _>>()?;
            let views: Vec<ArrayViewD<f32>> = outputs.iter().map(|t| t.view()).collect();
            ndarray::stack(Axis(0), &views).map_err(|source| ForwardError::Gather {
                node: node.to_string(),
                source,
            })
        }
        NodeInput::Binding { value, .. } => Ok(value.read().clone()),
    }
}

/// Executes nodes from `start` to the end of the execution order. Each node
/// keeps the inputs it saw and the output it produced.
pub(crate) fn run_forward<O: ForwardObserver>(
    graph: &ComputeGraph,
    start: NodeId,
    observer: &mut O,
) -> Result<usize, ForwardError> {
    let pass_start = Instant::now();
    let mut executed = 0;
    let mut current = Some(start);
    while let Some(id) = current {
        let node = graph.node_ref(id);
        let inputs = node
            .inputs
            .iter()
            .map(|input| resolve_input(graph, &node.qualified_id, input))
            .collect::<Result<Vec<_>, _>>()?;

        let start_instant = Instant::now();
        let output = node
            .primitive
            .forward(&inputs)
            .map_err(|source| ForwardError::Primitive {
                node: node.qualified_id.clone(),
                source,
            })?;
        let end_instant = Instant::now();
        observer.on_node_executed(&node.key, start_instant, end_instant);
        observer.on_tensor_assigned(&node.key, &output);
        log::trace!("Forward {} -> {:?}", node.qualified_id, output.shape());

        if let Some((_, slot)) = &node.publish {
            *slot.write() = output.clone();
        }
        *node.state.write() = NodeState {
            inputs,
            output: Some(output),
        };
        executed += 1;
        current = node.next;
    }
    log::debug!(
        "Forward pass executed {executed} nodes in {:?}",
        pass_start.elapsed()
    );
    Ok(executed)
}
