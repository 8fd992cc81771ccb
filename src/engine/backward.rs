//! Reverse-mode traversal driven by dependency counts.
//!
//! A node fires once it has received every gradient contribution its plan
//! expects. Firing runs the node's backward primitive and delivers one summed
//! contribution to each distinct producer; producers that become complete are
//! scheduled next. Sequential mode walks a stack depth first. Concurrent mode
//! feeds ready nodes to a fixed set of scoped worker threads over a channel.
use crate::Tensor;
use crate::binding::BindingError;
use crate::compute_graph::{ComputeGraph, GraphNode, NodeId, NodeInput};
use crate::config::BackwardFailurePolicy;
use crate::primitives::PrimitiveError;
use crossbeam::channel;
use ndarray::Axis;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum NodeFailureSource {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("no forward state; run forward before backward")]
    MissingForwardState,
    #[error("primitive returned {actual} gradients for {expected} inputs")]
    GradientCount { expected: usize, actual: usize },
    #[error("gradient for input {index} has shape {actual:?}, input has {expected:?}")]
    GradientShape {
        index: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("gathered gradient has leading axis {actual}, expected {expected}")]
    GatherSplit { expected: usize, actual: usize },
    #[error("contribution of shape {actual:?} does not match accumulated {expected:?}")]
    ContributionShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("received {received} contributions, expected {expected}")]
    ContributionOverflow { expected: usize, received: usize },
    #[error("backward step panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, thiserror::Error)]
#[error("Node {node}: {source}")]
pub struct NodeFailure {
    pub node: String,
    #[source]
    pub source: NodeFailureSource,
}

fn describe_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum BackwardError {
    #[error("Backward failed at {} node(s): {}", .0.len(), describe_failures(.0))]
    Failures(Vec<NodeFailure>),
    #[error("Backward cancelled after {fired} node(s) fired")]
    Cancelled { fired: usize },
    #[error("End node {end} is not reachable from start node {start}")]
    EndUnreachable { start: String, end: String },
    #[error("End node {end} never received all of its gradient contributions")]
    EndNotReached { end: String },
    #[error("Start node {node} has no output; run forward before backward")]
    ForwardNotRun { node: String },
    #[error("Seed gradient has shape {actual:?}, start node output has {expected:?}")]
    SeedShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

/// Cooperative stop signal for a backward pass. Nodes already firing finish;
/// queued nodes are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalMode {
    Sequential,
    Concurrent { workers: usize },
}

/// Result of a completed backward pass.
#[derive(Debug)]
pub struct BackwardOutcome {
    /// Accumulated gradient of the end node's output.
    pub end_gradient: Tensor,
    /// Number of nodes whose backward step ran.
    pub fired: usize,
    /// Failure tolerated under [`BackwardFailurePolicy::TolerateSingle`].
    pub tolerated: Option<NodeFailure>,
}

struct BackwardPass<'g> {
    graph: &'g ComputeGraph,
    cancellation: CancellationToken,
    failures: Mutex<Vec<NodeFailure>>,
    fired: AtomicUsize,
}

impl<'g> BackwardPass<'g> {
    fn fail(&self, node: &GraphNode, source: NodeFailureSource) -> NodeFailure {
        NodeFailure {
            node: node.qualified_id.clone(),
            source,
        }
    }

    /// Adds `grad` to a node's accumulated gradient and counts the delivery.
    /// Returns true for the delivery that completes the node.
    fn deliver(&self, id: NodeId, grad: &Tensor) -> Result<bool, NodeFailure> {
        let node = self.graph.node_ref(id);
        {
            let mut upstream = node.upstream.lock();
            match upstream.as_mut() {
                Some(existing) => {
                    if existing.shape() != grad.shape() {
                        return Err(self.fail(
                            node,
                            NodeFailureSource::ContributionShape {
                                expected: existing.shape().to_vec(),
                                actual: grad.shape().to_vec(),
                            },
                        ));
                    }
                    *existing += grad;
                }
                None => *upstream = Some(grad.clone()),
            }
        }
        let expected = node.expected.load(Ordering::Acquire);
        let received = node.received.fetch_add(1, Ordering::AcqRel) + 1;
        if received > expected {
            return Err(self.fail(
                node,
                NodeFailureSource::ContributionOverflow { expected, received },
            ));
        }
        Ok(received == expected)
    }

    /// Runs one node's backward step and returns the producers it completed,
    /// in input order.
    fn fire(&self, id: NodeId) -> Result<Vec<NodeId>, NodeFailure> {
        let node = self.graph.node_ref(id);
        node.fire_count.fetch_add(1, Ordering::AcqRel);
        self.fired.fetch_add(1, Ordering::AcqRel);

        let upstream = node
            .upstream
            .lock()
            .clone()
            .ok_or_else(|| self.fail(node, NodeFailureSource::MissingForwardState))?;

        let mut contributions: Vec<(NodeId, Tensor)> = vec![];
        {
            let state = node.state.read();
            let output = state
                .output
                .as_ref()
                .ok_or_else(|| self.fail(node, NodeFailureSource::MissingForwardState))?;
            let grads = node
                .primitive
                .backward(&state.inputs, output, &upstream)
                .map_err(|e| self.fail(node, e.into()))?;
            if grads.len() != node.inputs.len() {
                return Err(self.fail(
                    node,
                    NodeFailureSource::GradientCount {
                        expected: node.inputs.len(),
                        actual: grads.len(),
                    },
                ));
            }
            for (index, (grad, input)) in grads.iter().zip(state.inputs.iter()).enumerate() {
                if grad.shape() != input.shape() {
                    return Err(self.fail(
                        node,
                        NodeFailureSource::GradientShape {
                            index,
                            expected: input.shape().to_vec(),
                            actual: grad.shape().to_vec(),
                        },
                    ));
                }
            }

            let mut add = |producer: NodeId, grad: Tensor| {
                match contributions.iter_mut().find(|(p, _)| *p == producer) {
                    Some((_, existing)) => *existing += &grad,
                    None => contributions.push((producer, grad)),
                }
            };
            for (input, grad) in node.inputs.iter().zip(grads.iter()) {
                match input {
                    NodeInput::Node(producer) => add(*producer, grad.clone()),
                    NodeInput::Gather(producers) => {
                        let leading = grad.shape().first().copied().unwrap_or(0);
                        if leading != producers.len() {
                            return Err(self.fail(
                                node,
                                NodeFailureSource::GatherSplit {
                                    expected: producers.len(),
                                    actual: leading,
                                },
                            ));
                        }
                        for (k, producer) in producers.iter().enumerate() {
                            add(*producer, grad.index_axis(Axis(0), k).to_owned());
                        }
                    }
                    NodeInput::Binding {
                        gradient: Some(sink),
                        ..
                    } => sink
                        .accumulate(grad)
                        .map_err(|e| self.fail(node, e.into()))?,
                    NodeInput::Binding { gradient: None, .. } => {}
                }
            }
            *node.gradients.lock() = grads.into_iter().map(Some).collect();
        }

        let mut ready = vec![];
        for (producer, grad) in contributions {
            match self.deliver(producer, &grad) {
                Ok(true) => ready.push(producer),
                Ok(false) => {}
                Err(failure) => self.record(failure),
            }
        }
        log::trace!(
            "Backward {} fired, {} producers ready",
            node.qualified_id,
            ready.len()
        );
        Ok(ready)
    }

    /// [`Self::fire`], with a panic inside the node's backward step turned into a failure.
    fn fire_caught(&self, id: NodeId) -> Result<Vec<NodeId>, NodeFailure> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.fire(id))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(self.fail(
                    self.graph.node_ref(id),
                    NodeFailureSource::Panicked(message),
                ))
            }
        }
    }

    fn record(&self, failure: NodeFailure) {
        log::debug!("{failure}");
        self.failures.lock().push(failure);
    }

    fn run_sequential(&self, start: NodeId) {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if self.cancellation.is_cancelled() {
                break;
            }
            match self.fire_caught(id) {
                Ok(ready) => stack.extend(ready.into_iter().rev()),
                Err(failure) => self.record(failure),
            }
        }
    }

    fn run_concurrent(&self, start: NodeId, workers: usize) {
        let (sender, receiver) = channel::unbounded::<Option<NodeId>>();
        // Queued plus in-flight nodes. Whoever drops it to zero releases the workers.
        let outstanding = AtomicUsize::new(1);
        if sender.send(Some(start)).is_err() {
            return;
        }
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let sender = sender.clone();
                let receiver = receiver.clone();
                let outstanding = &outstanding;
                scope.spawn(move || {
                    while let Ok(Some(id)) = receiver.recv() {
                        if !self.cancellation.is_cancelled() {
                            match self.fire_caught(id) {
                                Ok(ready) => {
                                    outstanding.fetch_add(ready.len(), Ordering::AcqRel);
                                    for producer in ready {
                                        let _ = sender.send(Some(producer));
                                    }
                                }
                                Err(failure) => self.record(failure),
                            }
                        }
                        if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                            for _ in 0..workers {
                                let _ = sender.send(None);
                            }
                        }
                    }
                });
            }
        });
    }
}

pub(crate) struct BackwardRun<'a> {
    pub graph: &'a ComputeGraph,
    pub start: NodeId,
    pub end: NodeId,
    pub seed: Tensor,
    pub mode: TraversalMode,
    pub policy: BackwardFailurePolicy,
    pub cancellation: CancellationToken,
}

/// Seeds the start node and traverses until no node is ready. Contribution
/// counters must already hold the plan for `start` and be reset.
pub(crate) fn run_backward(run: BackwardRun<'_>) -> Result<BackwardOutcome, BackwardError> {
    let graph = run.graph;
    let start_node = graph.node_ref(run.start);
    let end_node = graph.node_ref(run.end);

    let start_shape = start_node
        .state
        .read()
        .output
        .as_ref()
        .map(|o| o.shape().to_vec())
        .ok_or_else(|| BackwardError::ForwardNotRun {
            node: start_node.qualified_id.clone(),
        })?;
    if start_shape != run.seed.shape() {
        return Err(BackwardError::SeedShape {
            expected: start_shape,
            actual: run.seed.shape().to_vec(),
        });
    }

    let pass = BackwardPass {
        graph,
        cancellation: run.cancellation,
        failures: Mutex::new(vec![]),
        fired: AtomicUsize::new(0),
    };
    let pass_start = Instant::now();
    match pass.deliver(run.start, &run.seed) {
        Ok(true) => match run.mode {
            TraversalMode::Sequential => pass.run_sequential(run.start),
            TraversalMode::Concurrent { workers } => {
                pass.run_concurrent(run.start, workers.max(1))
            }
        },
        Ok(false) => {}
        Err(failure) => pass.record(failure),
    }

    let fired = pass.fired.load(Ordering::Acquire);
    let mut failures = pass.failures.into_inner();
    log::debug!(
        "Backward from {} fired {fired} nodes in {:?} ({:?})",
        start_node.qualified_id,
        pass_start.elapsed(),
        run.mode
    );

    if pass.cancellation.is_cancelled() {
        log::warn!(
            "Backward from {} cancelled after {fired} nodes",
            start_node.qualified_id
        );
        for failure in &failures {
            log::error!("{failure}");
        }
        return Err(BackwardError::Cancelled { fired });
    }

    let tolerated = match (run.policy, failures.len()) {
        (_, 0) => None,
        (BackwardFailurePolicy::TolerateSingle, 1) => {
            let failure = failures.remove(0);
            log::error!("Tolerating backward failure: {failure}");
            Some(failure)
        }
        _ => return Err(BackwardError::Failures(failures)),
    };

    let end_reached = end_node.received.load(Ordering::Acquire)
        == end_node.expected.load(Ordering::Acquire)
        && end_node.fire_count.load(Ordering::Acquire) > 0;
    let end_gradient = match end_node.upstream.lock().clone() {
        Some(gradient) if end_reached => gradient,
        _ => {
            return Err(BackwardError::EndNotReached {
                end: end_node.qualified_id.clone(),
            });
        }
    };

    Ok(BackwardOutcome {
        end_gradient,
        fired,
        tolerated,
    })
}
