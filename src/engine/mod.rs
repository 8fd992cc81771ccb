use crate::Tensor;
use crate::binding::{BindingCategory, BindingTable};
use crate::compute_graph::{
    ComputeGraph, ComputeGraphError, ForwardObserver, GraphBuilder, GraphNode, Lookup, NodeId,
    NodeKey,
};
use crate::config::{BackwardFailurePolicy, ConfigError, EngineConfig};
use crate::primitives::PrimitiveRegistry;
use crate::template::ArchitectureTemplate;

pub mod backward;
pub mod dependency;
pub mod forward;
pub mod snapshot;

pub use backward::{
    BackwardError, BackwardOutcome, CancellationToken, NodeFailure, NodeFailureSource,
    TraversalMode,
};
pub use dependency::DependencyPlan;
pub use forward::ForwardError;
pub use snapshot::{InstanceId, IntermediateStore, SnapshotError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    ComputeGraph(#[from] ComputeGraphError),
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error(transparent)]
    Backward(#[from] BackwardError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Parameters of one backward pass. Unset fields fall back to the engine config.
#[derive(Debug, Clone)]
pub struct BackwardOptions {
    pub start: String,
    pub end: String,
    pub seed: Tensor,
    pub sequential: Option<bool>,
    pub workers: Option<usize>,
    pub failure_policy: Option<BackwardFailurePolicy>,
    pub cancellation: Option<CancellationToken>,
}

impl BackwardOptions {
    pub fn new(start: &str, end: &str, seed: Tensor) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            seed,
            sequential: None,
            workers: None,
            failure_policy: None,
            cancellation: None,
        }
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.sequential = Some(sequential);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn failure_policy(mut self, policy: BackwardFailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Owns a built graph and runs forward passes, backward passes, and
/// intermediate snapshots against it.
#[derive(Debug)]
pub struct Engine {
    graph: ComputeGraph,
    config: EngineConfig,
    plan: Option<DependencyPlan>,
    store: IntermediateStore,
}

impl Engine {
    pub fn new(graph: ComputeGraph, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            graph,
            config,
            plan: None,
            store: IntermediateStore::new(),
        })
    }

    pub fn build(
        template: &ArchitectureTemplate,
        bindings: BindingTable,
        registry: &PrimitiveRegistry,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let graph = GraphBuilder::new(template, bindings, registry).build()?;
        Self::new(graph, config)
    }

    pub fn graph(&self) -> &ComputeGraph {
        &self.graph
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.graph.node(id)
    }

    pub fn node_by_key(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.graph.node_by_key(key)
    }

    pub fn node_id(&self, qualified_id: &str) -> Result<NodeId, EngineError> {
        Ok(self.graph.require_node_id(qualified_id)?)
    }

    /// Node by qualified id, e.g. `"output_0_0"`.
    pub fn node_named(&self, qualified_id: &str) -> Result<&GraphNode, EngineError> {
        let id = self.node_id(qualified_id)?;
        Ok(self.graph.node_ref(id))
    }

    pub fn output(&self, qualified_id: &str) -> Result<Option<Tensor>, EngineError> {
        Ok(self.node_named(qualified_id)?.output())
    }

    pub fn lookup(
        &self,
        category: BindingCategory,
        name: &str,
        layer: usize,
        nested: usize,
    ) -> Result<Lookup, EngineError> {
        Ok(self.graph.lookup(category, name, layer, nested)?)
    }

    pub fn run_forward(&self, start: &str) -> Result<usize, EngineError> {
        self.run_forward_observed(start, &mut ())
    }

    pub fn run_forward_observed<O: ForwardObserver>(
        &self,
        start: &str,
        observer: &mut O,
    ) -> Result<usize, EngineError> {
        let start = self.node_id(start)?;
        Ok(forward::run_forward(&self.graph, start, observer)?)
    }

    /// Compiles, or reuses, expected contribution counts for backward passes from `start`.
    pub fn compile_dependencies(&mut self, start: &str) -> Result<&DependencyPlan, EngineError> {
        let start = self.node_id(start)?;
        Ok(self.plan_for(start))
    }

    fn plan_for(&mut self, start: NodeId) -> &DependencyPlan {
        let plan = match self.plan.take() {
            Some(plan) if plan.start() == start => plan,
            _ => {
                let plan = DependencyPlan::compile(&self.graph, start);
                plan.apply(&self.graph);
                plan
            }
        };
        self.plan.insert(plan)
    }

    pub fn dependency_plan(&self) -> Option<&DependencyPlan> {
        self.plan.as_ref()
    }

    /// Clears received counts, fire counts, and gradients of the last backward
    /// pass. Expected counts are kept.
    pub fn reset_contributions(&self) {
        self.graph.reset_contributions();
    }

    /// Backpropagates `seed` from `start` and returns the accumulated gradient at `end`.
    pub fn run_backward(
        &mut self,
        start: &str,
        end: &str,
        seed: Tensor,
        sequential: bool,
    ) -> Result<Tensor, EngineError> {
        let outcome =
            self.run_backward_with(BackwardOptions::new(start, end, seed).sequential(sequential))?;
        Ok(outcome.end_gradient)
    }

    pub fn run_backward_with(
        &mut self,
        options: BackwardOptions,
    ) -> Result<BackwardOutcome, EngineError> {
        let start = self.node_id(&options.start)?;
        let end = self.node_id(&options.end)?;
        let reachable = self.plan_for(start).is_reachable(end);
        if !reachable {
            return Err(BackwardError::EndUnreachable {
                start: options.start,
                end: options.end,
            }
            .into());
        }
        self.graph.reset_contributions();

        let mode = if options.sequential.unwrap_or(self.config.sequential_backward) {
            TraversalMode::Sequential
        } else {
            TraversalMode::Concurrent {
                workers: options.workers.unwrap_or(self.config.workers),
            }
        };
        Ok(backward::run_backward(backward::BackwardRun {
            graph: &self.graph,
            start,
            end,
            seed: options.seed,
            mode,
            policy: options
                .failure_policy
                .unwrap_or(self.config.failure_policy),
            cancellation: options.cancellation.unwrap_or_default(),
        })?)
    }

    pub fn store_intermediates(&mut self, instance: impl Into<InstanceId>) {
        self.store.store(&self.graph, instance.into());
    }

    pub fn restore_intermediates(&self, instance: impl Into<InstanceId>) -> Result<(), EngineError> {
        Ok(self.store.restore(&self.graph, &instance.into())?)
    }

    pub fn discard_intermediates(&mut self, instance: impl Into<InstanceId>) -> bool {
        self.store.discard(&instance.into())
    }

    pub fn has_intermediates(&self, instance: impl Into<InstanceId>) -> bool {
        self.store.contains(&instance.into())
    }

    pub fn clear_intermediates(&mut self) {
        self.store.clear();
    }

    pub fn stored_instances(&self) -> Vec<InstanceId> {
        self.store.instances()
    }
}
