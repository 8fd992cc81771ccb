//! Reverse-mode automatic differentiation over a graph expanded from a
//! declarative architecture template.
//!
//! A [`template::ArchitectureTemplate`] plus a [`binding::BindingTable`] build a
//! [`compute_graph::ComputeGraph`]. The [`engine::Engine`] runs forward passes over
//! it, backpropagates with dependency counting (sequentially or on a worker
//! pool), and snapshots per-instance intermediates so one graph can serve many
//! samples.

pub mod binding;
pub mod compute_graph;
pub mod config;
pub mod engine;
pub mod grad_check;
pub mod graph;
pub mod primitives;
pub mod template;

pub type Tensor = ndarray::ArrayD<f32>;

pub use binding::{BindingCategory, BindingTable, GradientSink, SharedTensor, shared_tensor};
pub use compute_graph::{ComputeGraph, ComputeGraphError, GraphBuilder, NodeId, NodeKey};
pub use config::{BackwardFailurePolicy, EngineConfig};
pub use engine::{BackwardOptions, BackwardOutcome, CancellationToken, Engine, EngineError};
pub use primitives::{Primitive, PrimitiveRegistry, StandardPrimitive};
pub use template::{ArchitectureTemplate, OperationSpec, RepetitionScope};
