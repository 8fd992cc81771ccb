use crate::Tensor;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

pub mod binary;
pub mod matmul;
pub mod normalization;
pub mod reduce;
pub mod unary;

use binary::{SimpleBinary, SimpleBinaryOp};
use matmul::MatMul;
use normalization::LayerNorm;
use reduce::{ReduceAll, ReduceOp, SumStack};
use strum::IntoEnumIterator;
use unary::{SimpleUnary, SimpleUnaryOp};

#[derive(Debug, thiserror::Error)]
pub enum PrimitiveError {
    #[error("Primitive {kind} expects {expected} inputs, got {actual}")]
    ArityMismatch {
        kind: String,
        expected: Arity,
        actual: usize,
    },
    #[error("Primitive {kind}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        kind: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Primitive {kind}: {message}")]
    InvalidInput { kind: String, message: String },
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error("Primitive {kind} failed: {message}")]
    Failed { kind: String, message: String },
}

impl PrimitiveError {
    pub fn invalid_input(kind: &str, message: impl Into<String>) -> Self {
        PrimitiveError::InvalidInput {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn shape_mismatch(kind: &str, expected: &[usize], actual: &[usize]) -> Self {
        PrimitiveError::ShapeMismatch {
            kind: kind.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == *n,
            Arity::AtLeast(n) => count >= *n,
        }
    }
}

impl core::fmt::Display for Arity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// A differentiable operation the engine invokes without inspecting its math.
///
/// Primitives are stateless: the node that owns a primitive keeps the inputs and
/// output of its last forward call and hands them back to `backward`, so a
/// restored snapshot is enough to replay a backward pass.
pub trait Primitive: Debug + Send + Sync {
    /// Registry key, e.g. `"matmul"`.
    fn kind(&self) -> &str;

    fn arity(&self) -> Arity;

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError>;

    /// Returns one gradient per input, in input order, each shaped like its input.
    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError>;
}

pub(crate) fn check_arity(
    kind: &str,
    arity: Arity,
    inputs: &[Tensor],
) -> Result<(), PrimitiveError> {
    if arity.accepts(inputs.len()) {
        Ok(())
    } else {
        Err(PrimitiveError::ArityMismatch {
            kind: kind.to_string(),
            expected: arity,
            actual: inputs.len(),
        })
    }
}

pub(crate) fn check_same_shape(
    kind: &str,
    expected: &Tensor,
    actual: &Tensor,
) -> Result<(), PrimitiveError> {
    if expected.shape() == actual.shape() {
        Ok(())
    } else {
        Err(PrimitiveError::shape_mismatch(
            kind,
            expected.shape(),
            actual.shape(),
        ))
    }
}

/// The primitives shipped with the crate, dispatched through one enum.
#[derive(Debug, Clone)]
pub enum StandardPrimitive {
    SimpleUnary(SimpleUnary),
    SimpleBinary(SimpleBinary),
    MatMul(MatMul),
    ReduceAll(ReduceAll),
    SumStack(SumStack),
    LayerNorm(LayerNorm),
}

impl StandardPrimitive {
    pub fn all() -> Vec<StandardPrimitive> {
        let mut all = Vec::new();
        for op in SimpleUnaryOp::iter() {
            all.push(StandardPrimitive::SimpleUnary(SimpleUnary::new(op)));
        }
        for op in SimpleBinaryOp::iter() {
            all.push(StandardPrimitive::SimpleBinary(SimpleBinary::new(op)));
        }
        all.push(StandardPrimitive::MatMul(MatMul));
        for op in ReduceOp::iter() {
            all.push(StandardPrimitive::ReduceAll(ReduceAll::new(op)));
        }
        all.push(StandardPrimitive::SumStack(SumStack));
        all.push(StandardPrimitive::LayerNorm(LayerNorm::default()));
        all
    }
}

impl Primitive for StandardPrimitive {
    fn kind(&self) -> &str {
        match self {
            StandardPrimitive::SimpleUnary(x) => x.kind(),
            StandardPrimitive::SimpleBinary(x) => x.kind(),
            StandardPrimitive::MatMul(x) => x.kind(),
            StandardPrimitive::ReduceAll(x) => x.kind(),
            StandardPrimitive::SumStack(x) => x.kind(),
            StandardPrimitive::LayerNorm(x) => x.kind(),
        }
    }

    fn arity(&self) -> Arity {
        match self {
            StandardPrimitive::SimpleUnary(x) => x.arity(),
            StandardPrimitive::SimpleBinary(x) => x.arity(),
            StandardPrimitive::MatMul(x) => x.arity(),
            StandardPrimitive::ReduceAll(x) => x.arity(),
            StandardPrimitive::SumStack(x) => x.arity(),
            StandardPrimitive::LayerNorm(x) => x.arity(),
        }
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        match self {
            StandardPrimitive::SimpleUnary(x) => x.forward(inputs),
            StandardPrimitive::SimpleBinary(x) => x.forward(inputs),
            StandardPrimitive::MatMul(x) => x.forward(inputs),
            StandardPrimitive::ReduceAll(x) => x.forward(inputs),
            StandardPrimitive::SumStack(x) => x.forward(inputs),
            StandardPrimitive::LayerNorm(x) => x.forward(inputs),
        }
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        match self {
            StandardPrimitive::SimpleUnary(x) => x.backward(inputs, output, grad_output),
            StandardPrimitive::SimpleBinary(x) => x.backward(inputs, output, grad_output),
            StandardPrimitive::MatMul(x) => x.backward(inputs, output, grad_output),
            StandardPrimitive::ReduceAll(x) => x.backward(inputs, output, grad_output),
            StandardPrimitive::SumStack(x) => x.backward(inputs, output, grad_output),
            StandardPrimitive::LayerNorm(x) => x.backward(inputs, output, grad_output),
        }
    }
}

/// Kind string to primitive. Consulted once per node while the graph is built.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveRegistry {
    primitives: HashMap<String, Arc<dyn Primitive>>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard() -> Self {
        let mut registry = Self::new();
        for primitive in StandardPrimitive::all() {
            registry.register(primitive);
        }
        registry
    }

    /// Registers under `primitive.kind()`, replacing any earlier entry.
    pub fn register(&mut self, primitive: impl Primitive + 'static) {
        self.register_arc(Arc::new(primitive));
    }

    pub fn register_arc(&mut self, primitive: Arc<dyn Primitive>) {
        let kind = primitive.kind().to_string();
        if self.primitives.insert(kind.clone(), primitive).is_some() {
            log::debug!("Primitive kind {kind} re-registered");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Primitive>> {
        self.primitives.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.primitives.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
