use crate::Tensor;
use crate::primitives::{Arity, Primitive, PrimitiveError, check_arity};
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ReduceOp {
    Sum,
    Mean,
}

/// Reduces every element of the input to a 0-d tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceAll {
    op: ReduceOp,
}

impl ReduceAll {
    pub fn new(op: ReduceOp) -> Self {
        Self { op }
    }
}

fn single_element(kind: &str, grad_output: &Tensor) -> Result<f32, PrimitiveError> {
    if grad_output.len() != 1 {
        return Err(PrimitiveError::shape_mismatch(kind, &[], grad_output.shape()));
    }
    grad_output
        .iter()
        .next()
        .copied()
        .ok_or_else(|| PrimitiveError::invalid_input(kind, "empty output gradient"))
}

impl Primitive for ReduceAll {
    fn kind(&self) -> &str {
        let name: &'static str = self.op.into();
        name
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        let value = match self.op {
            ReduceOp::Sum => input.sum(),
            ReduceOp::Mean => input
                .mean()
                .ok_or_else(|| PrimitiveError::invalid_input(self.kind(), "empty input"))?,
        };
        Ok(ArrayD::from_elem(IxDyn(&[]), value))
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        let g = single_element(self.kind(), grad_output)?;
        let g = match self.op {
            ReduceOp::Sum => g,
            ReduceOp::Mean => g / input.len().max(1) as f32,
        };
        Ok(vec![ArrayD::from_elem(input.raw_dim(), g)])
    }
}

/// Sums a gathered stack along its leading axis.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SumStack;

impl Primitive for SumStack {
    fn kind(&self) -> &str {
        "sum_stack"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        if input.ndim() == 0 {
            return Err(PrimitiveError::invalid_input(
                self.kind(),
                "expected a stacked input with a leading axis",
            ));
        }
        Ok(input.sum_axis(Axis(0)))
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        if grad_output.shape() != output.shape() {
            return Err(PrimitiveError::shape_mismatch(
                self.kind(),
                output.shape(),
                grad_output.shape(),
            ));
        }
        let grad = grad_output
            .view()
            .insert_axis(Axis(0))
            .broadcast(input.raw_dim())
            .ok_or_else(|| {
                PrimitiveError::shape_mismatch(self.kind(), input.shape(), grad_output.shape())
            })?
            .to_owned();
        Ok(vec![grad])
    }
}
