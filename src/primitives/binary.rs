use crate::Tensor;
use crate::primitives::{Arity, Primitive, PrimitiveError, check_arity};
use ndarray::{ArrayViewD, Axis, IxDyn};
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
pub enum SimpleBinaryOp {
    Add,
    Sub,
    Mul,
}

/// Numpy-style broadcast of two shapes, `None` if they are incompatible.
pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        shape[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(shape)
}

/// Sums `grad` over the axes that broadcasting expanded, so the result has `shape`.
pub(crate) fn reduce_to_shape(grad: Tensor, shape: &[usize]) -> Tensor {
    let mut grad = grad;
    while grad.ndim() > shape.len() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    grad
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleBinary {
    which_op: SimpleBinaryOp,
}

impl SimpleBinary {
    pub fn new(which_op: SimpleBinaryOp) -> Self {
        Self { which_op }
    }

    fn broadcast_pair<'a>(
        &self,
        a: &'a Tensor,
        b: &'a Tensor,
    ) -> Result<(ArrayViewD<'a, f32>, ArrayViewD<'a, f32>), PrimitiveError> {
        let incompatible = || PrimitiveError::shape_mismatch(self.kind(), a.shape(), b.shape());
        let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(incompatible)?;
        let a_view = a.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
        let b_view = b.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
        Ok((a_view, b_view))
    }
}

impl Primitive for SimpleBinary {
    fn kind(&self) -> &str {
        let name: &'static str = self.which_op.into();
        name
    }

    fn arity(&self) -> Arity {
        Arity::Exact(2)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let (a, b) = self.broadcast_pair(&inputs[0], &inputs[1])?;
        Ok(match self.which_op {
            SimpleBinaryOp::Add => &a + &b,
            SimpleBinaryOp::Sub => &a - &b,
            SimpleBinaryOp::Mul => &a * &b,
        })
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        if grad_output.shape() != output.shape() {
            return Err(PrimitiveError::shape_mismatch(
                self.kind(),
                output.shape(),
                grad_output.shape(),
            ));
        }
        let (a, b) = self.broadcast_pair(&inputs[0], &inputs[1])?;
        let (grad_a, grad_b) = match self.which_op {
            SimpleBinaryOp::Add => (grad_output.clone(), grad_output.clone()),
            SimpleBinaryOp::Sub => (grad_output.clone(), grad_output.mapv(|g| -g)),
            SimpleBinaryOp::Mul => (grad_output * &b, grad_output * &a),
        };
        Ok(vec![
            reduce_to_shape(grad_a, inputs[0].shape()),
            reduce_to_shape(grad_b, inputs[1].shape()),
        ])
    }
}
