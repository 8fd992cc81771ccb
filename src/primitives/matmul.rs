use crate::Tensor;
use crate::primitives::{Arity, Primitive, PrimitiveError, check_arity};
use ndarray::{ArrayView2, Ix2};
use serde::{Deserialize, Serialize};

/// Rank-2 matrix product.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MatMul;

impl MatMul {
    fn as_matrices<'a>(
        &self,
        a: &'a Tensor,
        b: &'a Tensor,
    ) -> Result<(ArrayView2<'a, f32>, ArrayView2<'a, f32>), PrimitiveError> {
        let a = a.view().into_dimensionality::<Ix2>()?;
        let b = b.view().into_dimensionality::<Ix2>()?;
        if a.ncols() != b.nrows() {
            return Err(PrimitiveError::invalid_input(
                self.kind(),
                format!(
                    "inner dimensions differ: {:?} x {:?}",
                    a.shape(),
                    b.shape()
                ),
            ));
        }
        Ok((a, b))
    }
}

impl Primitive for MatMul {
    fn kind(&self) -> &str {
        "matmul"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(2)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let (a, b) = self.as_matrices(&inputs[0], &inputs[1])?;
        Ok(a.dot(&b).into_dyn())
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let (a, b) = self.as_matrices(&inputs[0], &inputs[1])?;
        let grad = grad_output.view().into_dimensionality::<Ix2>()?;
        if grad.shape() != [a.nrows(), b.ncols()] {
            return Err(PrimitiveError::shape_mismatch(
                self.kind(),
                &[a.nrows(), b.ncols()],
                grad.shape(),
            ));
        }
        let grad_a = grad.dot(&b.t());
        let grad_b = a.t().dot(&grad);
        Ok(vec![grad_a.into_dyn(), grad_b.into_dyn()])
    }
}
