use crate::Tensor;
use crate::primitives::{Arity, Primitive, PrimitiveError, check_arity, check_same_shape};
use ndarray::Zip;
use num_traits::Float;
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
pub enum SimpleUnaryOp {
    Identity,
    Neg,
    Exp,
    Tanh,
    Sigmoid,
    Relu,
}

impl SimpleUnaryOp {
    fn apply<F: Float>(&self, x: F) -> F {
        match self {
            SimpleUnaryOp::Identity => x,
            SimpleUnaryOp::Neg => -x,
            SimpleUnaryOp::Exp => x.exp(),
            SimpleUnaryOp::Tanh => x.tanh(),
            SimpleUnaryOp::Sigmoid => F::one() / (F::one() + (-x).exp()),
            SimpleUnaryOp::Relu => x.max(F::zero()),
        }
    }

    /// d(apply)/dx, given the input `x` and the already computed output `y`.
    fn derivative<F: Float>(&self, x: F, y: F) -> F {
        match self {
            SimpleUnaryOp::Identity => F::one(),
            SimpleUnaryOp::Neg => -F::one(),
            SimpleUnaryOp::Exp => y,
            SimpleUnaryOp::Tanh => F::one() - y * y,
            SimpleUnaryOp::Sigmoid => y * (F::one() - y),
            SimpleUnaryOp::Relu => {
                if x > F::zero() {
                    F::one()
                } else {
                    F::zero()
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleUnary {
    op: SimpleUnaryOp,
}

impl SimpleUnary {
    pub fn new(op: SimpleUnaryOp) -> Self {
        Self { op }
    }

    pub fn op(&self) -> SimpleUnaryOp {
        self.op
    }
}

impl Primitive for SimpleUnary {
    fn kind(&self) -> &str {
        let name: &'static str = self.op.into();
        name
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let op = self.op;
        Ok(inputs[0].mapv(|x| op.apply(x)))
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        check_same_shape(self.kind(), input, output)?;
        check_same_shape(self.kind(), input, grad_output)?;
        let op = self.op;
        let grad = Zip::from(grad_output)
            .and(input)
            .and(output)
            .map_collect(|&g, &x, &y| g * op.derivative(x, y));
        Ok(vec![grad])
    }
}
