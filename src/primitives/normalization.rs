use crate::Tensor;
use crate::primitives::{Arity, Primitive, PrimitiveError, check_arity, check_same_shape};
use ndarray::{ArrayView1, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Normalizes each lane of the last axis to zero mean and unit variance.
/// No learned scale or shift; compose with `mul`/`add` for those.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    pub epsilon: f32,
}

impl Default for LayerNorm {
    fn default() -> Self {
        Self { epsilon: 1e-5 }
    }
}

struct LaneStats {
    mean: f32,
    inv_std: f32,
}

impl LayerNorm {
    fn stats(&self, lane: &ArrayView1<f32>) -> LaneStats {
        let n = lane.len().max(1) as f32;
        let mean = lane.sum() / n;
        let var = lane.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        LaneStats {
            mean,
            inv_std: 1.0 / (var + self.epsilon).sqrt(),
        }
    }

    fn last_axis(&self, input: &Tensor) -> Result<Axis, PrimitiveError> {
        if input.ndim() == 0 {
            return Err(PrimitiveError::invalid_input(
                self.kind(),
                "cannot normalize a 0-d tensor",
            ));
        }
        Ok(Axis(input.ndim() - 1))
    }
}

impl Primitive for LayerNorm {
    fn kind(&self) -> &str {
        "layer_norm"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        let axis = self.last_axis(input)?;
        let mut output = input.clone();
        Zip::from(output.lanes_mut(axis))
            .and(input.lanes(axis))
            .for_each(|mut y, x| {
                let stats = self.stats(&x);
                y.zip_mut_with(&x, |y, &x| *y = (x - stats.mean) * stats.inv_std);
            });
        Ok(output)
    }

    fn backward(
        &self,
        inputs: &[Tensor],
        _output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        check_arity(self.kind(), self.arity(), inputs)?;
        let input = &inputs[0];
        check_same_shape(self.kind(), input, grad_output)?;
        let axis = self.last_axis(input)?;
        let mut grad = Tensor::zeros(input.raw_dim());
        Zip::from(grad.lanes_mut(axis))
            .and(input.lanes(axis))
            .and(grad_output.lanes(axis))
            .for_each(|mut dx, x, g| {
                let stats = self.stats(&x);
                let n = x.len().max(1) as f32;
                let y = x.mapv(|v| (v - stats.mean) * stats.inv_std);
                let g_mean = g.sum() / n;
                let gy_mean = (&g * &y).sum() / n;
                Zip::from(&mut dx)
                    .and(&g)
                    .and(&y)
                    .for_each(|dx, &g, &y| *dx = stats.inv_std * (g - g_mean - y * gy_mean));
            });
        Ok(vec![grad])
    }
}
