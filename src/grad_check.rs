//! Central-difference verification of backward implementations.
use crate::Tensor;
use crate::primitives::{Primitive, PrimitiveError};

#[derive(Debug, thiserror::Error)]
pub enum GradCheckError {
    #[error(transparent)]
    Primitive(#[from] PrimitiveError),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error("No input at index {0}")]
    InputOutOfRange(usize),
    #[error("Backward returned {actual} gradients for {expected} inputs")]
    GradientCount { expected: usize, actual: usize },
    #[error(
        "Gradient mismatch at input {input_index}, element {element_index}: analytical {analytical}, numerical {numerical}"
    )]
    GradientMismatch {
        input_index: usize,
        element_index: usize,
        analytical: f64,
        numerical: f64,
    },
    #[error("Non-finite gradient at input {input_index}, element {element_index}")]
    NonFinite {
        input_index: usize,
        element_index: usize,
    },
}

/// Fixed, uneven upstream weights so that every output element matters and a
/// uniform gradient does not hide errors.
pub fn probe_weights(shape: &[usize]) -> Tensor {
    let len: usize = shape.iter().product();
    let values = (0..len).map(|k| (k as f32 * 0.7 + 0.3).sin()).collect();
    Tensor::from_shape_vec(shape.to_vec(), values).unwrap_or_else(|_| Tensor::zeros(shape.to_vec()))
}

fn weighted_sum(output: &Tensor, weights: &Tensor) -> f64 {
    output
        .iter()
        .zip(weights.iter())
        .map(|(o, w)| *o as f64 * *w as f64)
        .sum()
}

fn set_element(tensor: &mut Tensor, element_index: usize, value: f32) {
    if let Some(slot) = tensor.iter_mut().nth(element_index) {
        *slot = value;
    }
}

/// d loss / d inputs[input_index] by central differences, where `loss` maps
/// the full input list to a scalar.
pub fn numerical_gradient<F>(
    loss: F,
    inputs: &[Tensor],
    input_index: usize,
    epsilon: f32,
) -> Result<Tensor, GradCheckError>
where
    F: Fn(&[Tensor]) -> Result<f64, GradCheckError>,
{
    let input = inputs
        .get(input_index)
        .ok_or(GradCheckError::InputOutOfRange(input_index))?;
    let mut perturbed = inputs.to_vec();
    let mut values = Vec::with_capacity(input.len());
    for (element_index, original) in input.iter().copied().enumerate() {
        set_element(&mut perturbed[input_index], element_index, original + epsilon);
        let plus = loss(&perturbed)?;
        set_element(&mut perturbed[input_index], element_index, original - epsilon);
        let minus = loss(&perturbed)?;
        set_element(&mut perturbed[input_index], element_index, original);
        values.push(((plus - minus) / (2.0 * epsilon as f64)) as f32);
    }
    Ok(Tensor::from_shape_vec(input.raw_dim(), values)?)
}

/// Compares `primitive.backward` against central differences of
/// `sum(forward(inputs) * w)` for fixed probe weights `w`.
///
/// Elements pass when `|analytical - numerical| <= tolerance * (1 + max(|a|, |n|))`.
pub fn check_primitive(
    primitive: &dyn Primitive,
    inputs: &[Tensor],
    epsilon: f32,
    tolerance: f64,
) -> Result<(), GradCheckError> {
    let output = primitive.forward(inputs)?;
    let weights = probe_weights(output.shape());
    let analytical = primitive.backward(inputs, &output, &weights)?;
    if analytical.len() != inputs.len() {
        return Err(GradCheckError::GradientCount {
            expected: inputs.len(),
            actual: analytical.len(),
        });
    }

    let loss = |inputs: &[Tensor]| -> Result<f64, GradCheckError> {
        Ok(weighted_sum(&primitive.forward(inputs)?, &weights))
    };
    for (input_index, analytical) in analytical.iter().enumerate() {
        let numerical = numerical_gradient(&loss, inputs, input_index, epsilon)?;
        for (element_index, (a, n)) in analytical.iter().zip(numerical.iter()).enumerate() {
            let (a, n) = (*a as f64, *n as f64);
            if !a.is_finite() || !n.is_finite() {
                return Err(GradCheckError::NonFinite {
                    input_index,
                    element_index,
                });
            }
            if (a - n).abs() > tolerance * (1.0 + a.abs().max(n.abs())) {
                return Err(GradCheckError::GradientMismatch {
                    input_index,
                    element_index,
                    analytical: a,
                    numerical: n,
                });
            }
        }
    }
    Ok(())
}
