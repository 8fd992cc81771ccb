use ndarray::{ArrayD, IxDyn};
use whisper_autodiff::engine::BackwardOptions;
use whisper_autodiff::grad_check::GradCheckError;
use whisper_autodiff::{
    BindingTable, Engine, EngineConfig, GradientSink, SharedTensor, Tensor, shared_tensor,
};

pub mod cancellation;
pub mod diamond;
pub mod failures;

#[derive(Debug, Clone, Copy)]
pub struct BackwardMode {
    pub sequential: bool,
    pub workers: usize,
}

impl BackwardMode {
    pub fn sequential() -> Self {
        Self {
            sequential: true,
            workers: 1,
        }
    }

    pub fn concurrent(workers: usize) -> Self {
        Self {
            sequential: false,
            workers,
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_workers(self.workers)
            .with_sequential_backward(self.sequential)
    }

    pub fn options(&self, start: &str, end: &str, seed: Tensor) -> BackwardOptions {
        BackwardOptions::new(start, end, seed)
            .sequential(self.sequential)
            .workers(self.workers)
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tensor(shape: &[usize], values: &[f32]) -> Tensor {
    ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap()
}

pub fn scalar_seed() -> Tensor {
    ArrayD::from_elem(IxDyn(&[]), 1.0)
}

/// Registers one shared tensor under `name` for every coordinate.
pub fn bind_scalar(bindings: &mut BindingTable, name: &str, value: Tensor) -> SharedTensor {
    let shared = shared_tensor(value);
    let handle = shared.clone();
    bindings.register_scalar(name, move |_, _| Some(handle.clone()));
    shared
}

/// Registers one gradient sink per layer under `name`.
pub fn bind_layer_sinks(bindings: &mut BindingTable, name: &str, layers: usize) -> Vec<GradientSink> {
    let sinks: Vec<GradientSink> = (0..layers).map(|_| GradientSink::new()).collect();
    let table = sinks.clone();
    bindings.register_gradient(name, move |layer, _| table.get(layer).cloned());
    sinks
}

pub fn assert_close(value: &Tensor, correct: &Tensor, atol: f64, rtol: f64) {
    assert_eq!(value.shape(), correct.shape());
    for (a, b) in value.iter().zip(correct.iter()) {
        let (a, b) = (*a as f64, *b as f64);
        let err = (a - b).abs();
        let limit = atol + rtol * (a.abs().max(b.abs()));
        assert!(err <= limit, "{a} != {b}: {err} > {limit}");
    }
}

/// Central-difference gradient of the scalar output of `loss_node` with
/// respect to the shared tensor `weight`, re-running forward from `first`.
pub fn finite_difference(
    engine: &Engine,
    weight: &SharedTensor,
    first: &str,
    loss_node: &str,
    epsilon: f32,
) -> Tensor {
    let original = weight.read().clone();
    let loss = |inputs: &[Tensor]| {
        *weight.write() = inputs[0].clone();
        engine.run_forward(first).unwrap();
        Ok::<_, GradCheckError>(engine.output(loss_node).unwrap().unwrap().sum() as f64)
    };
    let grad = whisper_autodiff::grad_check::numerical_gradient(
        loss,
        std::slice::from_ref(&original),
        0,
        epsilon,
    )
    .unwrap();
    *weight.write() = original;
    engine.run_forward(first).unwrap();
    grad
}
