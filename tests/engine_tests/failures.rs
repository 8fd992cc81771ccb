use crate::engine_tests::{BackwardMode, bind_scalar, tensor};
use whisper_autodiff::engine::{BackwardError, EngineError, NodeFailureSource};
use whisper_autodiff::primitives::{Arity, PrimitiveError};
use whisper_autodiff::{
    ArchitectureTemplate, BackwardFailurePolicy, BindingTable, Engine, OperationSpec, Primitive,
    PrimitiveRegistry, Tensor,
};

/// Identity forward, failing backward.
#[derive(Debug)]
pub struct Explode;

impl Primitive for Explode {
    fn kind(&self) -> &str {
        "explode"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        Ok(inputs[0].clone())
    }

    fn backward(
        &self,
        _inputs: &[Tensor],
        _output: &Tensor,
        _grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        Err(PrimitiveError::Failed {
            kind: self.kind().to_string(),
            message: "backward not available".to_string(),
        })
    }
}

/// Identity forward, panicking backward.
#[derive(Debug)]
pub struct Panic;

impl Primitive for Panic {
    fn kind(&self) -> &str {
        "panic"
    }

    fn arity(&self) -> Arity {
        Arity::Exact(1)
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor, PrimitiveError> {
        Ok(inputs[0].clone())
    }

    fn backward(
        &self,
        _inputs: &[Tensor],
        _output: &Tensor,
        _grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        panic!("kernel fault")
    }
}

/// `out = tanh(in) + explode(x) [+ explode(x)]`, so the failing branches do
/// not lie between `out` and `in`.
fn engine_with_failing_branches(mode: BackwardMode, failing: usize) -> Engine {
    let mut template = ArchitectureTemplate::new(1, 1)
        .with_operation(OperationSpec::new("in", "identity").input("x"))
        .with_operation(OperationSpec::new("good", "tanh").input("in"))
        .with_operation(OperationSpec::new("bad0", "explode").input("x"))
        .with_operation(OperationSpec::new("sum0", "add").input("good").input("bad0"));
    let mut last = "sum0".to_string();
    for i in 1..failing {
        template = template
            .with_operation(OperationSpec::new(&format!("bad{i}"), "explode").input("x"))
            .with_operation(
                OperationSpec::new(&format!("sum{i}"), "add")
                    .input(last.as_str())
                    .input(format!("bad{i}").as_str()),
            );
        last = format!("sum{i}");
    }
    template = template.with_operation(OperationSpec::new("out", "sum").input(last.as_str()));

    let mut bindings = BindingTable::new();
    bind_scalar(&mut bindings, "x", tensor(&[2], &[0.5, -0.5]));
    let mut registry = PrimitiveRegistry::with_standard();
    registry.register(Explode);
    Engine::build(&template, bindings, &registry, mode.config()).unwrap()
}

fn seed() -> Tensor {
    crate::engine_tests::scalar_seed()
}

pub fn test_strict_policy_surfaces_single_failure(mode: BackwardMode) {
    let mut engine = engine_with_failing_branches(mode, 1);
    engine.run_forward("in_0_0").unwrap();
    let err = engine
        .run_backward_with(
            mode.options("out_0_0", "in_0_0", seed())
                .failure_policy(BackwardFailurePolicy::Strict),
        )
        .unwrap_err();
    match err {
        EngineError::Backward(BackwardError::Failures(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node, "bad0_0_0");
            assert!(matches!(failures[0].source, NodeFailureSource::Primitive(_)));
        }
        other => panic!("unexpected error {other}"),
    }
    // The sibling branch still ran to completion.
    let input = engine.node_named("in_0_0").unwrap();
    assert_eq!(input.backward_fire_count(), 1);
}

pub fn test_single_failure_can_be_tolerated(mode: BackwardMode) {
    let mut engine = engine_with_failing_branches(mode, 1);
    engine.run_forward("in_0_0").unwrap();
    let outcome = engine
        .run_backward_with(
            mode.options("out_0_0", "in_0_0", seed())
                .failure_policy(BackwardFailurePolicy::TolerateSingle),
        )
        .unwrap();
    let tolerated = outcome.tolerated.unwrap();
    assert_eq!(tolerated.node, "bad0_0_0");
    let correct = tensor(&[2], &[0.5, -0.5]).mapv(|v| 1.0 - v.tanh().powi(2));
    crate::engine_tests::assert_close(&outcome.end_gradient, &correct, 1e-6, 1e-5);
}

pub fn test_multiple_failures_aggregate(mode: BackwardMode) {
    let mut engine = engine_with_failing_branches(mode, 3);
    engine.run_forward("in_0_0").unwrap();
    let err = engine
        .run_backward_with(
            mode.options("out_0_0", "in_0_0", seed())
                .failure_policy(BackwardFailurePolicy::TolerateSingle),
        )
        .unwrap_err();
    match err {
        EngineError::Backward(BackwardError::Failures(failures)) => {
            let mut nodes: Vec<_> = failures.iter().map(|f| f.node.clone()).collect();
            nodes.sort();
            assert_eq!(nodes, vec!["bad0_0_0", "bad1_0_0", "bad2_0_0"]);
        }
        other => panic!("unexpected error {other}"),
    }
}

pub fn test_failure_on_path_leaves_end_unreached(mode: BackwardMode) {
    let template = ArchitectureTemplate::new(1, 1)
        .with_operation(OperationSpec::new("in", "identity").input("x"))
        .with_operation(OperationSpec::new("mid", "explode").input("in"))
        .with_operation(OperationSpec::new("out", "sum").input("mid"));
    let mut bindings = BindingTable::new();
    bind_scalar(&mut bindings, "x", tensor(&[2], &[1.0, 2.0]));
    let mut registry = PrimitiveRegistry::with_standard();
    registry.register(Explode);
    let mut engine = Engine::build(&template, bindings, &registry, mode.config()).unwrap();
    engine.run_forward("in_0_0").unwrap();
    let err = engine
        .run_backward_with(
            mode.options("out_0_0", "in_0_0", seed())
                .failure_policy(BackwardFailurePolicy::TolerateSingle),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backward(BackwardError::EndNotReached { end }) if end == "in_0_0"
    ));
}

pub fn test_usage_errors(mode: BackwardMode) {
    let mut engine = engine_with_failing_branches(mode, 1);
    assert!(matches!(
        engine.run_backward_with(mode.options("out_0_0", "in_0_0", seed())),
        Err(EngineError::Backward(BackwardError::ForwardNotRun { .. }))
    ));
    engine.run_forward("in_0_0").unwrap();
    assert!(matches!(
        engine.run_backward_with(mode.options("out_0_0", "in_0_0", tensor(&[2], &[1.0, 1.0]))),
        Err(EngineError::Backward(BackwardError::SeedShape { .. }))
    ));
    assert!(matches!(
        engine.run_backward_with(mode.options("good_0_0", "bad0_0_0", tensor(&[2], &[1.0, 1.0]))),
        Err(EngineError::Backward(BackwardError::EndUnreachable { .. }))
    ));
    assert!(matches!(
        engine.run_forward("missing_0_0"),
        Err(EngineError::ComputeGraph(_))
    ));
    assert!(matches!(
        engine.run_backward("out_0_0", "nowhere_0_0", seed(), mode.sequential),
        Err(EngineError::ComputeGraph(_))
    ));
}

pub fn test_panicking_primitive_is_collected(mode: BackwardMode) {
    let template = ArchitectureTemplate::new(1, 1)
        .with_operation(OperationSpec::new("in", "identity").input("x"))
        .with_operation(OperationSpec::new("good", "tanh").input("in"))
        .with_operation(OperationSpec::new("boom", "panic").input("in"))
        .with_operation(OperationSpec::new("both", "add").input("good").input("boom"))
        .with_operation(OperationSpec::new("out", "sum").input("both"));
    let mut bindings = BindingTable::new();
    bind_scalar(&mut bindings, "x", tensor(&[2], &[1.0, 2.0]));
    let mut registry = PrimitiveRegistry::with_standard();
    registry.register(Panic);
    let mut engine = Engine::build(&template, bindings, &registry, mode.config()).unwrap();
    engine.run_forward("in_0_0").unwrap();

    let err = engine
        .run_backward_with(mode.options("out_0_0", "good_0_0", seed()))
        .unwrap_err();
    match err {
        EngineError::Backward(BackwardError::Failures(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].node, "boom_0_0");
            assert!(matches!(
                &failures[0].source,
                NodeFailureSource::Panicked(message) if message == "kernel fault"
            ));
        }
        other => panic!("unexpected error {other}"),
    }
    // The sibling branch finished; `in` is left one contribution short.
    assert_eq!(engine.node_named("good_0_0").unwrap().backward_fire_count(), 1);
    let input = engine.node_named("in_0_0").unwrap();
    assert_eq!(input.received_contributions(), 1);
    assert_eq!(input.backward_fire_count(), 0);

    // The engine stays usable after the panic.
    let outcome = engine
        .run_backward_with(
            mode.options("out_0_0", "good_0_0", seed())
                .failure_policy(BackwardFailurePolicy::TolerateSingle),
        )
        .unwrap();
    assert_eq!(outcome.tolerated.unwrap().node, "boom_0_0");
}
