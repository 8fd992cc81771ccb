use crate::engine_tests::{BackwardMode, scalar_seed, tensor};
use whisper_autodiff::engine::{BackwardError, EngineError};
use whisper_autodiff::primitives::{Arity, PrimitiveError};
use whisper_autodiff::{
    ArchitectureTemplate, BindingTable, CancellationToken, Engine, GradientSink, OperationSpec,
    Primitive, PrimitiveRegistry, Tensor, shared_tensor,
};

/// Identity that requests cancellation while its backward step runs.
#[derive(Debug)]
struct CancelOnBackward {
    token: CancellationToken,
}

impl Primitive for CancelOnBackward {
    fn kind(&self) -> &str {
        "cancel_on_backward"
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
        grad_output: &Tensor,
    ) -> Result<Vec<Tensor>, PrimitiveError> {
        self.token.cancel();
        Ok(vec![grad_output.clone()])
    }
}

struct Chain {
    engine: Engine,
    dw_in: GradientSink,
    dw_out: GradientSink,
}

/// `out = sum(cancel(in(w_in)) * w_out)`
fn chain(mode: BackwardMode, token: &CancellationToken) -> Chain {
    let template = ArchitectureTemplate::new(1, 1)
        .with_operation(
            OperationSpec::new("in", "identity")
                .input("w_in")
                .gradient_result_to(&[Some("dw_in")]),
        )
        .with_operation(OperationSpec::new("gate", "cancel_on_backward").input("in"))
        .with_operation(
            OperationSpec::new("scaled", "mul")
                .input("gate")
                .input("w_out")
                .gradient_result_to(&[None, Some("dw_out")]),
        )
        .with_operation(OperationSpec::new("out", "sum").input("scaled"));

    let mut bindings = BindingTable::new();
    let w_in = shared_tensor(tensor(&[2], &[1.0, 2.0]));
    let w_out = shared_tensor(tensor(&[2], &[3.0, -1.0]));
    bindings
        .register_weight("w_in", move |_, _| Some(w_in.clone()))
        .register_weight("w_out", move |_, _| Some(w_out.clone()));
    let dw_in = GradientSink::new();
    let dw_out = GradientSink::new();
    let (a, b) = (dw_in.clone(), dw_out.clone());
    bindings
        .register_gradient("dw_in", move |_, _| Some(a.clone()))
        .register_gradient("dw_out", move |_, _| Some(b.clone()));

    let mut registry = PrimitiveRegistry::with_standard();
    registry.register(CancelOnBackward {
        token: token.clone(),
    });
    let engine = Engine::build(&template, bindings, &registry, mode.config()).unwrap();
    Chain {
        engine,
        dw_in,
        dw_out,
    }
}

pub fn test_cancel_before_start(mode: BackwardMode) {
    let token = CancellationToken::new();
    let mut c = chain(mode, &CancellationToken::new());
    c.engine.run_forward("in_0_0").unwrap();
    token.cancel();
    let err = c
        .engine
        .run_backward_with(
            mode.options("out_0_0", "in_0_0", scalar_seed())
                .cancellation(token),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Backward(BackwardError::Cancelled { fired: 0 })
    ));
    assert!(c.dw_out.get().is_none());
}

pub fn test_in_flight_node_finishes_after_cancel(mode: BackwardMode) {
    let token = CancellationToken::new();
    let mut c = chain(mode, &token);
    c.engine.run_forward("in_0_0").unwrap();
    let err = c
        .engine
        .run_backward_with(
            mode.options("out_0_0", "in_0_0", scalar_seed())
                .cancellation(token.clone()),
        )
        .unwrap_err();
    // out, scaled and gate fired; gate cancelled during its own step and
    // still delivered, but in was never started.
    assert!(matches!(
        err,
        EngineError::Backward(BackwardError::Cancelled { fired: 3 })
    ));
    assert!(token.is_cancelled());
    assert_eq!(c.dw_out.get().unwrap(), tensor(&[2], &[1.0, 2.0]));
    assert!(c.dw_in.get().is_none());

    let gate = c.engine.node_named("gate_0_0").unwrap();
    assert_eq!(gate.backward_fire_count(), 1);
    let input = c.engine.node_named("in_0_0").unwrap();
    assert_eq!(input.received_contributions(), 1);
    assert_eq!(input.backward_fire_count(), 0);
}
