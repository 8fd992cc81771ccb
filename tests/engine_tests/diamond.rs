use crate::engine_tests::{BackwardMode, bind_scalar, tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use whisper_autodiff::template::InputSpec;
use whisper_autodiff::{
    ArchitectureTemplate, BindingTable, Engine, OperationSpec, PrimitiveRegistry,
};

fn diamond_engine(mode: BackwardMode) -> Engine {
    let template = ArchitectureTemplate::new(1, 1)
        .with_operation(OperationSpec::new("a", "identity").input("x"))
        .with_operation(OperationSpec::new("b", "tanh").input("a"))
        .with_operation(OperationSpec::new("c", "exp").input("a"))
        .with_operation(OperationSpec::new("d", "add").input("b").input("c"));
    let mut bindings = BindingTable::new();
    bind_scalar(&mut bindings, "x", tensor(&[2], &[0.25, -0.5]));
    Engine::build(
        &template,
        bindings,
        &PrimitiveRegistry::with_standard(),
        mode.config(),
    )
    .unwrap()
}

pub fn test_diamond_contributions(mode: BackwardMode) {
    let mut engine = diamond_engine(mode);
    engine.run_forward("a_0_0").unwrap();

    let plan = engine.compile_dependencies("d_0_0").unwrap().clone();
    let expected: Vec<usize> = ["a_0_0", "b_0_0", "c_0_0", "d_0_0"]
        .iter()
        .map(|q| plan.expected(engine.graph().node_id(q).unwrap()))
        .collect();
    assert_eq!(expected, vec![2, 1, 1, 1]);

    let seed = tensor(&[2], &[1.0, 1.0]);
    let outcome = engine
        .run_backward_with(mode.options("d_0_0", "a_0_0", seed))
        .unwrap();
    assert_eq!(outcome.fired, 4);
    assert!(outcome.tolerated.is_none());

    let a = engine.node_named("a_0_0").unwrap();
    assert_eq!(a.received_contributions(), 2);
    assert_eq!(a.backward_fire_count(), 1);

    // d/da [tanh(a) + exp(a)] = 1 - tanh(a)^2 + exp(a)
    let correct = tensor(&[2], &[0.25, -0.5]).mapv(|v| 1.0 - v.tanh().powi(2) + v.exp());
    crate::engine_tests::assert_close(&outcome.end_gradient, &correct, 1e-6, 1e-5);
    assert_eq!(a.accumulated_gradient().unwrap(), outcome.end_gradient);
}

pub fn test_shared_producer_delivers_once(mode: BackwardMode) {
    let template = ArchitectureTemplate::new(1, 1)
        .with_operation(OperationSpec::new("a", "identity").input("x"))
        .with_operation(OperationSpec::new("sq", "mul").input("a").input("a"))
        .with_operation(OperationSpec::new("loss", "sum").input("sq"));
    let mut bindings = BindingTable::new();
    bind_scalar(&mut bindings, "x", tensor(&[3], &[1.0, -2.0, 0.5]));
    let mut engine = Engine::build(
        &template,
        bindings,
        &PrimitiveRegistry::with_standard(),
        mode.config(),
    )
    .unwrap();
    engine.run_forward("a_0_0").unwrap();
    let outcome = engine
        .run_backward_with(mode.options("loss_0_0", "a_0_0", crate::engine_tests::scalar_seed()))
        .unwrap();
    let a = engine.node_named("a_0_0").unwrap();
    assert_eq!(a.expected_contributions(), 1);
    assert_eq!(a.received_contributions(), 1);
    assert_eq!(outcome.end_gradient, tensor(&[3], &[2.0, -4.0, 1.0]));
}

/// Random layered DAG over same-shaped values.
fn random_template(rng: &mut StdRng, ops: usize) -> ArchitectureTemplate {
    let unary = ["identity", "neg", "tanh", "sigmoid"];
    let binary = ["add", "sub", "mul"];
    let mut template = ArchitectureTemplate::new(1, 1)
        .with_operation(OperationSpec::new("n0", "identity").input("x"));
    for i in 1..ops {
        let pick = |rng: &mut StdRng| -> InputSpec {
            if rng.gen_bool(0.1) {
                "x".into()
            } else {
                InputSpec::Name(format!("n{}", rng.gen_range(0..i)))
            }
        };
        let op = if rng.gen_bool(0.5) {
            OperationSpec::new(&format!("n{i}"), unary.choose(rng).unwrap()).input(pick(rng))
        } else {
            let first = pick(rng);
            let second = pick(rng);
            OperationSpec::new(&format!("n{i}"), binary.choose(rng).unwrap())
                .input(first)
                .input(second)
        };
        template = template.with_operation(op);
    }
    template
}

pub fn test_every_reachable_node_fires_once(mode: BackwardMode) {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for trial in 0..8 {
        let ops = 12 + trial * 4;
        let template = random_template(&mut rng, ops);
        let mut bindings = BindingTable::new();
        bind_scalar(&mut bindings, "x", tensor(&[3], &[0.3, -0.1, 0.7]));
        let mut engine = Engine::build(
            &template,
            bindings,
            &PrimitiveRegistry::with_standard(),
            mode.config(),
        )
        .unwrap();
        engine.graph().validate_topology().unwrap();
        engine.run_forward("n0_0_0").unwrap();

        let start = format!("n{}_0_0", ops - 1);
        let plan = engine.compile_dependencies(&start).unwrap().clone();
        let end = engine
            .graph()
            .iter()
            .find(|n| plan.is_reachable(n.id()))
            .map(|n| n.qualified_id().to_string())
            .unwrap();

        let seed = tensor(&[3], &[1.0, 0.5, -1.0]);
        let outcome = engine
            .run_backward_with(mode.options(&start, &end, seed))
            .unwrap();
        assert_eq!(outcome.fired, plan.reachable_count());
        for node in engine.graph().iter() {
            let expected = plan.expected(node.id());
            assert_eq!(node.expected_contributions(), expected);
            assert_eq!(node.received_contributions(), expected, "{}", node.qualified_id());
            let fires = if expected > 0 { 1 } else { 0 };
            assert_eq!(node.backward_fire_count(), fires, "{}", node.qualified_id());
        }
    }
}

pub fn test_repeated_passes_reuse_plan(mode: BackwardMode) {
    let mut engine = diamond_engine(mode);
    engine.run_forward("a_0_0").unwrap();
    let seed = tensor(&[2], &[1.0, 1.0]);
    let first = engine
        .run_backward_with(mode.options("d_0_0", "a_0_0", seed.clone()))
        .unwrap();
    let plan = engine.dependency_plan().unwrap().clone();
    let second = engine
        .run_backward_with(mode.options("d_0_0", "a_0_0", seed))
        .unwrap();
    assert_eq!(engine.dependency_plan(), Some(&plan));
    crate::engine_tests::assert_close(&first.end_gradient, &second.end_gradient, 0.0, 0.0);

    engine.reset_contributions();
    let a = engine.node_named("a_0_0").unwrap();
    assert_eq!(a.received_contributions(), 0);
    assert_eq!(a.expected_contributions(), 2);
    assert!(a.accumulated_gradient().is_none());
}
