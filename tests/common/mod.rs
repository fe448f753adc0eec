//! Common test utilities for backward-strategy tests
#![allow(dead_code)]

use gradweave::graph::{DType, Graph, Memlet, NestedUnit, NodeIndex, Operator, OperatorNode, StateId};
use gradweave::interp::Interpreter;
use gradweave::{Backend, BackwardConfig, BackwardContext, BackwardImplementation, BackwardResult, Registry};
use gradweave::backward::CompletionHooks;
use ndarray::{ArrayD, IxDyn};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `(connector, array, shape)`
pub type Port<'a> = (&'a str, &'a str, Vec<usize>);

/// Adds an operator wired to `inputs` / `outputs`, declaring missing arrays.
pub fn add_op(
    g: &mut Graph,
    s: StateId,
    name: &str,
    op: Operator,
    inputs: &[Port],
    outputs: &[Port],
    dtype: DType,
) -> NodeIndex {
    for (_, array, shape) in inputs.iter().chain(outputs) {
        if !g.contains_array(array) {
            g.add_array(array, shape.clone(), dtype.clone(), false).unwrap();
        }
    }
    let state = g.state_mut(s).unwrap();
    let in_conns: Vec<&str> = inputs.iter().map(|(c, _, _)| *c).collect();
    let out_conns: Vec<&str> = outputs.iter().map(|(c, _, _)| *c).collect();
    let node = state.add_operator(
        OperatorNode::new(name, op)
            .with_inputs(&in_conns)
            .with_outputs(&out_conns),
    );
    for (conn, array, _) in inputs {
        let read = state.add_read(array);
        state.add_edge(read, None, node, Some(*conn), Memlet::full(*array));
    }
    for (conn, array, _) in outputs {
        let write = state.add_write(array);
        state.add_edge(node, Some(*conn), write, None, Memlet::full(*array));
    }
    node
}

/// A forward graph holding one operator wired to fresh arrays.
pub fn single_op(
    name: &str,
    op: Operator,
    inputs: &[Port],
    outputs: &[Port],
    dtype: DType,
) -> (Graph, StateId, NodeIndex) {
    let mut g = Graph::new("forward");
    let s = g.add_state("main");
    let node = add_op(&mut g, s, name, op, inputs, outputs, dtype);
    (g, s, node)
}

/// Runs the strategy registered for `(kind, backend)` on one node.
pub fn synthesize(
    graph: &Graph,
    state: StateId,
    node: NodeIndex,
    backend: Backend,
    given: &[&str],
    required: &[&str],
) -> (NestedUnit, BackwardResult, CompletionHooks) {
    let registry = Registry::default();
    let config = BackwardConfig::default();
    let kind = graph.state(state).unwrap().operator(node).unwrap().op.kind();
    let implementation = registry.lookup(kind, backend).unwrap();
    assert!(implementation.applicable(node, state, graph));
    let mut hooks = CompletionHooks::new();
    let given: Vec<String> = given.iter().map(|s| s.to_string()).collect();
    let required: Vec<String> = required.iter().map(|s| s.to_string()).collect();
    let mut ctx = BackwardContext::new(graph, state, node, &config, &mut hooks);
    let (unit, result) = implementation.backward(&mut ctx, &given, &required).unwrap();
    (unit, result, hooks)
}

/// Evaluates a unit with its inputs bound by inner array name.
pub fn run_unit(unit: &NestedUnit, inputs: &[(&str, ArrayD<f64>)]) -> Interpreter {
    let mut interp = Interpreter::new();
    for (name, value) in inputs {
        assert!(unit.inputs.contains(*name), "'{name}' is not an input of the unit");
        interp.set(name, value.clone());
    }
    interp.run(&unit.graph).unwrap();
    interp
}

/// Deterministic, non-symmetric test data.
pub fn ramp(shape: &[usize], seed: f64) -> ArrayD<f64> {
    let mut k = 0.0;
    ArrayD::from_shape_fn(IxDyn(shape), |_| {
        k += 1.0;
        (k * 0.37 + seed).sin()
    })
}
