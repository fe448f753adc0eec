mod common;

use approx::assert_relative_eq;
use common::{init_logger, ramp, run_unit, single_op, synthesize};
use gradweave::graph::{DType, Operator};
use gradweave::Backend;
use ndarray::{Array2, ArrayD, Axis, Ix2};
use rstest::rstest;

fn softmax_rows(x: &Array2<f64>) -> Array2<f64> {
    let mut y = x.clone();
    for mut row in y.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    y
}

/// `dx[r, j] = sum_i dy[r, i] * J_r[i, j]`
fn apply_jacobian(dy: &Array2<f64>, jacobian: impl Fn(usize, usize, usize) -> f64) -> Array2<f64> {
    let (rows, cols) = dy.dim();
    Array2::from_shape_fn((rows, cols), |(r, j)| (0..cols).map(|i| dy[[r, i]] * jacobian(r, i, j)).sum())
}

fn backward_of(op: Operator, y: &ArrayD<f64>, dy: &ArrayD<f64>) -> Array2<f64> {
    let shape = y.shape().to_vec();
    let (g, s, node) = single_op(
        "sm",
        op,
        &[("input", "x", shape.clone())],
        &[("output", "y", shape)],
        DType::F64,
    );
    let (unit, result, hooks) = synthesize(&g, s, node, Backend::Pure, &["output"], &["input"]);
    assert!(hooks.is_empty());
    assert_eq!(unit.forward_link("output").map(|l| l.inner.as_str()), Some("output"));

    let dy_name = &result.given_grad_names["output"];
    let interp = run_unit(&unit, &[("output", y.clone()), (dy_name.as_str(), dy.clone())]);
    let dx = interp.get(&result.required_grad_names["input"]).unwrap();
    dx.clone().into_dimensionality::<Ix2>().unwrap()
}

#[rstest]
#[case(1)]
#[case(-1)]
fn test_softmax_backward_matches_jacobian(#[case] axis: i64) {
    init_logger();
    let x = ramp(&[4, 5], 0.1).into_dimensionality::<Ix2>().unwrap();
    let dy = ramp(&[4, 5], 1.3).into_dimensionality::<Ix2>().unwrap();
    let y = softmax_rows(&x);

    let dx = backward_of(Operator::Softmax { axis }, &y.clone().into_dyn(), &dy.clone().into_dyn());

    let delta = |i: usize, j: usize| if i == j { 1.0 } else { 0.0 };
    let expected = apply_jacobian(&dy, |r, i, j| y[[r, i]] * (delta(i, j) - y[[r, j]]));
    for (a, b) in dx.iter().zip(expected.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_log_softmax_backward_matches_jacobian() {
    init_logger();
    let x = ramp(&[4, 5], 0.7).into_dimensionality::<Ix2>().unwrap();
    let dy = ramp(&[4, 5], 2.1).into_dimensionality::<Ix2>().unwrap();
    let s = softmax_rows(&x);
    let y = s.mapv(f64::ln);

    let dx = backward_of(Operator::LogSoftmax { axis: 1 }, &y.into_dyn(), &dy.clone().into_dyn());

    let delta = |i: usize, j: usize| if i == j { 1.0 } else { 0.0 };
    let expected = apply_jacobian(&dy, |r, i, j| delta(i, j) - s[[r, j]]);
    for (a, b) in dx.iter().zip(expected.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12);
    }
}

#[test]
fn test_softmax_gradient_is_orthogonal_to_ones() {
    // softmax is shift invariant along its axis, so every row of dx sums to 0
    let x = ramp(&[4, 5], 0.4).into_dimensionality::<Ix2>().unwrap();
    let dy = ramp(&[4, 5], 0.9).into_dyn();
    let dx = backward_of(Operator::Softmax { axis: 1 }, &softmax_rows(&x).into_dyn(), &dy);
    for row_sum in dx.sum_axis(Axis(1)).iter() {
        assert_relative_eq!(*row_sum, 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_softmax_unit_structure() {
    let (g, s, node) = single_op(
        "sm",
        Operator::Softmax { axis: 0 },
        &[("input", "x", vec![3, 2])],
        &[("output", "y", vec![3, 2])],
        DType::F32,
    );
    let (unit, result, _) = synthesize(&g, s, node, Backend::Pure, &["output"], &["input"]);
    assert_eq!(result.given_grad_names.len(), 1);
    assert_eq!(result.required_grad_names.len(), 1);
    let grad = &result.required_grad_names["input"];
    assert!(unit.outputs.contains(grad));
    assert!(unit.inputs.contains(&result.given_grad_names["output"]));
    // the keepdims reduction collapses the softmax axis
    assert_eq!(unit.graph.array("sums").unwrap().shape, vec![1, 2]);
    assert!(unit.graph.array("sums").unwrap().transient);
}
