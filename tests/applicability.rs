mod common;

use common::{add_op, single_op};
use gradweave::backward::strategies::{
    CudnnBatchNormBackward, CudnnConvBackward, EinsumBackward, GlobalAveragePoolBackward,
    LogSoftmaxBackward, SoftmaxBackward,
};
use gradweave::graph::{BatchNormAttrs, ConvAttrs, DType, Graph, NodeIndex, Operator, StateId};
use gradweave::BackwardImplementation;
use rstest::rstest;

fn strategies() -> Vec<(&'static str, Box<dyn BackwardImplementation>)> {
    vec![
        ("Einsum", Box::new(EinsumBackward)),
        ("Softmax", Box::new(SoftmaxBackward)),
        ("LogSoftmax", Box::new(LogSoftmaxBackward)),
        ("GlobalAveragePool", Box::new(GlobalAveragePoolBackward)),
        ("Conv", Box::new(CudnnConvBackward)),
        ("BatchNormalization", Box::new(CudnnBatchNormBackward)),
    ]
}

fn matmul() -> (Graph, StateId, NodeIndex) {
    single_op(
        "mm",
        Operator::Einsum {
            equation: "ij,jk->ik".into(),
        },
        &[("Inputs__0", "a", vec![2, 3]), ("Inputs__1", "b", vec![3, 4])],
        &[("Output", "c", vec![2, 4])],
        DType::F32,
    )
}

fn softmax() -> (Graph, StateId, NodeIndex) {
    single_op(
        "sm",
        Operator::Softmax { axis: -1 },
        &[("input", "x", vec![4, 5])],
        &[("output", "y", vec![4, 5])],
        DType::F32,
    )
}

fn log_softmax() -> (Graph, StateId, NodeIndex) {
    single_op(
        "lsm",
        Operator::LogSoftmax { axis: 0 },
        &[("input", "x", vec![4, 5])],
        &[("output", "y", vec![4, 5])],
        DType::F64,
    )
}

fn pool() -> (Graph, StateId, NodeIndex) {
    single_op(
        "gap",
        Operator::GlobalAveragePool,
        &[("X", "x", vec![1, 2, 3, 3])],
        &[("Y", "y", vec![1, 2, 1, 1])],
        DType::F32,
    )
}

fn conv() -> (Graph, StateId, NodeIndex) {
    single_op(
        "conv",
        Operator::Conv(ConvAttrs::default()),
        &[("X", "x", vec![1, 2, 5, 5]), ("W", "w", vec![4, 2, 3, 3])],
        &[("Y", "y", vec![1, 4, 3, 3])],
        DType::F32,
    )
}

fn batchnorm() -> (Graph, StateId, NodeIndex) {
    let stat = |name| (name, name, vec![2]);
    single_op(
        "bn",
        Operator::BatchNormalization(BatchNormAttrs::default()),
        &[
            ("X", "x", vec![1, 2, 3, 3]),
            stat("scale"),
            stat("B"),
            stat("input_mean"),
            stat("input_var"),
        ],
        &[
            ("Y", "y", vec![1, 2, 3, 3]),
            stat("running_mean"),
            stat("running_var"),
            stat("saved_mean"),
            stat("saved_var"),
        ],
        DType::F32,
    )
}

/// A graph with an elementwise node and an unconnected conv.
fn malformed() -> (Graph, StateId, NodeIndex) {
    let mut g = Graph::new("malformed");
    let s = g.add_state("main");
    add_op(
        &mut g,
        s,
        "mul",
        Operator::Mul,
        &[("A", "a", vec![3]), ("B", "b", vec![3])],
        &[("C", "c", vec![3])],
        DType::F32,
    );
    let conv = add_op(&mut g, s, "conv", Operator::Conv(ConvAttrs::default()), &[], &[], DType::F32);
    (g, s, conv)
}

#[rstest]
#[case::matmul(matmul(), "Einsum")]
#[case::softmax(softmax(), "Softmax")]
#[case::log_softmax(log_softmax(), "LogSoftmax")]
#[case::pool(pool(), "GlobalAveragePool")]
#[case::conv(conv(), "Conv")]
#[case::batchnorm(batchnorm(), "BatchNormalization")]
fn test_only_the_matching_strategy_applies(
    #[case] fixture: (Graph, StateId, NodeIndex),
    #[case] kind: &str,
) {
    let (g, s, node) = fixture;
    for (name, strategy) in strategies() {
        assert_eq!(strategy.applicable(node, s, &g), name == kind, "{name} on {kind}");
    }
}

#[rstest]
#[case::matmul(matmul())]
#[case::softmax(softmax())]
#[case::pool(pool())]
#[case::batchnorm(batchnorm())]
#[case::malformed(malformed())]
fn test_applicable_is_pure(#[case] fixture: (Graph, StateId, NodeIndex)) {
    let (g, s, node) = fixture;
    let before = format!("{g:?}");
    for (name, strategy) in strategies() {
        let first = strategy.applicable(node, s, &g);
        assert_eq!(strategy.applicable(node, s, &g), first, "{name}");
    }
    assert_eq!(format!("{g:?}"), before);
}

#[rstest]
#[case::missing_node(NodeIndex::new(99), StateId(0))]
#[case::missing_state(NodeIndex::new(0), StateId(7))]
#[case::access_node(NodeIndex::new(1), StateId(0))]
fn test_applicable_rejects_bad_handles(#[case] node: NodeIndex, #[case] state: StateId) {
    let (g, _, _) = matmul();
    for (name, strategy) in strategies() {
        assert!(!strategy.applicable(node, state, &g), "{name}");
    }
}

#[test]
fn test_unconnected_conv_is_rejected() {
    let (g, s, node) = malformed();
    assert!(!CudnnConvBackward.applicable(node, s, &g));
}
