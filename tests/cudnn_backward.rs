mod common;

use common::{init_logger, single_op, synthesize, Port};
use gradweave::backward::native::{unpaired_resources, CUDNN_ENVIRONMENT};
use gradweave::graph::{
    BatchNormAttrs, ConvAttrs, ConvBwdDataAlgo, DType, Graph, LinkSource, NativeKernel, NestedUnit,
    Node, NodeIndex, Operator, StateId, Storage,
};
use gradweave::backward::CompletionHooks;
use gradweave::{
    Backend, BackwardConfig, BackwardContext, BackwardError, BackwardImplementation, Registry,
};
use rstest::rstest;

fn kernel_of(unit: &NestedUnit) -> NativeKernel {
    let (_, state) = unit.graph.states().next().unwrap();
    state
        .nodes()
        .find_map(|(_, n)| match n {
            Node::Native(kernel) => Some(kernel.clone()),
            _ => None,
        })
        .unwrap()
}

fn conv_graph(attrs: ConvAttrs, dtype: DType) -> (Graph, StateId, NodeIndex) {
    single_op(
        "conv",
        Operator::Conv(attrs),
        &[
            ("X", "x", vec![1, 2, 5, 5]),
            ("W", "w", vec![4, 2, 3, 3]),
            ("B", "b", vec![4]),
        ],
        &[("Y", "y", vec![1, 4, 3, 3])],
        dtype,
    )
}

fn batchnorm_ports() -> (Vec<Port<'static>>, Vec<Port<'static>>) {
    (
        vec![
            ("X", "x", vec![2, 3, 4, 4]),
            ("scale", "gamma", vec![3]),
            ("B", "beta", vec![3]),
            ("input_mean", "mean", vec![3]),
            ("input_var", "var", vec![3]),
        ],
        vec![
            ("Y", "y", vec![2, 3, 4, 4]),
            ("running_mean", "running_mean", vec![3]),
            ("running_var", "running_var", vec![3]),
            ("saved_mean", "saved_mean", vec![3]),
            ("saved_var", "saved_var", vec![3]),
        ],
    )
}

fn batchnorm_graph() -> (Graph, StateId, NodeIndex) {
    let (inputs, outputs) = batchnorm_ports();
    single_op(
        "bn",
        Operator::BatchNormalization(BatchNormAttrs::default()),
        &inputs,
        &outputs,
        DType::F32,
    )
}

#[rstest]
#[case(&["X"], &["cudnnConvolutionBackwardData"], &["cudnnConvolutionBackwardFilter", "cudnnConvolutionBackwardBias"])]
#[case(&["W"], &["cudnnConvolutionBackwardFilter"], &["cudnnConvolutionBackwardData", "cudnnConvolutionBackwardBias"])]
#[case(&["X", "W", "B"], &["cudnnConvolutionBackwardData", "cudnnConvolutionBackwardFilter", "cudnnConvolutionBackwardBias"], &[])]
fn test_conv_emits_only_requested_kernels(
    #[case] required: &[&str],
    #[case] present: &[&str],
    #[case] absent: &[&str],
) {
    init_logger();
    let (g, s, node) = conv_graph(ConvAttrs::default(), DType::F32);
    let (unit, result, hooks) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], required);
    assert!(hooks.is_empty());
    assert_eq!(result.required_grad_names.len(), required.len());

    let kernel = kernel_of(&unit);
    for call in present {
        assert!(kernel.code.contains(call), "missing {call}");
    }
    for call in absent {
        assert!(!kernel.code.contains(call), "unexpected {call}");
    }
    assert!(unpaired_resources(&kernel).is_empty());
    assert!(kernel.environments.contains(CUDNN_ENVIRONMENT));
    assert_eq!(kernel.outputs.len(), required.len());
    assert!(unit.forward_link("X").is_some());
    assert!(unit.forward_link("W").is_some());
}

#[test]
fn test_conv_resources_are_namespaced_by_node() {
    let (g, s, node) = conv_graph(ConvAttrs::default(), DType::F32);
    let (unit, _, _) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], &["X", "W", "B"]);
    let kernel = kernel_of(&unit);
    let prefix = format!("conv_0_{}_{}_bwd", s.0, node.index());
    assert_eq!(kernel.label, prefix);
    assert!(kernel.state_fields.iter().all(|f| f.contains(&prefix)));
    assert!(kernel
        .state_fields
        .contains(&format!("cudnnFilterDescriptor_t *{prefix}_dW_desc;")));
    assert!(kernel
        .code_init
        .contains(&format!("cudnnSetTensor4dDescriptor(*__state->{prefix}_dB_desc, CUDNN_TENSOR_NCHW, CUDNN_DATA_FLOAT, 1, 4, 1, 1)")));
    assert!(kernel.code_init.contains("std::max(ws_size, data_ws_size)"));
    assert!(kernel.code_init.contains("std::max(ws_size, filter_ws_size)"));
    assert!(kernel.code_init.trim_start().starts_with('{'));
    assert!(kernel.code_exit.trim_end().ends_with('}'));
}

#[test]
fn test_conv_code_is_independent_of_earlier_graphs() {
    let (g1, s1, n1) = conv_graph(ConvAttrs::default(), DType::F32);
    let (first, _, _) = synthesize(&g1, s1, n1, Backend::Cudnn, &["Y"], &["X", "W"]);
    for i in 0..3 {
        let _ = Graph::new(format!("unrelated_{i}"));
    }
    let (g2, s2, n2) = conv_graph(ConvAttrs::default(), DType::F32);
    let (second, _, _) = synthesize(&g2, s2, n2, Backend::Cudnn, &["Y"], &["X", "W"]);

    let (a, b) = (kernel_of(&first), kernel_of(&second));
    assert_eq!(a.label, b.label);
    assert_eq!(a.code_init, b.code_init);
    assert_eq!(a.code, b.code);
    assert_eq!(a.code_exit, b.code_exit);

    // a clone sits at the same position, so it names the same resources
    let g3 = g1.clone();
    let (third, _, _) = synthesize(&g3, s1, n1, Backend::Cudnn, &["Y"], &["X", "W"]);
    assert_eq!(kernel_of(&third).code_init, a.code_init);
}

#[test]
fn test_nested_graph_namespaces_by_position() {
    let (g, s, node) = conv_graph(ConvAttrs::default(), DType::F32);
    let g = g.with_id(2);
    let (unit, _, _) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], &["X"]);
    assert_eq!(kernel_of(&unit).label, format!("conv_2_{}_{}_bwd", s.0, node.index()));
}

#[test]
fn test_conv_algorithm_override() {
    let (g, s, node) = conv_graph(ConvAttrs::default(), DType::F64);
    let (unit, _, _) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], &["X", "W"]);
    let kernel = kernel_of(&unit);
    assert!(kernel.code.contains("CUDNN_CONVOLUTION_BWD_DATA_ALGO_0"));
    assert!(kernel.code.contains("CUDNN_CONVOLUTION_BWD_FILTER_ALGO_0"));
    assert!(kernel.code_init.contains("CUDNN_DATA_DOUBLE"));

    let attrs = ConvAttrs {
        data_algorithm: Some(ConvBwdDataAlgo::Fft),
        ..ConvAttrs::default()
    };
    let (g, s, node) = conv_graph(attrs, DType::F32);
    let (unit, _, _) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], &["X"]);
    assert!(kernel_of(&unit).code.contains("CUDNN_CONVOLUTION_BWD_DATA_ALGO_FFT"));
}

#[rstest]
#[case(ConvAttrs { pads: [1, 1, 0, 1], ..ConvAttrs::default() }, DType::F32)]
#[case(ConvAttrs { group: 2, ..ConvAttrs::default() }, DType::F32)]
#[case(ConvAttrs::default(), DType::I64)]
fn test_conv_not_applicable(#[case] attrs: ConvAttrs, #[case] dtype: DType) {
    let (g, s, node) = conv_graph(attrs, dtype);
    let registry = Registry::default();
    assert!(!registry.lookup("Conv", Backend::Cudnn).unwrap().applicable(node, s, &g));
}

#[test]
fn test_batchnorm_defers_forward_mutation() {
    init_logger();
    let (mut g, s, node) = batchnorm_graph();
    let (unit, result, hooks) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], &["X", "scale"]);

    // only requested gradients are reported; the bias gradient goes to scratch
    assert_eq!(
        result.required_grad_names.keys().cloned().collect::<Vec<_>>(),
        vec!["X".to_string(), "scale".to_string()]
    );
    assert_eq!(unit.outputs.len(), 2);
    let kernel = kernel_of(&unit);
    assert!(kernel.code.contains("cudnnBatchNormalizationBackwardEx"));
    assert!(kernel.code_init.contains("cudnnDeriveBNTensorDescriptor"));
    assert!(unpaired_resources(&kernel).is_empty());
    assert_eq!(kernel.inputs["_reserved_size"], DType::I64);

    assert_eq!(
        unit.forward_link("reserved_ptr").map(|l| &l.source),
        Some(&LinkSource::Deferred("reserved_ptr".to_string()))
    );
    assert_eq!(
        unit.forward_link("saved_mean").map(|l| &l.source),
        Some(&LinkSource::Connector("saved_mean".to_string()))
    );

    // nothing changed yet
    let op = g.state(s).unwrap().operator(node).unwrap();
    assert!(!op.has_out_connector("reserved_ptr"));
    assert!(!g.contains_array("reserved_ptr"));

    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks.run(&mut g).unwrap(), 1);

    let state = g.state(s).unwrap();
    let op = state.operator(node).unwrap();
    assert!(op.has_out_connector("reserved_ptr"));
    assert!(op.has_out_connector("reserved_size"));
    assert!(matches!(&op.op, Operator::BatchNormalization(attrs) if attrs.expose_reserve_space));
    assert_eq!(state.out_array(node, "reserved_size"), Some("reserved_size"));
    let size = g.array("reserved_size").unwrap();
    assert_eq!(size.dtype, DType::I64);
    assert_eq!(size.storage, Storage::CpuHeap);
}

#[test]
fn test_batchnorm_reserved_names_avoid_collisions() {
    let (mut g, s, node) = batchnorm_graph();
    g.add_array("reserved_ptr", vec![1], DType::F32, true).unwrap();
    let (unit, _, hooks) = synthesize(&g, s, node, Backend::Cudnn, &["Y"], &["X", "scale", "B"]);
    assert_eq!(
        unit.forward_link("reserved_ptr").map(|l| &l.source),
        Some(&LinkSource::Deferred("reserved_ptr_0".to_string()))
    );
    hooks.run(&mut g).unwrap();
    assert_eq!(g.state(s).unwrap().out_array(node, "reserved_ptr"), Some("reserved_ptr_0"));
}

#[test]
fn test_inference_batchnorm_is_not_applicable() {
    let (inputs, mut outputs) = batchnorm_ports();
    outputs.truncate(1);
    let (g, s, node) = single_op(
        "bn",
        Operator::BatchNormalization(BatchNormAttrs::default()),
        &inputs,
        &outputs,
        DType::F32,
    );
    let registry = Registry::default();
    assert!(!registry
        .lookup("BatchNormalization", Backend::Cudnn)
        .unwrap()
        .applicable(node, s, &g));
}

#[test]
fn test_batchnorm_rejects_narrow_reserve_size() {
    let (g, s, node) = batchnorm_graph();
    let registry = Registry::default();
    let strategy = registry.lookup("BatchNormalization", Backend::Cudnn).unwrap();
    let config = BackwardConfig {
        reserved_size_dtype: DType::I32,
        ..BackwardConfig::default()
    };
    let mut hooks = CompletionHooks::new();
    let mut ctx = BackwardContext::new(&g, s, node, &config, &mut hooks);
    let err = strategy
        .backward(&mut ctx, &["Y".to_string()], &["X".to_string()])
        .unwrap_err();
    assert!(matches!(err, BackwardError::UnsupportedLayout(_)));
    assert!(hooks.is_empty());
}
