use std::collections::BTreeMap;
use std::fmt::Write;

use log::debug;

use crate::backward::native::{
    cudnn_dtype, handle_setup_code, unpaired_resources, DescriptorBundle, WorkspaceQuery, CHECK,
    HANDLE,
};
use crate::backward::{add_backward_desc_for_connector, import_forward_desc};
use crate::backward::{BackwardContext, BackwardImplementation, BackwardResult};
use crate::error::{BackwardError, Result};
use crate::graph::{ConvAttrs, Graph, Memlet, NestedUnit, Node, NodeIndex, Operator, StateId};

/// Convolution gradients through cuDNN's backward-data, backward-filter and
/// backward-bias kernels.
pub struct CudnnConvBackward;

fn conv_attrs(op: &Operator) -> Option<&ConvAttrs> {
    match op {
        Operator::Conv(attrs) => Some(attrs),
        _ => None,
    }
}

fn check_supported(node: NodeIndex, state: StateId, graph: &Graph) -> Result<()> {
    let op = graph.state(state)?.operator(node)?;
    let attrs = conv_attrs(&op.op)
        .ok_or_else(|| BackwardError::InvalidNode(format!("'{}' is not a convolution", op.name)))?;
    let x = graph.in_desc_with_name(state, node, "X")?;
    let w = graph.in_desc_with_name(state, node, "W")?;
    graph.out_desc_with_name(state, node, "Y")?.nchw("Y")?;
    x.nchw("X")?;
    w.nchw("W")?;
    if !attrs.is_symmetric() {
        return Err(BackwardError::UnsupportedLayout(format!(
            "'{}' has asymmetric padding {:?}",
            op.name, attrs.pads
        )));
    }
    if attrs.group != 1 {
        return Err(BackwardError::UnsupportedLayout(format!(
            "'{}' is a grouped convolution",
            op.name
        )));
    }
    if x.dtype != w.dtype {
        return Err(BackwardError::UnsupportedLayout(format!(
            "'{}' mixes {:?} and {:?}",
            op.name, x.dtype, w.dtype
        )));
    }
    cudnn_dtype(&x.dtype)?;
    Ok(())
}

impl BackwardImplementation for CudnnConvBackward {
    fn applicable(&self, node: NodeIndex, state: StateId, graph: &Graph) -> bool {
        check_supported(node, state, graph).is_ok()
    }

    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        _given: &[String],
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)> {
        let forward = ctx.forward_op()?;
        let attrs = conv_attrs(&forward.op)
            .ok_or_else(|| BackwardError::InvalidNode(format!("'{}' is not a convolution", forward.name)))?;
        for connector in required {
            if !matches!(connector.as_str(), "X" | "W" | "B") {
                return Err(BackwardError::MissingConnector {
                    node: forward.name.clone(),
                    connector: connector.clone(),
                });
            }
        }
        let wants = |c: &str| required.iter().any(|r| r == c);
        let x_desc = ctx.in_desc("X")?;
        let w_desc = ctx.in_desc("W")?;
        let dtype = x_desc.dtype.clone();
        let x_shape = x_desc.nchw("X")?;
        let w_shape = w_desc.nchw("W")?;
        let y_shape = ctx.out_desc("Y")?.nchw("Y")?;

        let mut nsdfg = Graph::new(format!("{}_backward", forward.name));
        let mut result = BackwardResult::empty();
        let dy = add_backward_desc_for_connector(&mut nsdfg, ctx, "Y", false)?;
        result.given_grad_names.insert("Y".to_string(), dy.clone());
        for connector in ["X", "W", "B"] {
            if wants(connector) {
                let grad = add_backward_desc_for_connector(&mut nsdfg, ctx, connector, true)?;
                result.required_grad_names.insert(connector.to_string(), grad);
            }
        }
        import_forward_desc(&mut nsdfg, ctx, "X", true)?;
        import_forward_desc(&mut nsdfg, ctx, "W", true)?;

        let data_algo = attrs.data_algorithm.unwrap_or(ctx.config.conv_data_algorithm);
        let filter_algo = attrs.filter_algorithm.unwrap_or(ctx.config.conv_filter_algorithm);

        let mut bundle = DescriptorBundle::new(ctx.uid()?.backward());
        bundle.tensor("X_desc", x_shape, &dtype)?;
        bundle.filter("W_desc", w_shape, &dtype)?;
        bundle.tensor("dY_desc", y_shape, &dtype)?;
        if wants("X") {
            bundle.tensor("dX_desc", x_shape, &dtype)?;
        }
        if wants("W") {
            bundle.filter("dW_desc", w_shape, &dtype)?;
        }
        if wants("B") {
            bundle.tensor("dB_desc", [1, y_shape[1], 1, 1], &dtype)?;
        }
        bundle.convolution("conv_desc", attrs, &dtype)?;

        let mut queries = Vec::new();
        if wants("X") {
            queries.push(WorkspaceQuery {
                var: "data_ws_size".to_string(),
                call: format!(
                    "cudnnGetConvolutionBackwardDataWorkspaceSize({HANDLE}, {}, {}, {}, {}, CUDNN_CONVOLUTION_BWD_DATA_ALGO_{}, &data_ws_size)",
                    bundle.deref("W_desc"),
                    bundle.deref("dY_desc"),
                    bundle.deref("conv_desc"),
                    bundle.deref("dX_desc"),
                    data_algo.cudnn_suffix()
                ),
            });
        }
        if wants("W") {
            queries.push(WorkspaceQuery {
                var: "filter_ws_size".to_string(),
                call: format!(
                    "cudnnGetConvolutionBackwardFilterWorkspaceSize({HANDLE}, {}, {}, {}, {}, CUDNN_CONVOLUTION_BWD_FILTER_ALGO_{}, &filter_ws_size)",
                    bundle.deref("X_desc"),
                    bundle.deref("dY_desc"),
                    bundle.deref("conv_desc"),
                    bundle.deref("dW_desc"),
                    filter_algo.cudnn_suffix()
                ),
            });
        }
        bundle.workspace(&queries);

        let workspace = format!("__state->{}", bundle.field("workspace"));
        let workspace_size = bundle.deref("workspace_size");
        let mut code = handle_setup_code(true);
        writeln!(code, "float alpha = 1.f;").unwrap();
        writeln!(code, "float beta = 0.f;").unwrap();
        if wants("X") {
            writeln!(
                code,
                "{CHECK}(cudnnConvolutionBackwardData({HANDLE}, &alpha, {}, _W, {}, _dY, {}, CUDNN_CONVOLUTION_BWD_DATA_ALGO_{}, {workspace}, {workspace_size}, &beta, {}, _dX));",
                bundle.deref("W_desc"),
                bundle.deref("dY_desc"),
                bundle.deref("conv_desc"),
                data_algo.cudnn_suffix(),
                bundle.deref("dX_desc"),
            )
            .unwrap();
        }
        if wants("W") {
            writeln!(
                code,
                "{CHECK}(cudnnConvolutionBackwardFilter({HANDLE}, &alpha, {}, _X, {}, _dY, {}, CUDNN_CONVOLUTION_BWD_FILTER_ALGO_{}, {workspace}, {workspace_size}, &beta, {}, _dW));",
                bundle.deref("X_desc"),
                bundle.deref("dY_desc"),
                bundle.deref("conv_desc"),
                filter_algo.cudnn_suffix(),
                bundle.deref("dW_desc"),
            )
            .unwrap();
        }
        if wants("B") {
            writeln!(
                code,
                "{CHECK}(cudnnConvolutionBackwardBias({HANDLE}, &alpha, {}, _dY, &beta, {}, _dB));",
                bundle.deref("dY_desc"),
                bundle.deref("dB_desc"),
            )
            .unwrap();
        }

        let pointer = dtype.clone().ptr();
        let inputs: BTreeMap<String, _> = ["dY", "X", "W"]
            .iter()
            .map(|c| (format!("_{c}"), pointer.clone()))
            .collect();
        let outputs: BTreeMap<String, _> = result
            .required_grad_names
            .keys()
            .map(|c| (format!("_d{c}"), pointer.clone()))
            .collect();
        let label = bundle.prefix().to_string();
        let kernel = bundle.into_kernel(label, inputs, outputs, code);
        debug_assert!(unpaired_resources(&kernel).is_empty());

        let state = nsdfg.add_state(format!("{}_backward", forward.name));
        let nstate = nsdfg.state_mut(state)?;
        let kernel = nstate.add_node(Node::Native(kernel));
        let read = nstate.add_read(&dy);
        nstate.add_edge(read, None, kernel, Some("_dY"), Memlet::full(dy.as_str()));
        for name in ["X", "W"] {
            let read = nstate.add_read(name);
            nstate.add_edge(read, None, kernel, Some(&format!("_{name}")), Memlet::full(name));
        }
        for (connector, grad) in &result.required_grad_names {
            let write = nstate.add_write(grad);
            nstate.add_edge(kernel, Some(&format!("_d{connector}")), write, None, Memlet::full(grad.as_str()));
        }
        debug!(
            "'{}': cuDNN convolution backward for {:?} (data {:?}, filter {:?})",
            forward.name, required, data_algo, filter_algo
        );

        let outputs: Vec<String> = result.required_grad_names.values().cloned().collect();
        let mut unit = NestedUnit::new(nsdfg, [dy, "X".to_string(), "W".to_string()], outputs)?;
        unit.connect_forward("X")?;
        unit.connect_forward("W")?;
        Ok((unit, result))
    }
}
