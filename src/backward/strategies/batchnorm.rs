use std::collections::BTreeMap;
use std::fmt::Write;

use log::{debug, info};

use crate::backward::native::{
    check_size_carrier, cudnn_dtype, handle_setup_code, unpaired_resources, DescriptorBundle,
    WorkspaceQuery, CHECK, HANDLE,
};
use crate::backward::{add_backward_desc_for_connector, import_forward_desc};
use crate::backward::{BackwardContext, BackwardImplementation, BackwardResult};
use crate::error::{BackwardError, Result};
use crate::graph::{
    fresh_name, DType, DataDesc, Graph, LinkSource, Memlet, NestedUnit, Node, NodeIndex, Operator,
    StateId, Storage,
};

/// Training-mode batch normalization gradients through
/// `cudnnBatchNormalizationBackwardEx`.
///
/// The backward kernel needs the reserve space the forward kernel filled.
/// The forward node does not expose it, so this strategy queues a completion
/// hook that adds `reserved_ptr` / `reserved_size` outputs to the forward node
/// and switches its lowering to populate them.
pub struct CudnnBatchNormBackward;

/// Forward connectors whose gradients the fused kernel always produces.
const PRODUCED: [&str; 3] = ["X", "scale", "B"];

fn check_supported(node: NodeIndex, state: StateId, graph: &Graph) -> Result<()> {
    let op = graph.state(state)?.operator(node)?;
    if !matches!(op.op, Operator::BatchNormalization(_)) {
        return Err(BackwardError::InvalidNode(format!(
            "'{}' is not a batch normalization",
            op.name
        )));
    }
    // training mode exposes the batch statistics
    for connector in ["saved_mean", "saved_var", "Y"] {
        graph.out_desc_with_name(state, node, connector)?;
    }
    for connector in ["scale", "B"] {
        graph.in_desc_with_name(state, node, connector)?;
    }
    let x = graph.in_desc_with_name(state, node, "X")?;
    x.nchw("X")?;
    cudnn_dtype(&x.dtype)?;
    Ok(())
}

/// Gradient array of forward input `connector`: a unit output when requested,
/// scratch otherwise.
fn gradient_array(
    nsdfg: &mut Graph,
    ctx: &BackwardContext<'_>,
    result: &mut BackwardResult,
    connector: &str,
    requested: bool,
) -> Result<String> {
    if requested {
        let grad = add_backward_desc_for_connector(nsdfg, ctx, connector, true)?;
        result
            .required_grad_names
            .insert(connector.to_string(), grad.clone());
        return Ok(grad);
    }
    let name = fresh_name(&format!("{connector}_grad_unused"), |n| nsdfg.contains_array(n));
    nsdfg.add_datadesc(&name, ctx.in_desc(connector)?.clone().with_transient(true))?;
    Ok(name)
}

impl BackwardImplementation for CudnnBatchNormBackward {
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
        let Operator::BatchNormalization(attrs) = &forward.op else {
            return Err(BackwardError::InvalidNode(format!(
                "'{}' is not a batch normalization",
                forward.name
            )));
        };
        for connector in required {
            if !PRODUCED.contains(&connector.as_str()) {
                return Err(BackwardError::MissingConnector {
                    node: forward.name.clone(),
                    connector: connector.clone(),
                });
            }
        }
        let x_desc = ctx.in_desc("X")?;
        let dtype = x_desc.dtype.clone();
        let x_shape = x_desc.nchw("X")?;
        let size_dtype = ctx.config.reserved_size_dtype.clone();
        check_size_carrier(&size_dtype)?;

        let mut nsdfg = Graph::new(format!("{}_backward", forward.name));
        let mut result = BackwardResult::empty();
        let dy = add_backward_desc_for_connector(&mut nsdfg, ctx, "Y", false)?;
        result.given_grad_names.insert("Y".to_string(), dy.clone());
        let mut grads = BTreeMap::new();
        for connector in PRODUCED {
            let requested = required.iter().any(|r| r == connector);
            let grad = gradient_array(&mut nsdfg, ctx, &mut result, connector, requested)?;
            grads.insert(connector, grad);
        }
        import_forward_desc(&mut nsdfg, ctx, "X", true)?;
        import_forward_desc(&mut nsdfg, ctx, "scale", true)?;
        import_forward_desc(&mut nsdfg, ctx, "saved_mean", false)?;
        import_forward_desc(&mut nsdfg, ctx, "saved_var", false)?;

        let reserved_ptr_desc = DataDesc::scalar(DType::Void.ptr()).with_storage(Storage::CpuHeap);
        let reserved_size_desc = DataDesc::scalar(size_dtype.clone()).with_storage(Storage::CpuHeap);
        nsdfg.add_datadesc("reserved_ptr", reserved_ptr_desc.clone())?;
        nsdfg.add_datadesc("reserved_size", reserved_size_desc.clone())?;

        let mut bundle = DescriptorBundle::new(ctx.uid()?.backward());
        bundle.tensor("X_desc", x_shape, &dtype)?;
        bundle.tensor("dX_desc", x_shape, &dtype)?;
        bundle.tensor("dY_desc", ctx.out_desc("Y")?.nchw("Y")?, &dtype)?;
        bundle.batchnorm_derived("dScale_desc", "X_desc");
        bundle.workspace(&[WorkspaceQuery {
            var: "bn_ws_size".to_string(),
            call: format!(
                "cudnnGetBatchNormalizationBackwardExWorkspaceSize({HANDLE}, CUDNN_BATCHNORM_SPATIAL, CUDNN_BATCHNORM_OPS_BN, {}, nullptr, {}, nullptr, {}, {}, nullptr, &bn_ws_size)",
                bundle.deref("X_desc"),
                bundle.deref("dY_desc"),
                bundle.deref("dX_desc"),
                bundle.deref("dScale_desc"),
            ),
        }]);

        let mut code = handle_setup_code(true);
        writeln!(code, "float alpha = 1.f;").unwrap();
        writeln!(code, "float beta = 0.f;").unwrap();
        writeln!(
            code,
            "{CHECK}(cudnnBatchNormalizationBackwardEx({HANDLE}, CUDNN_BATCHNORM_SPATIAL, CUDNN_BATCHNORM_OPS_BN, \
             &alpha, &beta, &alpha, &beta, {x}, _X, nullptr, nullptr, {dy}, _dY, nullptr, nullptr, {dx}, _dX, \
             {dscale}, _scale, nullptr, _dScale, _dBias, {eps:?}, _saved_mean, _saved_var, nullptr, \
             __state->{ws}, *__state->{ws_size}, _reserved_ptr, _reserved_size));",
            x = bundle.deref("X_desc"),
            dy = bundle.deref("dY_desc"),
            dx = bundle.deref("dX_desc"),
            dscale = bundle.deref("dScale_desc"),
            eps = attrs.epsilon,
            ws = bundle.field("workspace"),
            ws_size = bundle.field("workspace_size"),
        )
        .unwrap();

        let pointer = dtype.clone().ptr();
        let mut inputs: BTreeMap<String, DType> = ["X", "dY", "scale", "saved_mean", "saved_var"]
            .iter()
            .map(|c| (format!("_{c}"), pointer.clone()))
            .collect();
        inputs.insert("_reserved_ptr".to_string(), DType::Void.ptr());
        inputs.insert("_reserved_size".to_string(), size_dtype);
        let outputs: BTreeMap<String, DType> = ["dX", "dScale", "dBias"]
            .iter()
            .map(|c| (format!("_{c}"), pointer.clone()))
            .collect();
        let label = bundle.prefix().to_string();
        let kernel = bundle.into_kernel(label, inputs, outputs, code);
        debug_assert!(unpaired_resources(&kernel).is_empty());

        let state = nsdfg.add_state(format!("{}_backward", forward.name));
        let nstate = nsdfg.state_mut(state)?;
        let kernel = nstate.add_node(Node::Native(kernel));
        let read = nstate.add_read(&dy);
        nstate.add_edge(read, None, kernel, Some("_dY"), Memlet::full(dy.as_str()));
        for name in ["X", "scale", "saved_mean", "saved_var"] {
            let read = nstate.add_read(name);
            nstate.add_edge(read, None, kernel, Some(&format!("_{name}")), Memlet::full(name));
        }
        for name in ["reserved_ptr", "reserved_size"] {
            let read = nstate.add_read(name);
            nstate.add_edge(read, None, kernel, Some(&format!("_{name}")), Memlet::element(name, vec![0]));
        }
        for (connector, out) in [("X", "_dX"), ("scale", "_dScale"), ("B", "_dBias")] {
            let grad = &grads[connector];
            let write = nstate.add_write(grad);
            nstate.add_edge(kernel, Some(out), write, None, Memlet::full(grad.as_str()));
        }

        // the forward graph only changes once every node has been differentiated
        let reserved_ptr = ctx.hooks.reserve_name(ctx.forward_graph, "reserved_ptr");
        let reserved_size = ctx.hooks.reserve_name(ctx.forward_graph, "reserved_size");
        let hook_state = ctx.forward_state;
        let hook_node = ctx.forward_node;
        let hook_ptr = reserved_ptr.clone();
        let hook_size = reserved_size.clone();
        ctx.hooks.push(
            format!("expose reserve space of '{}'", forward.name),
            Box::new(move |graph: &mut Graph| {
                graph.add_datadesc(&hook_ptr, reserved_ptr_desc)?;
                graph.add_datadesc(&hook_size, reserved_size_desc)?;
                let state = graph.state_mut(hook_state)?;
                let op = state.operator_mut(hook_node)?;
                for connector in ["reserved_ptr", "reserved_size"] {
                    if !op.add_out_connector(connector) {
                        return Err(BackwardError::InvalidNode(format!(
                            "'{}' already has connector '{connector}'",
                            op.name
                        )));
                    }
                }
                if let Operator::BatchNormalization(attrs) = &mut op.op {
                    attrs.expose_reserve_space = true;
                }
                let name = op.name.clone();
                for (connector, array) in [("reserved_ptr", &hook_ptr), ("reserved_size", &hook_size)] {
                    let write = state.add_write(array);
                    state.add_edge(hook_node, Some(connector), write, None, Memlet::element(array.as_str(), vec![0]));
                }
                info!("'{name}' now writes its reserve space to '{hook_ptr}' / '{hook_size}'");
                Ok(())
            }),
        );
        debug!(
            "'{}': cuDNN batch normalization backward, reserve space via '{reserved_ptr}' / '{reserved_size}'",
            forward.name
        );

        let outputs: Vec<String> = result.required_grad_names.values().cloned().collect();
        let inputs = [dy.as_str(), "X", "scale", "saved_mean", "saved_var", "reserved_ptr", "reserved_size"]
            .map(String::from);
        let mut unit = NestedUnit::new(nsdfg, inputs, outputs)?;
        unit.connect_forward("X")?;
        unit.connect_forward("scale")?;
        unit.connect_forward("saved_mean")?;
        unit.connect_forward("saved_var")?;
        unit.link("reserved_ptr", LinkSource::Deferred(reserved_ptr))?;
        unit.link("reserved_size", LinkSource::Deferred(reserved_size))?;
        Ok((unit, result))
    }
}
