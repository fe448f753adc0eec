use crate::backward::program::{BackwardProgram, Step};
use crate::backward::{BackwardContext, BackwardImplementation, BackwardResult};
use crate::error::{BackwardError, Result};
use crate::graph::{normalize_axis, DataDesc, Graph, NestedUnit, NodeIndex, Operator, ScalarExpr, StateId};

/// `dx = y * dy - y * sum(y * dy, axis)`
pub struct SoftmaxBackward;

/// `dx = dy - exp(y) * sum(dy, axis)`
pub struct LogSoftmaxBackward;

fn softmax_axis(op: &Operator) -> Option<i64> {
    match op {
        Operator::Softmax { axis } | Operator::LogSoftmax { axis } => Some(*axis),
        _ => None,
    }
}

fn softmax_applicable(node: NodeIndex, state: StateId, graph: &Graph) -> bool {
    let Ok(op) = graph.state(state).and_then(|s| s.operator(node)) else {
        return false;
    };
    let Some(axis) = softmax_axis(&op.op) else {
        return false;
    };
    let (Ok(input), Ok(output)) = (
        graph.in_desc_with_name(state, node, "input"),
        graph.out_desc_with_name(state, node, "output"),
    ) else {
        return false;
    };
    input.shape == output.shape && normalize_axis(axis, input.rank()).is_some()
}

/// Normalized axis and the shape of a keepdims reduction along it.
fn reduction(ctx: &BackwardContext<'_>) -> Result<(usize, DataDesc)> {
    let forward = ctx.forward_op()?;
    let output = ctx.out_desc("output")?;
    let axis = softmax_axis(&forward.op).ok_or_else(|| {
        BackwardError::InvalidNode(format!("'{}' is not a softmax", forward.name))
    })?;
    let axis = normalize_axis(axis, output.rank()).ok_or_else(|| {
        BackwardError::UnsupportedLayout(format!(
            "axis {axis} of '{}' is out of range for rank {}",
            forward.name,
            output.rank()
        ))
    })?;
    let mut sums = output.clone();
    sums.shape[axis] = 1;
    Ok((axis, sums))
}

impl BackwardImplementation for SoftmaxBackward {
    fn applicable(&self, node: NodeIndex, state: StateId, graph: &Graph) -> bool {
        softmax_applicable(node, state, graph)
    }

    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        _given: &[String],
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)> {
        let (axis, sums) = reduction(ctx)?;
        let output = ctx.out_desc("output")?;

        let program = BackwardProgram::new("softmax_backward")
            .param("output")
            .param("output_grad")
            .param("input_grad")
            .local("prod", output.shape.clone(), output.dtype.clone())
            .local("sums", sums.shape, sums.dtype)
            .step(Step::Mul {
                a: "output".into(),
                b: "output_grad".into(),
                out: "prod".into(),
            })
            .step(Step::ReduceSum {
                data: "prod".into(),
                out: "sums".into(),
                axis,
                keepdims: true,
            })
            .step(Step::Mul {
                a: "output".into(),
                b: "sums".into(),
                out: "input_grad".into(),
            })
            .step(Step::Assign {
                out: "input_grad".into(),
                expr: ScalarExpr::sub(ScalarExpr::input("prod"), ScalarExpr::input("input_grad")),
            });

        program.lower(ctx, required)
    }
}

impl BackwardImplementation for LogSoftmaxBackward {
    fn applicable(&self, node: NodeIndex, state: StateId, graph: &Graph) -> bool {
        softmax_applicable(node, state, graph)
    }

    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        _given: &[String],
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)> {
        let (axis, sums) = reduction(ctx)?;
        let output = ctx.out_desc("output")?;

        let program = BackwardProgram::new("log_softmax_backward")
            .param("output")
            .param("output_grad")
            .param("input_grad")
            .local("exp_output", output.shape.clone(), output.dtype.clone())
            .local("grad_sum", sums.shape, sums.dtype)
            .step(Step::Exp {
                input: "output".into(),
                out: "exp_output".into(),
            })
            .step(Step::ReduceSum {
                data: "output_grad".into(),
                out: "grad_sum".into(),
                axis,
                keepdims: true,
            })
            .step(Step::Assign {
                out: "exp_output".into(),
                expr: ScalarExpr::mul(ScalarExpr::input("exp_output"), ScalarExpr::input("grad_sum")),
            })
            .step(Step::Sub {
                a: "output_grad".into(),
                b: "exp_output".into(),
                out: "input_grad".into(),
            });

        program.lower(ctx, required)
    }
}
