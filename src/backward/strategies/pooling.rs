use log::debug;

use crate::backward::program::{BackwardProgram, Step};
use crate::backward::{BackwardContext, BackwardImplementation, BackwardResult};
use crate::error::Result;
use crate::graph::{Graph, NestedUnit, NodeIndex, Operator, ScalarExpr, StateId};

/// Spreads each pooled gradient evenly over its `H x W` window.
pub struct GlobalAveragePoolBackward;

impl BackwardImplementation for GlobalAveragePoolBackward {
    fn applicable(&self, node: NodeIndex, state: StateId, graph: &Graph) -> bool {
        let is_pool = graph
            .state(state)
            .and_then(|s| s.operator(node))
            .map(|op| op.op == Operator::GlobalAveragePool)
            .unwrap_or(false);
        is_pool
            && graph
                .in_desc_with_name(state, node, "X")
                .map(|desc| desc.rank() == 4 && desc.dtype.is_float())
                .unwrap_or(false)
    }

    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        _given: &[String],
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)> {
        let desc = ctx.in_desc("X")?;
        let [n, c, h, w] = desc.nchw("X")?;
        let inv = desc.dtype.constant(1.0 / (h * w) as f64)?;
        debug!("GlobalAveragePool backward: scale {inv} over {h}x{w}");

        let index = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let program = BackwardProgram::new("global_average_pool_backward")
            .param("Y_grad")
            .param("X_grad")
            .step(Step::Map {
                label: "spread_gradient".to_string(),
                params: index(&["n", "c", "h", "w"]),
                ranges: vec![n, c, h, w],
                inputs: vec![("Y_grad".to_string(), index(&["n", "c"]))],
                out: ("X_grad".to_string(), index(&["n", "c", "h", "w"])),
                expr: ScalarExpr::mul(ScalarExpr::input("Y_grad"), ScalarExpr::Const(inv)),
            });
        program.lower(ctx, required)
    }
}
