use log::debug;
use rustc_hash::FxHashMap;

use crate::backward::{add_backward_desc_for_connector, import_forward_desc};
use crate::backward::{BackwardContext, BackwardImplementation, BackwardResult};
use crate::einsum::EinsumExpr;
use crate::error::{BackwardError, Result};
use crate::graph::{
    parse_variadic_param, Graph, Memlet, NestedUnit, NodeIndex, Operator, OperatorNode, StateId,
};

/// Gradient of a contraction: one reversed contraction per required operand.
pub struct EinsumBackward;

fn equation_of(op: &Operator) -> Option<&str> {
    match op {
        Operator::Einsum { equation } => Some(equation),
        _ => None,
    }
}

/// Operand index of an `Inputs__<i>` connector.
fn operand_index(connector: &str) -> Result<usize> {
    match parse_variadic_param(connector) {
        Some(("Inputs", index)) => Ok(index),
        _ => Err(BackwardError::InvalidNode(format!(
            "'{connector}' is not a contraction operand"
        ))),
    }
}

impl BackwardImplementation for EinsumBackward {
    fn applicable(&self, node: NodeIndex, state: StateId, graph: &Graph) -> bool {
        let Ok(op) = graph.state(state).and_then(|s| s.operator(node)) else {
            return false;
        };
        let Some(equation) = equation_of(&op.op) else {
            return false;
        };
        let Ok(expr) = EinsumExpr::parse(equation) else {
            return false;
        };
        // every operand must be connected and ranked like its term
        let operands_match = expr.inputs.iter().enumerate().all(|(i, term)| {
            graph
                .in_desc_with_name(state, node, &format!("Inputs__{i}"))
                .map(|desc| desc.rank() == term.len())
                .unwrap_or(false)
        });
        operands_match
            && graph.out_desc_with_name(state, node, "Output").is_ok()
            && expr.is_reversible()
    }

    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        _given: &[String],
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)> {
        let forward = ctx.forward_op()?;
        let equation = equation_of(&forward.op).ok_or_else(|| {
            BackwardError::InvalidNode(format!("'{}' is not a contraction", forward.name))
        })?;
        let expr = EinsumExpr::parse(equation)?;

        let mut nsdfg = Graph::new(format!("{}_backward", forward.name));
        let mut result = BackwardResult::empty();
        let output_grad = add_backward_desc_for_connector(&mut nsdfg, ctx, "Output", false)?;
        result
            .given_grad_names
            .insert("Output".to_string(), output_grad.clone());

        // reverse every target before touching the subgraph
        let mut plans = Vec::with_capacity(required.len());
        for connector in required {
            let target = operand_index(connector)?;
            let (operands, reversed) = expr.reverse_wrt(target)?;
            plans.push((connector.clone(), operands, reversed));
        }

        let state = nsdfg.add_state(format!("{}_backward", forward.name));
        let mut inputs = vec![output_grad.clone()];
        let mut outputs = Vec::new();
        let mut imported: FxHashMap<String, NodeIndex> = FxHashMap::default();

        for (connector, _, _) in &plans {
            let grad = add_backward_desc_for_connector(&mut nsdfg, ctx, connector, true)?;
            result.required_grad_names.insert(connector.clone(), grad.clone());
            outputs.push(grad);
        }
        let mut forward_operands: Vec<String> = plans
            .iter()
            .flat_map(|(_, operands, _)| operands.iter().map(|i| format!("Inputs__{i}")))
            .collect();
        forward_operands.sort();
        forward_operands.dedup();
        for connector in &forward_operands {
            import_forward_desc(&mut nsdfg, ctx, connector, true)?;
            inputs.push(connector.clone());
        }

        let nstate = nsdfg.state_mut(state)?;
        let output_grad_read = nstate.add_read(&output_grad);
        for (connector, operands, reversed) in plans {
            let grad = &result.required_grad_names[&connector];
            let conns: Vec<String> = (0..reversed.num_inputs()).map(|i| format!("Inputs__{i}")).collect();
            let conn_refs: Vec<&str> = conns.iter().map(String::as_str).collect();
            let einsum = nstate.add_operator(
                OperatorNode::new(
                    format!("{}_{connector}_backward", forward.name),
                    Operator::Einsum {
                        equation: reversed.to_string(),
                    },
                )
                .with_inputs(&conn_refs)
                .with_outputs(&["Output"]),
            );
            nstate.add_edge(
                output_grad_read,
                None,
                einsum,
                Some("Inputs__0"),
                Memlet::full(output_grad.as_str()),
            );
            for (slot, operand) in operands.iter().enumerate() {
                let array = format!("Inputs__{operand}");
                let read = *imported
                    .entry(array.clone())
                    .or_insert_with(|| nstate.add_read(&array));
                let conn = format!("Inputs__{}", slot + 1);
                nstate.add_edge(read, None, einsum, Some(&conn), Memlet::full(array));
            }
            let write = nstate.add_write(grad);
            nstate.add_edge(einsum, Some("Output"), write, None, Memlet::full(grad.as_str()));
            debug!("'{}': gradient of {connector} via '{reversed}'", forward.name);
        }

        let mut unit = NestedUnit::new(nsdfg, inputs, outputs)?;
        for connector in &forward_operands {
            unit.connect_forward(connector)?;
        }
        Ok((unit, result))
    }
}
