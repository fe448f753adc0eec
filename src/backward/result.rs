use std::collections::BTreeMap;

use crate::backward::BackwardContext;
use crate::error::Result;
use crate::graph::{fresh_name, DataDesc, Graph};

/// Names of the gradient arrays a backward subgraph consumes and produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackwardResult {
    /// Forward output connector -> array holding its incoming gradient.
    pub given_grad_names: BTreeMap<String, String>,
    /// Forward input connector -> array the subgraph writes its gradient to.
    pub required_grad_names: BTreeMap<String, String>,
}

impl BackwardResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Declares `<name>_grad`, shaped like `desc`, as a non-transient array of
/// `nsdfg`. The name is fresh in both `nsdfg` and `forward`.
pub fn add_backward_desc(
    nsdfg: &mut Graph,
    forward: &Graph,
    desc: &DataDesc,
    name: &str,
) -> Result<String> {
    let grad_name = fresh_name(&format!("{name}_grad"), |n| {
        nsdfg.contains_array(n) || forward.contains_array(n)
    });
    nsdfg.add_datadesc(&grad_name, desc.clone().with_transient(false))?;
    Ok(grad_name)
}

/// [`add_backward_desc`] for the array on a connector of the forward node.
pub fn add_backward_desc_for_connector(
    nsdfg: &mut Graph,
    ctx: &BackwardContext<'_>,
    connector: &str,
    input: bool,
) -> Result<String> {
    let desc = if input {
        ctx.in_desc(connector)?
    } else {
        ctx.out_desc(connector)?
    };
    add_backward_desc(nsdfg, ctx.forward_graph, desc, connector)
}

/// Declares the forward array on `connector` in `nsdfg`, under the connector
/// name, as supplied from outside.
pub fn import_forward_desc(
    nsdfg: &mut Graph,
    ctx: &BackwardContext<'_>,
    connector: &str,
    input: bool,
) -> Result<String> {
    let desc = if input {
        ctx.in_desc(connector)?
    } else {
        ctx.out_desc(connector)?
    };
    nsdfg.add_datadesc(connector, desc.clone().with_transient(false))?;
    Ok(connector.to_string())
}
