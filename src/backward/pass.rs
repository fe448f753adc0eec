use std::collections::BTreeMap;

use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::backward::{Backend, BackwardContext, BackwardResult, CompletionHooks, Registry};
use crate::config::BackwardConfig;
use crate::error::{BackwardError, Result};
use crate::graph::{
    fresh_name, DataDesc, Graph, LinkSource, Memlet, NestedUnit, NodeIndex, State, StateId, Wcr,
};

/// Gradients to build for one forward operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradientRequest {
    pub state: StateId,
    pub node: NodeIndex,
    /// Output connectors whose gradients are available.
    pub given: Vec<String>,
    /// Input connectors whose gradients must be produced.
    pub required: Vec<String>,
}

impl GradientRequest {
    pub fn new(state: StateId, node: NodeIndex) -> Self {
        Self {
            state,
            node,
            given: Vec::new(),
            required: Vec::new(),
        }
    }

    pub fn given(mut self, connectors: &[&str]) -> Self {
        self.given.extend(connectors.iter().map(|c| c.to_string()));
        self
    }

    pub fn required(mut self, connectors: &[&str]) -> Self {
        self.required.extend(connectors.iter().map(|c| c.to_string()));
        self
    }
}

/// A backward unit as placed in the backward graph.
#[derive(Debug, Clone)]
pub struct EmbeddedUnit {
    pub forward_state: StateId,
    pub forward_node: NodeIndex,
    pub backend: Backend,
    /// The nested node in the backward state.
    pub node: NodeIndex,
    pub result: BackwardResult,
}

#[derive(Debug)]
pub struct BackwardOutput {
    pub graph: Graph,
    pub state: StateId,
    pub units: Vec<EmbeddedUnit>,
    /// Forward array -> array holding its gradient in `graph`.
    pub gradients: BTreeMap<String, String>,
    pub hooks_applied: usize,
}

impl BackwardOutput {
    pub fn gradient_of(&self, array: &str) -> Option<&str> {
        self.gradients.get(array).map(String::as_str)
    }
}

/// Access nodes shared between units of one backward state.
#[derive(Default)]
struct Wiring {
    gradients: BTreeMap<String, String>,
    /// Gradient array -> the access node every writer of it targets.
    writes: FxHashMap<String, NodeIndex>,
    /// Forward array -> its read node in the backward state.
    reads: FxHashMap<String, NodeIndex>,
}

/// Differentiates a list of forward operators into one backward graph.
///
/// Requests are processed in the given order, which should be reverse
/// topological so a gradient is complete before anything reads it. Once every
/// unit is embedded, the completion hooks the strategies queued are applied
/// to the forward graph.
pub struct BackwardPass<'r> {
    registry: &'r Registry,
    config: BackwardConfig,
}

impl<'r> BackwardPass<'r> {
    pub fn new(registry: &'r Registry, config: BackwardConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &BackwardConfig {
        &self.config
    }

    pub fn run(&self, forward: &mut Graph, requests: &[GradientRequest]) -> Result<BackwardOutput> {
        let mut hooks = CompletionHooks::new();
        let mut backward = Graph::new(format!("{}_backward", forward.name));
        let state = backward.add_state("backward");
        let mut wiring = Wiring::default();
        let mut units = Vec::with_capacity(requests.len());

        let snapshot: &Graph = forward;
        for request in requests {
            let (backend, implementation) = self.registry.select(
                request.node,
                request.state,
                snapshot,
                &self.config.backends,
            )?;
            let mut ctx = BackwardContext::new(
                snapshot,
                request.state,
                request.node,
                &self.config,
                &mut hooks,
            );
            let (unit, result) = implementation.backward(&mut ctx, &request.given, &request.required)?;
            let position = units.len() + 1;
            let node = embed(snapshot, request, unit, position, &result, &mut backward, state, &mut wiring)?;
            units.push(EmbeddedUnit {
                forward_state: request.state,
                forward_node: request.node,
                backend,
                node,
                result,
            });
        }

        let hooks_applied = hooks.run(forward)?;
        info!(
            "built '{}': {} unit(s), {} gradient array(s)",
            backward.name,
            units.len(),
            wiring.gradients.len()
        );
        Ok(BackwardOutput {
            graph: backward,
            state,
            units,
            gradients: wiring.gradients,
            hooks_applied,
        })
    }
}

/// Outer array wired to one unit boundary.
struct Port {
    outer: String,
    inner: String,
    desc: DataDesc,
}

fn gradient_name(wiring: &mut Wiring, forward: &Graph, backward: &Graph, array: &str) -> String {
    if let Some(name) = wiring.gradients.get(array) {
        return name.clone();
    }
    let name = fresh_name(&format!("{array}_grad"), |n| {
        forward.contains_array(n) || backward.contains_array(n) || wiring.gradients.values().any(|g| g == n)
    });
    wiring.gradients.insert(array.to_string(), name.clone());
    name
}

fn connector_array<'s>(state: &'s State, node: NodeIndex, connector: &str, input: bool) -> Result<&'s str> {
    let array = if input {
        state.in_array(node, connector)
    } else {
        state.out_array(node, connector)
    };
    array.ok_or_else(|| BackwardError::MissingConnector {
        node: state.node(node).map(|n| n.label().to_string()).unwrap_or_default(),
        connector: connector.to_string(),
    })
}

#[allow(clippy::too_many_arguments)]
fn embed(
    forward: &Graph,
    request: &GradientRequest,
    mut unit: NestedUnit,
    position: usize,
    result: &BackwardResult,
    backward: &mut Graph,
    state: StateId,
    wiring: &mut Wiring,
) -> Result<NodeIndex> {
    let fstate = forward.state(request.state)?;
    let op = fstate.operator(request.node)?;
    for connector in &request.required {
        if !result.required_grad_names.contains_key(connector) {
            return Err(BackwardError::InvalidNode(format!(
                "backward of '{}' does not produce the gradient of '{connector}'",
                op.name
            )));
        }
    }

    // resolve every boundary before the backward graph changes
    let mut incoming = Vec::new();
    let mut grad_inputs = Vec::new();
    for (connector, inner) in &result.given_grad_names {
        let array = connector_array(fstate, request.node, connector, false)?;
        grad_inputs.push(Port {
            outer: gradient_name(wiring, forward, backward, array),
            inner: inner.clone(),
            desc: unit.graph.array(inner)?.clone(),
        });
    }
    for link in &unit.forward_links {
        let outer = match &link.source {
            LinkSource::Connector(connector) => {
                let input = op.has_in_connector(connector);
                connector_array(fstate, request.node, connector, input)?.to_string()
            }
            LinkSource::Deferred(name) => name.clone(),
        };
        incoming.push(Port {
            outer,
            inner: link.inner.clone(),
            desc: unit.graph.array(&link.inner)?.clone(),
        });
    }
    for input in &unit.inputs {
        let wired = grad_inputs.iter().chain(&incoming).any(|p| &p.inner == input);
        if !wired {
            return Err(BackwardError::InvalidNode(format!(
                "input '{input}' of '{}' has no source",
                unit.graph.name
            )));
        }
    }
    let mut outgoing = Vec::new();
    for (connector, inner) in &result.required_grad_names {
        let array = connector_array(fstate, request.node, connector, true)?;
        outgoing.push(Port {
            outer: gradient_name(wiring, forward, backward, array),
            inner: inner.clone(),
            desc: unit.graph.array(inner)?.clone(),
        });
    }

    for port in grad_inputs.iter().chain(&incoming).chain(&outgoing) {
        if !backward.contains_array(&port.outer) {
            backward.add_datadesc(&port.outer, port.desc.clone().with_transient(false))?;
        }
    }

    // nested graphs are numbered after the top-level graph, in embedding order
    unit.graph.set_id(position);
    let label = unit.graph.name.clone();
    let bstate = backward.state_mut(state)?;
    let nested = bstate.add_nested(unit);
    for port in &grad_inputs {
        let src = match wiring.writes.get(&port.outer) {
            Some(&node) => node,
            None => bstate.add_read(&port.outer),
        };
        bstate.add_edge(src, None, nested, Some(&port.inner), Memlet::full(port.outer.as_str()));
    }
    for port in &incoming {
        let src = *wiring
            .reads
            .entry(port.outer.clone())
            .or_insert_with(|| bstate.add_read(&port.outer));
        bstate.add_edge(src, None, nested, Some(&port.inner), Memlet::full(port.outer.as_str()));
    }
    for port in &outgoing {
        match wiring.writes.get(&port.outer) {
            Some(&dst) => {
                bstate.add_edge(nested, Some(&port.inner), dst, None, Memlet::full(port.outer.as_str()));
                bstate.set_in_wcr(dst, Wcr::Sum);
                debug!("'{}' accumulates into '{}'", label, port.outer);
            }
            None => {
                let dst = bstate.add_write(&port.outer);
                bstate.add_edge(nested, Some(&port.inner), dst, None, Memlet::full(port.outer.as_str()));
                wiring.writes.insert(port.outer.clone(), dst);
            }
        }
    }
    debug!(
        "embedded '{label}' for '{}' ({} in, {} out)",
        op.name,
        grad_inputs.len() + incoming.len(),
        outgoing.len()
    );
    Ok(nested)
}
