use std::collections::{BTreeMap, BTreeSet};

use crate::error::{BackwardError, Result};
use crate::graph::{Const, DType, Graph, Operator};

/// A node inside a [`State`](crate::graph::State).
#[derive(Debug, Clone)]
pub enum Node {
    /// Read or write of a named array.
    Access(AccessNode),
    /// A library operator with named connectors.
    Operator(OperatorNode),
    /// Elementwise assignment over whole arrays.
    Tasklet(Tasklet),
    /// Dense elementwise production over an index space.
    Map(MapNode),
    /// A call into a native library.
    Native(NativeKernel),
    /// A self-contained subgraph.
    Nested(NestedUnit),
}

impl Node {
    pub fn label(&self) -> &str {
        match self {
            Node::Access(a) => &a.data,
            Node::Operator(op) => &op.name,
            Node::Tasklet(t) => &t.label,
            Node::Map(m) => &m.label,
            Node::Native(n) => &n.label,
            Node::Nested(n) => &n.graph.name,
        }
    }

    pub fn as_access(&self) -> Option<&AccessNode> {
        match self {
            Node::Access(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_operator(&self) -> Option<&OperatorNode> {
        match self {
            Node::Operator(op) => Some(op),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessNode {
    pub data: String,
}

/// A forward or backward tensor operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub name: String,
    pub op: Operator,
    pub in_connectors: Vec<String>,
    pub out_connectors: Vec<String>,
}

impl OperatorNode {
    pub fn new(name: impl Into<String>, op: Operator) -> Self {
        Self {
            name: name.into(),
            op,
            in_connectors: Vec::new(),
            out_connectors: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, connectors: &[&str]) -> Self {
        for c in connectors {
            self.add_in_connector(c);
        }
        self
    }

    pub fn with_outputs(mut self, connectors: &[&str]) -> Self {
        for c in connectors {
            self.add_out_connector(c);
        }
        self
    }

    /// Returns `false` when the connector already exists.
    pub fn add_in_connector(&mut self, connector: &str) -> bool {
        if self.has_in_connector(connector) {
            return false;
        }
        self.in_connectors.push(connector.to_string());
        true
    }

    /// Returns `false` when the connector already exists.
    pub fn add_out_connector(&mut self, connector: &str) -> bool {
        if self.has_out_connector(connector) {
            return false;
        }
        self.out_connectors.push(connector.to_string());
        true
    }

    pub fn has_in_connector(&self, connector: &str) -> bool {
        self.in_connectors.iter().any(|c| c == connector)
    }

    pub fn has_out_connector(&self, connector: &str) -> bool {
        self.out_connectors.iter().any(|c| c == connector)
    }
}

/// Scalar expression evaluated per element by tasklets and maps.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    /// Value read from an input connector.
    Input(String),
    Const(Const),
    Add(Box<ScalarExpr>, Box<ScalarExpr>),
    Sub(Box<ScalarExpr>, Box<ScalarExpr>),
    Mul(Box<ScalarExpr>, Box<ScalarExpr>),
    Exp(Box<ScalarExpr>),
}

impl ScalarExpr {
    pub fn input(connector: impl Into<String>) -> Self {
        ScalarExpr::Input(connector.into())
    }

    pub fn sub(lhs: ScalarExpr, rhs: ScalarExpr) -> Self {
        ScalarExpr::Sub(Box::new(lhs), Box::new(rhs))
    }

    pub fn mul(lhs: ScalarExpr, rhs: ScalarExpr) -> Self {
        ScalarExpr::Mul(Box::new(lhs), Box::new(rhs))
    }

    /// Input connectors referenced by the expression, first use first.
    pub fn inputs(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_inputs(&mut out);
        out
    }

    fn collect_inputs(&self, out: &mut Vec<String>) {
        match self {
            ScalarExpr::Input(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            ScalarExpr::Const(_) => {}
            ScalarExpr::Add(l, r) | ScalarExpr::Sub(l, r) | ScalarExpr::Mul(l, r) => {
                l.collect_inputs(out);
                r.collect_inputs(out);
            }
            ScalarExpr::Exp(e) => e.collect_inputs(out),
        }
    }

    pub fn eval(&self, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64> {
        Ok(match self {
            ScalarExpr::Input(name) => lookup(name)
                .ok_or_else(|| BackwardError::Interpret(format!("unbound input '{name}'")))?,
            ScalarExpr::Const(c) => c.as_f64(),
            ScalarExpr::Add(l, r) => l.eval(lookup)? + r.eval(lookup)?,
            ScalarExpr::Sub(l, r) => l.eval(lookup)? - r.eval(lookup)?,
            ScalarExpr::Mul(l, r) => l.eval(lookup)? * r.eval(lookup)?,
            ScalarExpr::Exp(e) => e.eval(lookup)?.exp(),
        })
    }
}

impl std::fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarExpr::Input(name) => write!(f, "{name}"),
            ScalarExpr::Const(c) => write!(f, "{c}"),
            ScalarExpr::Add(l, r) => write!(f, "({l} + {r})"),
            ScalarExpr::Sub(l, r) => write!(f, "({l} - {r})"),
            ScalarExpr::Mul(l, r) => write!(f, "({l} * {r})"),
            ScalarExpr::Exp(e) => write!(f, "exp({e})"),
        }
    }
}

/// `output[...] = expr(inputs...)` over whole arrays, inputs broadcast to the
/// output shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tasklet {
    pub label: String,
    pub output: String,
    pub expr: ScalarExpr,
}

/// Connector of a map bound to an array element through index parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapAccess {
    pub connector: String,
    pub data: String,
    pub index: Vec<String>,
}

/// `for params in ranges: output[index] = expr(inputs[index]...)`
#[derive(Debug, Clone, PartialEq)]
pub struct MapNode {
    pub label: String,
    pub params: Vec<String>,
    pub ranges: Vec<usize>,
    pub inputs: Vec<MapAccess>,
    pub output: MapAccess,
    pub expr: ScalarExpr,
}

/// A native code block with lifecycle slots.
///
/// `code_init` runs once before the first invocation, `code` on every
/// invocation, and `code_exit` once at teardown. `state_fields` are the
/// persistent per-node variables the three blocks share.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeKernel {
    pub label: String,
    pub inputs: BTreeMap<String, DType>,
    pub outputs: BTreeMap<String, DType>,
    pub code: String,
    pub code_init: String,
    pub code_exit: String,
    pub state_fields: Vec<String>,
    /// Native libraries the block links against.
    pub environments: BTreeSet<String>,
}

/// Where a nested unit's input comes from in the forward graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSource {
    /// The array attached to this connector of the forward node.
    Connector(String),
    /// An array that a completion hook will add to the forward graph.
    Deferred(String),
}

/// Request to wire a forward array into one of a unit's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardLink {
    pub inner: String,
    pub source: LinkSource,
}

/// A subgraph embeddable as one opaque node, with explicit input and output
/// array sets.
#[derive(Debug, Clone)]
pub struct NestedUnit {
    pub graph: Graph,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    pub forward_links: Vec<ForwardLink>,
}

impl NestedUnit {
    /// Every declared input and output must be a non-transient array of `graph`.
    pub fn new(
        graph: Graph,
        inputs: impl IntoIterator<Item = String>,
        outputs: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let inputs: BTreeSet<String> = inputs.into_iter().collect();
        let outputs: BTreeSet<String> = outputs.into_iter().collect();
        for name in inputs.iter().chain(outputs.iter()) {
            let desc = graph.array(name)?;
            if desc.transient {
                return Err(BackwardError::InvalidNode(format!(
                    "'{name}' is declared as a unit boundary of '{}' but is transient",
                    graph.name
                )));
            }
        }
        Ok(Self {
            graph,
            inputs,
            outputs,
            forward_links: Vec::new(),
        })
    }

    /// Wires the array on forward connector `connector` into the input of the same name.
    pub fn connect_forward(&mut self, connector: &str) -> Result<()> {
        self.link(connector, LinkSource::Connector(connector.to_string()))
    }

    pub fn link(&mut self, inner: &str, source: LinkSource) -> Result<()> {
        if !self.inputs.contains(inner) {
            return Err(BackwardError::InvalidNode(format!(
                "'{inner}' is not an input of '{}'",
                self.graph.name
            )));
        }
        if self.forward_links.iter().any(|l| l.inner == inner) {
            return Ok(());
        }
        self.forward_links.push(ForwardLink {
            inner: inner.to_string(),
            source,
        });
        Ok(())
    }

    pub fn forward_link(&self, inner: &str) -> Option<&ForwardLink> {
        self.forward_links.iter().find(|l| l.inner == inner)
    }
}
