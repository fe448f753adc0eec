//! Lowering of small backward formulas into nested subgraphs
//!
//! A [`BackwardProgram`] is a straight-line list of elementwise and reduction
//! [`Step`]s over named arrays. Its parameters are bound to the forward node
//! by name:
//!
//! - `<connector>_grad` for an output connector is a given gradient,
//! - `<connector>_grad` for an input connector is a required gradient,
//! - a bare connector name is the forward array on that connector, linked
//!   into the unit whether it is an input or an output of the node.
//!
//! Every other array must be declared with [`BackwardProgram::local`].

use log::debug;
use rustc_hash::FxHashMap;

use crate::backward::{BackwardContext, BackwardResult};
use crate::error::{BackwardError, Result};
use crate::graph::{
    DType, Graph, MapAccess, MapNode, Memlet, NestedUnit, Node, NodeIndex, Operator, OperatorNode,
    ScalarExpr, State, StateId, Tasklet,
};

/// One statement of a backward program.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// `out = a * b` (broadcasting)
    Mul { a: String, b: String, out: String },
    /// `out = a - b` (broadcasting)
    Sub { a: String, b: String, out: String },
    /// `out = exp(input)`
    Exp { input: String, out: String },
    /// `out = sum(data, axis)`
    ReduceSum {
        data: String,
        out: String,
        axis: usize,
        keepdims: bool,
    },
    /// `out[:] = expr`, where the inputs of `expr` name arrays.
    Assign { out: String, expr: ScalarExpr },
    /// `for params in ranges: out[out_index] = expr`, where the inputs of
    /// `expr` name arrays read at their listed index.
    Map {
        label: String,
        params: Vec<String>,
        ranges: Vec<usize>,
        inputs: Vec<(String, Vec<String>)>,
        out: (String, Vec<String>),
        expr: ScalarExpr,
    },
}

/// How a program parameter binds to the forward node.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    GivenGrad(String),
    RequiredGrad(String),
    /// Gradient of an input nobody asked for; computed into scratch.
    UnrequestedGrad(String),
    ForwardInput(String),
    ForwardOutput(String),
}

/// A straight-line backward formula for one forward node.
#[derive(Debug, Clone, Default)]
pub struct BackwardProgram {
    name: String,
    params: Vec<String>,
    locals: Vec<(String, Vec<usize>, DType)>,
    steps: Vec<Step>,
}

impl BackwardProgram {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, name: &str) -> Self {
        self.params.push(name.to_string());
        self
    }

    pub fn local(mut self, name: &str, shape: Vec<usize>, dtype: DType) -> Self {
        self.locals.push((name.to_string(), shape, dtype));
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Lowers the program for `ctx.forward_node` into a nested unit.
    ///
    /// `required` lists the input connectors whose gradients the caller asked
    /// for; each must be produced by a `<connector>_grad` parameter.
    pub fn lower(
        self,
        ctx: &BackwardContext<'_>,
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)> {
        let forward = ctx.forward_op()?;
        let mut nsdfg = Graph::new(format!("{}_backward", forward.name));
        let mut result = BackwardResult::empty();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut forward_params = Vec::new();

        for param in &self.params {
            let binding = self.bind(param, ctx, required)?;
            match &binding {
                Binding::GivenGrad(conn) => {
                    nsdfg.add_datadesc(param, ctx.out_desc(conn)?.clone().with_transient(false))?;
                    result.given_grad_names.insert(conn.clone(), param.clone());
                    inputs.push(param.clone());
                }
                Binding::RequiredGrad(conn) => {
                    nsdfg.add_datadesc(param, ctx.in_desc(conn)?.clone().with_transient(false))?;
                    result.required_grad_names.insert(conn.clone(), param.clone());
                    outputs.push(param.clone());
                }
                Binding::UnrequestedGrad(conn) => {
                    nsdfg.add_datadesc(param, ctx.in_desc(conn)?.clone().with_transient(true))?;
                }
                Binding::ForwardInput(conn) => {
                    nsdfg.add_datadesc(param, ctx.in_desc(conn)?.clone().with_transient(false))?;
                    inputs.push(param.clone());
                    forward_params.push(param.clone());
                }
                Binding::ForwardOutput(conn) => {
                    nsdfg.add_datadesc(param, ctx.out_desc(conn)?.clone().with_transient(false))?;
                    inputs.push(param.clone());
                    forward_params.push(param.clone());
                }
            }
        }

        for connector in required {
            if !result.required_grad_names.contains_key(connector) {
                return Err(BackwardError::InvalidProgram(format!(
                    "'{}' does not produce the gradient of '{connector}'",
                    self.name
                )));
            }
        }

        for (name, shape, dtype) in &self.locals {
            nsdfg.add_transient(name, shape.clone(), dtype.clone())?;
        }

        let state = nsdfg.add_state(self.name.clone());
        self.lower_steps(&mut nsdfg, state)?;
        debug!(
            "lowered backward program '{}' ({} steps) for '{}'",
            self.name,
            self.steps.len(),
            forward.name
        );

        let mut unit = NestedUnit::new(nsdfg, inputs, outputs)?;
        for conn in forward_params {
            unit.connect_forward(&conn)?;
        }
        Ok((unit, result))
    }

    fn bind(&self, param: &str, ctx: &BackwardContext<'_>, required: &[String]) -> Result<Binding> {
        let forward = ctx.forward_op()?;
        if let Some(conn) = param.strip_suffix("_grad") {
            if forward.has_out_connector(conn) {
                return Ok(Binding::GivenGrad(conn.to_string()));
            }
            if forward.has_in_connector(conn) {
                return Ok(if required.iter().any(|r| r == conn) {
                    Binding::RequiredGrad(conn.to_string())
                } else {
                    Binding::UnrequestedGrad(conn.to_string())
                });
            }
        }
        if forward.has_in_connector(param) {
            return Ok(Binding::ForwardInput(param.to_string()));
        }
        if forward.has_out_connector(param) {
            return Ok(Binding::ForwardOutput(param.to_string()));
        }
        Err(BackwardError::InvalidProgram(format!(
            "parameter '{param}' of '{}' matches no connector of '{}'",
            self.name, forward.name
        )))
    }

    fn lower_steps(&self, nsdfg: &mut Graph, state: StateId) -> Result<()> {
        for step in &self.steps {
            check_arrays(nsdfg, step)?;
        }
        let state = nsdfg.state_mut(state)?;
        let mut builder = StateBuilder {
            state,
            current: FxHashMap::default(),
        };
        for (i, step) in self.steps.iter().enumerate() {
            builder.lower_step(i, step);
        }
        Ok(())
    }
}

fn check_arrays(nsdfg: &Graph, step: &Step) -> Result<()> {
    let names: Vec<String> = match step {
        Step::Mul { a, b, out } | Step::Sub { a, b, out } => vec![a.clone(), b.clone(), out.clone()],
        Step::Exp { input, out } => vec![input.clone(), out.clone()],
        Step::ReduceSum { data, out, .. } => vec![data.clone(), out.clone()],
        Step::Assign { out, expr } => {
            let mut names = expr.inputs();
            names.push(out.clone());
            names
        }
        Step::Map { inputs, out, .. } => inputs
            .iter()
            .map(|(name, _)| name.clone())
            .chain(std::iter::once(out.0.clone()))
            .collect(),
    };
    for name in names {
        nsdfg.array(&name)?;
    }
    Ok(())
}

/// Tracks the most recent access node of every array so reads observe
/// earlier writes.
struct StateBuilder<'s> {
    state: &'s mut State,
    current: FxHashMap<String, NodeIndex>,
}

impl StateBuilder<'_> {
    fn read(&mut self, data: &str) -> NodeIndex {
        if let Some(&node) = self.current.get(data) {
            return node;
        }
        let node = self.state.add_read(data);
        self.current.insert(data.to_string(), node);
        node
    }

    fn write(&mut self, data: &str) -> NodeIndex {
        let node = self.state.add_write(data);
        self.current.insert(data.to_string(), node);
        node
    }

    fn connect_in(&mut self, data: &str, dst: NodeIndex, conn: &str) {
        let src = self.read(data);
        self.state.add_edge(src, None, dst, Some(conn), Memlet::full(data));
    }

    fn connect_out(&mut self, src: NodeIndex, conn: &str, data: &str) {
        let dst = self.write(data);
        self.state.add_edge(src, Some(conn), dst, None, Memlet::full(data));
    }

    fn operator(&mut self, name: String, op: Operator, ins: &[(&str, &str)], out: (&str, &str)) {
        let conns: Vec<&str> = ins.iter().map(|(conn, _)| *conn).collect();
        let node = self.state.add_operator(
            OperatorNode::new(name, op)
                .with_inputs(&conns)
                .with_outputs(&[out.0]),
        );
        for (conn, data) in ins {
            self.connect_in(data, node, conn);
        }
        self.connect_out(node, out.0, out.1);
    }

    fn lower_step(&mut self, i: usize, step: &Step) {
        match step {
            Step::Mul { a, b, out } => {
                self.operator(format!("Mul_{i}"), Operator::Mul, &[("A", a.as_str()), ("B", b.as_str())], ("C", out.as_str()))
            }
            Step::Sub { a, b, out } => {
                self.operator(format!("Sub_{i}"), Operator::Sub, &[("A", a.as_str()), ("B", b.as_str())], ("C", out.as_str()))
            }
            Step::Exp { input, out } => {
                self.operator(format!("Exp_{i}"), Operator::Exp, &[("input", input.as_str())], ("output", out.as_str()))
            }
            Step::ReduceSum {
                data,
                out,
                axis,
                keepdims,
            } => self.operator(
                format!("ReduceSum_{i}"),
                Operator::ReduceSum {
                    axes: vec![*axis as i64],
                    keepdims: *keepdims,
                },
                &[("data", data.as_str())],
                ("reduced", out.as_str()),
            ),
            Step::Assign { out, expr } => {
                let node = self.state.add_node(Node::Tasklet(Tasklet {
                    label: format!("assign_{i}"),
                    output: "__out".to_string(),
                    expr: expr.clone(),
                }));
                for data in expr.inputs() {
                    self.connect_in(&data, node, &data);
                }
                self.connect_out(node, "__out", out);
            }
            Step::Map {
                label,
                params,
                ranges,
                inputs,
                out,
                expr,
            } => {
                let node = self.state.add_node(Node::Map(MapNode {
                    label: label.clone(),
                    params: params.clone(),
                    ranges: ranges.clone(),
                    inputs: inputs
                        .iter()
                        .map(|(data, index)| MapAccess {
                            connector: data.clone(),
                            data: data.clone(),
                            index: index.clone(),
                        })
                        .collect(),
                    output: MapAccess {
                        connector: "__out".to_string(),
                        data: out.0.clone(),
                        index: out.1.clone(),
                    },
                    expr: expr.clone(),
                }));
                for (data, _) in inputs {
                    self.connect_in(data, node, data);
                }
                self.connect_out(node, "__out", &out.0);
            }
        }
    }
}
