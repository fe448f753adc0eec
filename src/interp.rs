//! Reference interpreter
//!
//! Evaluates a [`Graph`] on `f64` ndarrays, state by state, nodes in
//! topological order. Meant for checking backward units numerically; native
//! kernels have no reference semantics and are rejected.

use log::trace;
use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use petgraph::algo::toposort;
use rustc_hash::FxHashMap;

use crate::einsum::EinsumExpr;
use crate::error::{BackwardError, Result};
use crate::graph::{
    normalize_axis, Graph, MapNode, Memlet, NodeIndex, Node, Operator, OperatorNode, State,
    Subset, Tasklet, Wcr,
};

/// Array store plus the evaluator over it.
#[derive(Debug, Clone, Default)]
pub struct Interpreter {
    arrays: FxHashMap<String, ArrayD<f64>>,
}

fn err(msg: impl Into<String>) -> BackwardError {
    BackwardError::Interpret(msg.into())
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: &str, value: ArrayD<f64>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: ArrayD<f64>) {
        self.arrays.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.arrays.get(name)
    }

    pub fn into_arrays(self) -> FxHashMap<String, ArrayD<f64>> {
        self.arrays
    }

    /// Runs every state of `graph` in order.
    pub fn run(&mut self, graph: &Graph) -> Result<()> {
        for (_, state) in graph.states() {
            self.run_state(graph, state)?;
        }
        Ok(())
    }

    fn run_state(&mut self, graph: &Graph, state: &State) -> Result<()> {
        let order = toposort(state.graph(), None)
            .map_err(|cycle| err(format!("state '{}' has a cycle at {:?}", state.label, cycle.node_id())))?;
        for index in order {
            let node = state.node(index)?;
            let outputs = match node {
                Node::Access(_) => continue,
                Node::Operator(op) => self.operator(state, index, op)?,
                Node::Tasklet(tasklet) => self.tasklet(graph, state, index, tasklet)?,
                Node::Map(map) => self.map(graph, state, index, map)?,
                Node::Nested(unit) => {
                    let mut inner = Interpreter::new();
                    for (_, edge) in state.in_edges(index) {
                        let conn = edge.dst_conn.as_deref().ok_or_else(|| err("nested input without connector"))?;
                        inner.set(conn, self.read(&edge.memlet)?);
                    }
                    inner.run(&unit.graph)?;
                    inner.arrays
                }
                Node::Native(kernel) => {
                    return Err(err(format!("native kernel '{}' cannot be interpreted", kernel.label)))
                }
            };
            trace!("evaluated '{}'", node.label());
            for (_, edge) in state.out_edges(index) {
                let conn = edge.src_conn.as_deref().unwrap_or_default();
                let value = outputs
                    .get(conn)
                    .ok_or_else(|| err(format!("'{}' produced nothing on '{conn}'", node.label())))?;
                self.write(graph, &edge.memlet, value.clone())?;
            }
        }
        Ok(())
    }

    fn read(&self, memlet: &Memlet) -> Result<ArrayD<f64>> {
        let array = self
            .arrays
            .get(&memlet.data)
            .ok_or_else(|| err(format!("'{}' read before it was written", memlet.data)))?;
        match &memlet.subset {
            Subset::All => Ok(array.clone()),
            Subset::Index(index) => {
                let value = array
                    .get(index.as_slice())
                    .ok_or_else(|| err(format!("index {index:?} out of bounds for '{}'", memlet.data)))?;
                Ok(ArrayD::from_elem(IxDyn(&[1]), *value))
            }
        }
    }

    fn write(&mut self, graph: &Graph, memlet: &Memlet, value: ArrayD<f64>) -> Result<()> {
        let shape = graph.array(&memlet.data).map(|d| d.shape.clone()).ok();
        let target = self
            .arrays
            .entry(memlet.data.clone())
            .or_insert_with(|| ArrayD::zeros(IxDyn(shape.as_deref().unwrap_or(value.shape()))));
        match (&memlet.subset, memlet.wcr) {
            (Subset::All, wcr) => {
                if target.shape() != value.shape() {
                    return Err(err(format!(
                        "writing shape {:?} into '{}' of shape {:?}",
                        value.shape(),
                        memlet.data,
                        target.shape()
                    )));
                }
                match wcr {
                    Some(Wcr::Sum) => *target += &value,
                    None => *target = value,
                }
            }
            (Subset::Index(index), wcr) => {
                let v = value.iter().next().copied().unwrap_or_default();
                let slot = target
                    .get_mut(index.as_slice())
                    .ok_or_else(|| err(format!("index {index:?} out of bounds for '{}'", memlet.data)))?;
                match wcr {
                    Some(Wcr::Sum) => *slot += v,
                    None => *slot = v,
                }
            }
        }
        Ok(())
    }

    fn inputs(&self, state: &State, index: NodeIndex) -> Result<FxHashMap<String, ArrayD<f64>>> {
        let mut inputs = FxHashMap::default();
        for (_, edge) in state.in_edges(index) {
            if let Some(conn) = &edge.dst_conn {
                inputs.insert(conn.clone(), self.read(&edge.memlet)?);
            }
        }
        Ok(inputs)
    }

    fn out_shape(graph: &Graph, state: &State, index: NodeIndex, conn: &str) -> Result<Vec<usize>> {
        let data = state
            .out_array(index, conn)
            .ok_or_else(|| err(format!("connector '{conn}' is not written")))?;
        Ok(graph.array(data)?.shape.clone())
    }

    fn operator(
        &self,
        state: &State,
        index: NodeIndex,
        op: &OperatorNode,
    ) -> Result<FxHashMap<String, ArrayD<f64>>> {
        let mut inputs = self.inputs(state, index)?;
        let mut take = |conn: &str| {
            inputs
                .remove(conn)
                .ok_or_else(|| err(format!("'{}' is missing input '{conn}'", op.name)))
        };
        let (conn, value) = match &op.op {
            Operator::Einsum { equation } => {
                let expr = EinsumExpr::parse(equation)?;
                let operands = (0..expr.num_inputs())
                    .map(|i| take(&format!("Inputs__{i}")))
                    .collect::<Result<Vec<_>>>()?;
                ("Output", einsum(&expr, &operands)?)
            }
            Operator::Softmax { axis } => {
                let x = take("input")?;
                let axis = axis_of(*axis, x.ndim())?;
                ("output", softmax(&x, axis))
            }
            Operator::LogSoftmax { axis } => {
                let x = take("input")?;
                let axis = axis_of(*axis, x.ndim())?;
                ("output", softmax(&x, axis).mapv(f64::ln))
            }
            Operator::GlobalAveragePool => {
                let x = take("X")?;
                if x.ndim() != 4 {
                    return Err(err("GlobalAveragePool expects a rank-4 input"));
                }
                let hw = (x.shape()[2] * x.shape()[3]) as f64;
                let pooled = x.sum_axis(Axis(3)).sum_axis(Axis(2)) / hw;
                ("Y", pooled.insert_axis(Axis(2)).insert_axis(Axis(3)))
            }
            Operator::Mul => {
                let (a, b) = (take("A")?, take("B")?);
                ("C", &a * &b)
            }
            Operator::Sub => {
                let (a, b) = (take("A")?, take("B")?);
                ("C", &a - &b)
            }
            Operator::Exp => ("output", take("input")?.mapv(f64::exp)),
            Operator::ReduceSum { axes, keepdims } => {
                let mut data = take("data")?;
                let rank = data.ndim();
                let mut axes = axes
                    .iter()
                    .map(|&a| axis_of(a, rank))
                    .collect::<Result<Vec<_>>>()?;
                axes.sort_unstable();
                axes.dedup();
                for &axis in axes.iter().rev() {
                    data = data.sum_axis(Axis(axis));
                }
                if *keepdims {
                    for &axis in &axes {
                        data = data.insert_axis(Axis(axis));
                    }
                }
                ("reduced", data)
            }
            Operator::Conv(_) | Operator::BatchNormalization(_) => {
                return Err(err(format!("'{}' has no reference semantics", op.name)))
            }
        };
        Ok(FxHashMap::from_iter([(conn.to_string(), value)]))
    }

    fn tasklet(
        &self,
        graph: &Graph,
        state: &State,
        index: NodeIndex,
        tasklet: &Tasklet,
    ) -> Result<FxHashMap<String, ArrayD<f64>>> {
        let inputs = self.inputs(state, index)?;
        let shape = Self::out_shape(graph, state, index, &tasklet.output)?;
        let mut views = FxHashMap::default();
        for (conn, value) in &inputs {
            let view = value.broadcast(IxDyn(&shape)).ok_or_else(|| {
                err(format!(
                    "'{conn}' of shape {:?} does not broadcast to {shape:?} in '{}'",
                    value.shape(),
                    tasklet.label
                ))
            })?;
            views.insert(conn.as_str(), view);
        }
        let mut out: ArrayD<f64> = ArrayD::zeros(IxDyn(&shape));
        for (idx, slot) in out.indexed_iter_mut() {
            let lookup = |name: &str| views.get(name).and_then(|v| v.get(idx.slice()).copied());
            *slot = tasklet.expr.eval(&lookup)?;
        }
        Ok(FxHashMap::from_iter([(tasklet.output.clone(), out)]))
    }

    fn map(
        &self,
        graph: &Graph,
        state: &State,
        index: NodeIndex,
        map: &MapNode,
    ) -> Result<FxHashMap<String, ArrayD<f64>>> {
        let inputs = self.inputs(state, index)?;
        let shape = Self::out_shape(graph, state, index, &map.output.connector)?;
        let mut out: ArrayD<f64> = ArrayD::zeros(IxDyn(&shape));
        for point in ndarray::indices(IxDyn(&map.ranges)) {
            let params: FxHashMap<&str, usize> = map
                .params
                .iter()
                .map(String::as_str)
                .zip(point.slice().iter().copied())
                .collect();
            let lookup = |conn: &str| {
                let access = map.inputs.iter().find(|a| a.connector == conn)?;
                let array = inputs.get(conn)?;
                let at = resolve(&access.index, &params, array.ndim())?;
                array.get(at.as_slice()).copied()
            };
            let value = map.expr.eval(&lookup)?;
            let at = resolve(&map.output.index, &params, out.ndim())
                .ok_or_else(|| err(format!("bad output index in '{}'", map.label)))?;
            let slot = out
                .get_mut(at.as_slice())
                .ok_or_else(|| err(format!("'{}' writes out of bounds at {at:?}", map.label)))?;
            *slot = value;
        }
        Ok(FxHashMap::from_iter([(map.output.connector.clone(), out)]))
    }
}

fn axis_of(axis: i64, rank: usize) -> Result<usize> {
    normalize_axis(axis, rank).ok_or_else(|| err(format!("axis {axis} out of range for rank {rank}")))
}

/// Element index from parameter names. Missing trailing indices are 0.
fn resolve(index: &[String], params: &FxHashMap<&str, usize>, rank: usize) -> Option<Vec<usize>> {
    if index.len() > rank {
        return None;
    }
    let mut at = index
        .iter()
        .map(|p| params.get(p.as_str()).copied())
        .collect::<Option<Vec<_>>>()?;
    at.resize(rank, 0);
    Some(at)
}

fn softmax(x: &ArrayD<f64>, axis: usize) -> ArrayD<f64> {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

/// Dense contraction by enumerating every label assignment.
fn einsum(expr: &EinsumExpr, operands: &[ArrayD<f64>]) -> Result<ArrayD<f64>> {
    let mut sizes: Vec<(char, usize)> = Vec::new();
    for (term, operand) in expr.inputs.iter().zip(operands) {
        if term.len() != operand.ndim() {
            return Err(err(format!("operand of rank {} for term of length {}", operand.ndim(), term.len())));
        }
        for (&label, &size) in term.iter().zip(operand.shape()) {
            match sizes.iter().find(|(l, _)| *l == label) {
                Some(&(_, known)) if known != size => {
                    return Err(err(format!("label '{label}' has sizes {known} and {size}")))
                }
                Some(_) => {}
                None => sizes.push((label, size)),
            }
        }
    }
    let position = |label: char| sizes.iter().position(|(l, _)| *l == label);
    let positions = |term: &[char]| term.iter().map(|&l| position(l)).collect::<Option<Vec<_>>>();
    let out_pos = positions(&expr.output).ok_or_else(|| err(format!("unbound output label in '{expr}'")))?;
    let in_pos = expr
        .inputs
        .iter()
        .map(|t| positions(t))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| err(format!("unbound input label in '{expr}'")))?;

    let out_shape: Vec<usize> = out_pos.iter().map(|&p| sizes[p].1).collect();
    let mut out: ArrayD<f64> = ArrayD::zeros(IxDyn(&out_shape));
    let extents: Vec<usize> = sizes.iter().map(|(_, s)| *s).collect();
    for point in ndarray::indices(IxDyn(&extents)) {
        let point = point.slice();
        let mut product = 1.0;
        for (operand, pos) in operands.iter().zip(&in_pos) {
            let at: Vec<usize> = pos.iter().map(|&p| point[p]).collect();
            product *= operand[at.as_slice()];
        }
        let at: Vec<usize> = out_pos.iter().map(|&p| point[p]).collect();
        out[at.as_slice()] += product;
    }
    Ok(out)
}
