use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::{BackwardError, Result};
use crate::graph::{AccessNode, Memlet, NestedUnit, Node, OperatorNode, Wcr};

/// Dataflow edge between two nodes of a state.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub src_conn: Option<String>,
    pub dst_conn: Option<String>,
    pub memlet: Memlet,
}

/// One dataflow multigraph of access, compute and nested nodes.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub label: String,
    graph: StableDiGraph<Node, Edge>,
}

impl State {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            graph: StableDiGraph::new(),
        }
    }

    pub fn graph(&self) -> &StableDiGraph<Node, Edge> {
        &self.graph
    }

    pub fn add_node(&mut self, node: Node) -> NodeIndex {
        self.graph.add_node(node)
    }

    pub fn add_operator(&mut self, op: OperatorNode) -> NodeIndex {
        self.add_node(Node::Operator(op))
    }

    pub fn add_access(&mut self, data: &str) -> NodeIndex {
        self.add_node(Node::Access(AccessNode {
            data: data.to_string(),
        }))
    }

    /// Access node read from.
    pub fn add_read(&mut self, data: &str) -> NodeIndex {
        self.add_access(data)
    }

    /// Access node written to.
    pub fn add_write(&mut self, data: &str) -> NodeIndex {
        self.add_access(data)
    }

    pub fn add_nested(&mut self, unit: NestedUnit) -> NodeIndex {
        self.add_node(Node::Nested(unit))
    }

    pub fn add_edge(
        &mut self,
        src: NodeIndex,
        src_conn: Option<&str>,
        dst: NodeIndex,
        dst_conn: Option<&str>,
        memlet: Memlet,
    ) -> EdgeIndex {
        self.graph.add_edge(
            src,
            dst,
            Edge {
                src_conn: src_conn.map(str::to_string),
                dst_conn: dst_conn.map(str::to_string),
                memlet,
            },
        )
    }

    /// Makes every write into `index` accumulate with `wcr`.
    pub fn set_in_wcr(&mut self, index: NodeIndex, wcr: Wcr) {
        let edges: Vec<EdgeIndex> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for edge in edges {
            if let Some(weight) = self.graph.edge_weight_mut(edge) {
                weight.memlet.wcr = Some(wcr);
            }
        }
    }

    pub fn node(&self, index: NodeIndex) -> Result<&Node> {
        self.graph
            .node_weight(index)
            .ok_or_else(|| BackwardError::InvalidNode(format!("{index:?} in state '{}'", self.label)))
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Result<&mut Node> {
        let label = self.label.clone();
        self.graph
            .node_weight_mut(index)
            .ok_or_else(|| BackwardError::InvalidNode(format!("{index:?} in state '{label}'")))
    }

    pub fn operator(&self, index: NodeIndex) -> Result<&OperatorNode> {
        match self.node(index)? {
            Node::Operator(op) => Ok(op),
            other => Err(BackwardError::InvalidNode(format!(
                "'{}' is not an operator",
                other.label()
            ))),
        }
    }

    pub fn operator_mut(&mut self, index: NodeIndex) -> Result<&mut OperatorNode> {
        match self.node_mut(index)? {
            Node::Operator(op) => Ok(op),
            other => Err(BackwardError::InvalidNode(format!(
                "'{}' is not an operator",
                other.label()
            ))),
        }
    }

    /// Incoming edges as `(source, edge)` pairs.
    pub fn in_edges(&self, index: NodeIndex) -> impl Iterator<Item = (NodeIndex, &Edge)> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| (e.source(), e.weight()))
    }

    /// Outgoing edges as `(target, edge)` pairs.
    pub fn out_edges(&self, index: NodeIndex) -> impl Iterator<Item = (NodeIndex, &Edge)> {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|e| (e.target(), e.weight()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &Node)> {
        self.graph
            .node_indices()
            .filter_map(|i| self.graph.node_weight(i).map(|n| (i, n)))
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Position of `index` among the live nodes, stable for the life of the state.
    pub fn node_id(&self, index: NodeIndex) -> usize {
        index.index()
    }

    /// Name of the array attached to input connector `connector` of `node`.
    pub fn in_array(&self, node: NodeIndex, connector: &str) -> Option<&str> {
        self.in_edges(node)
            .find(|(_, e)| e.dst_conn.as_deref() == Some(connector))
            .map(|(_, e)| e.memlet.data.as_str())
    }

    /// Name of the array attached to output connector `connector` of `node`.
    pub fn out_array(&self, node: NodeIndex, connector: &str) -> Option<&str> {
        self.out_edges(node)
            .find(|(_, e)| e.src_conn.as_deref() == Some(connector))
            .map(|(_, e)| e.memlet.data.as_str())
    }
}
