use crate::backward::native::NodeUid;
use crate::backward::CompletionHooks;
use crate::config::BackwardConfig;
use crate::error::{BackwardError, Result};
use crate::graph::{DataDesc, Graph, NodeIndex, OperatorNode, State, StateId};

/// Everything a strategy may look at while differentiating one forward node.
///
/// The forward graph is only readable here; changes to it go through
/// [`CompletionHooks`], which run after every node has been differentiated.
pub struct BackwardContext<'a> {
    pub forward_graph: &'a Graph,
    pub forward_state: StateId,
    pub forward_node: NodeIndex,
    pub config: &'a BackwardConfig,
    pub hooks: &'a mut CompletionHooks,
}

impl<'a> BackwardContext<'a> {
    pub fn new(
        forward_graph: &'a Graph,
        forward_state: StateId,
        forward_node: NodeIndex,
        config: &'a BackwardConfig,
        hooks: &'a mut CompletionHooks,
    ) -> Self {
        Self {
            forward_graph,
            forward_state,
            forward_node,
            config,
            hooks,
        }
    }

    pub fn state(&self) -> Result<&'a State> {
        let graph: &'a Graph = self.forward_graph;
        graph.state(self.forward_state)
    }

    /// The forward node being differentiated.
    pub fn forward_op(&self) -> Result<&'a OperatorNode> {
        self.state()?.operator(self.forward_node)
    }

    /// Descriptor of the forward array on input connector `connector`.
    pub fn in_desc(&self, connector: &str) -> Result<&'a DataDesc> {
        let graph: &'a Graph = self.forward_graph;
        graph.in_desc_with_name(self.forward_state, self.forward_node, connector)
    }

    /// Descriptor of the forward array on output connector `connector`.
    pub fn out_desc(&self, connector: &str) -> Result<&'a DataDesc> {
        let graph: &'a Graph = self.forward_graph;
        graph.out_desc_with_name(self.forward_state, self.forward_node, connector)
    }

    /// Descriptor of the forward array on `connector`, input side first.
    pub fn desc(&self, connector: &str) -> Result<&'a DataDesc> {
        let op = self.forward_op()?;
        if op.has_in_connector(connector) {
            self.in_desc(connector)
        } else if op.has_out_connector(connector) {
            self.out_desc(connector)
        } else {
            Err(BackwardError::MissingConnector {
                node: op.name.clone(),
                connector: connector.to_string(),
            })
        }
    }

    /// Identifier of the forward node, unique across graphs, states and nodes.
    pub fn uid(&self) -> Result<NodeUid> {
        let op = self.forward_op()?;
        Ok(NodeUid::new(
            &op.name,
            self.forward_graph.id(),
            self.forward_state.0,
            self.state()?.node_id(self.forward_node),
        ))
    }
}
