//! Host dataflow graph
//!
//! A [`Graph`] owns named data descriptors and a list of [`State`]s. Each
//! state is a petgraph multigraph whose nodes are access nodes, operators,
//! tasklets, maps, native kernels and nested units, and whose edges carry a
//! [`Memlet`] describing the data that moves along them.
//!
//! Backward strategies read forward graphs through this API and build their
//! gradient subgraphs with it.

mod data;
#[allow(clippy::module_inception)]
mod graph;
mod memlet;
mod node;
mod op;
mod state;

pub use data::{Const, DType, DataDesc, DataKind, Storage};
pub use graph::{Graph, StateId};
pub(crate) use graph::fresh_name;
pub use memlet::{Memlet, Subset, Wcr};
pub use node::{
    AccessNode, ForwardLink, LinkSource, MapAccess, MapNode, NativeKernel, NestedUnit, Node,
    OperatorNode, ScalarExpr, Tasklet,
};
pub use op::{
    BatchNormAttrs, ConvAttrs, ConvBwdDataAlgo, ConvBwdFilterAlgo, Operator, normalize_axis,
    parse_variadic_param,
};
pub use petgraph::stable_graph::NodeIndex;
pub use state::{Edge, State};
