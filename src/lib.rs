//! gradweave: backward-graph synthesis for tensor operators
//!
//! Given a forward dataflow graph, gradweave builds, node by node, the
//! subgraphs that compute the gradients of each operator's inputs from the
//! gradients of its outputs.
//!
//! # Architecture
//!
//! - **graph**: host dataflow graph (arrays, states, nodes, memlets)
//! - **einsum**: contraction expressions and their reversal
//! - **backward**: strategy registry, backward strategies and the pass driver
//! - **interp**: ndarray reference interpreter used to check gradients
//! - **config**: backend preference and algorithm defaults
//!
//! Pure strategies lower to library operators, tasklets and maps. cuDNN
//! strategies emit native kernels whose per-node descriptors are created in
//! an init block and released in an exit block.

// ============================================================================
// Core Modules
// ============================================================================

pub mod backward;
pub mod config;
pub mod einsum;
pub mod error;
pub mod graph;
pub mod interp;

// ============================================================================
// Re-exports
// ============================================================================

pub use backward::{
    Backend, BackwardContext, BackwardImplementation, BackwardOutput, BackwardPass,
    BackwardResult, GradientRequest, Registry,
};
pub use config::BackwardConfig;
pub use error::{BackwardError, Result};
pub use graph::{Graph, NestedUnit};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits
pub mod prelude {
    pub use crate::backward::{
        Backend, BackwardContext, BackwardImplementation, BackwardPass, BackwardResult,
        CompletionHooks, GradientRequest, Registry,
    };
    pub use crate::config::BackwardConfig;
    pub use crate::einsum::EinsumExpr;
    pub use crate::error::{BackwardError, Result};
    pub use crate::graph::{
        DType, DataDesc, Graph, Memlet, NestedUnit, Node, NodeIndex, Operator, OperatorNode,
        StateId,
    };
    pub use crate::interp::Interpreter;
}
