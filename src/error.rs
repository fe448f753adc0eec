//! Error types for backward-graph synthesis

use thiserror::Error;

/// Errors raised while selecting or running a backward strategy.
#[derive(Debug, Error)]
pub enum BackwardError {
    /// No registered strategy exists (or none is applicable) for an operator.
    #[error("no backward implementation for operator '{op}' on backend(s) {backend}")]
    NoMatchingImplementation { op: String, backend: String },

    /// A strategy is already registered for this (operator, backend) pair.
    #[error("backward implementation for operator '{op}' on backend '{backend}' already registered")]
    DuplicateImplementation { op: String, backend: String },

    /// The contraction expression could not be parsed or is not a valid forward expression.
    #[error("invalid contraction expression: {0}")]
    InvalidExpression(String),

    /// Reversing the contraction would repeat a label on the output side.
    #[error("unsupported contraction expression: {0}")]
    UnsupportedExpressionShape(String),

    /// A tensor has a rank the strategy cannot handle.
    #[error("connector '{connector}' has rank {actual}, expected {expected}")]
    UnsupportedRank {
        connector: String,
        expected: usize,
        actual: usize,
    },

    /// Layout, padding or element type the strategy cannot handle.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// A connector was expected on a node but is missing or unconnected.
    #[error("node '{node}' has no connected connector '{connector}'")]
    MissingConnector { node: String, connector: String },

    /// An array name is not declared in the graph.
    #[error("unknown array: {0}")]
    UnknownArray(String),

    /// An array name is already declared in the graph.
    #[error("array already exists: {0}")]
    DuplicateArray(String),

    /// A node index does not exist or does not hold the expected kind of node.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// A state id does not exist in the graph.
    #[error("invalid state id {0}")]
    InvalidState(usize),

    /// A backward program refers to a parameter the forward node does not have.
    #[error("invalid backward program: {0}")]
    InvalidProgram(String),

    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// The reference interpreter cannot evaluate a graph.
    #[error("interpreter error: {0}")]
    Interpret(String),
}

pub type Result<T> = std::result::Result<T, BackwardError>;
