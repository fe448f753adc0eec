//! Backward-graph synthesis
//!
//! For every differentiable forward operator a [`BackwardImplementation`]
//! builds a self-contained [`NestedUnit`](crate::graph::NestedUnit) that maps
//! the gradients of the operator's outputs to the gradients of its inputs.
//! Strategies are looked up in a [`Registry`] by operator kind and
//! [`Backend`], and the [`BackwardPass`] driver embeds the units it gets back
//! into one backward graph.

mod context;
mod hooks;
pub mod native;
mod pass;
pub mod program;
mod registry;
mod result;
pub mod strategies;

pub use context::BackwardContext;
pub use hooks::{CompletionHook, CompletionHooks};
pub use pass::{BackwardOutput, BackwardPass, EmbeddedUnit, GradientRequest};
pub use program::{BackwardProgram, Step};
pub use registry::{Backend, BackwardImplementation, Registry};
pub use result::{
    add_backward_desc, add_backward_desc_for_connector, import_forward_desc, BackwardResult,
};
