use std::fmt;

use log::{debug, trace};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::backward::strategies::{
    CudnnBatchNormBackward, CudnnConvBackward, EinsumBackward, GlobalAveragePoolBackward,
    LogSoftmaxBackward, SoftmaxBackward,
};
use crate::backward::{BackwardContext, BackwardResult};
use crate::error::{BackwardError, Result};
use crate::graph::{Graph, NestedUnit, NodeIndex, StateId};

/// Execution backend a strategy targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Portable dataflow built from library operators and tasklets.
    Pure,
    /// Native calls into cuDNN.
    Cudnn,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Pure => write!(f, "pure"),
            Backend::Cudnn => write!(f, "cuDNN"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = BackwardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pure" | "default" => Ok(Backend::Pure),
            "cudnn" => Ok(Backend::Cudnn),
            other => Err(BackwardError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// A way of building the backward subgraph of one operator kind.
pub trait BackwardImplementation {
    /// Whether this strategy can differentiate `node`.
    ///
    /// Must not mutate anything and must not fail; any unexpected structure
    /// answers `false`.
    fn applicable(&self, _node: NodeIndex, _state: StateId, _graph: &Graph) -> bool {
        true
    }

    /// Builds the gradient subgraph of `ctx.forward_node`.
    ///
    /// `given` names the forward output connectors whose gradients are
    /// supplied, `required` the forward input connectors whose gradients must
    /// be produced.
    fn backward(
        &self,
        ctx: &mut BackwardContext<'_>,
        given: &[String],
        required: &[String],
    ) -> Result<(NestedUnit, BackwardResult)>;
}

/// Maps `(operator kind, backend)` to a backward strategy.
pub struct Registry {
    implementations: FxHashMap<(String, Backend), Box<dyn BackwardImplementation>>,
}

impl Default for Registry {
    /// A registry holding every built-in strategy.
    fn default() -> Self {
        let mut registry = Self::empty();
        let builtins: [(&str, Backend, Box<dyn BackwardImplementation>); 6] = [
            ("Einsum", Backend::Pure, Box::new(EinsumBackward)),
            ("Softmax", Backend::Pure, Box::new(SoftmaxBackward)),
            ("LogSoftmax", Backend::Pure, Box::new(LogSoftmaxBackward)),
            ("GlobalAveragePool", Backend::Pure, Box::new(GlobalAveragePoolBackward)),
            ("Conv", Backend::Cudnn, Box::new(CudnnConvBackward)),
            ("BatchNormalization", Backend::Cudnn, Box::new(CudnnBatchNormBackward)),
        ];
        for (op, backend, implementation) in builtins {
            let registered = registry.register(op, backend, implementation);
            debug_assert!(registered.is_ok(), "duplicate built-in {op}/{backend}");
        }
        registry
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            implementations: FxHashMap::default(),
        }
    }

    pub fn register(
        &mut self,
        op: &str,
        backend: Backend,
        implementation: Box<dyn BackwardImplementation>,
    ) -> Result<()> {
        let key = (op.to_string(), backend);
        if self.implementations.contains_key(&key) {
            return Err(BackwardError::DuplicateImplementation {
                op: op.to_string(),
                backend: backend.to_string(),
            });
        }
        debug!("registered backward implementation {op}/{backend}");
        self.implementations.insert(key, implementation);
        Ok(())
    }

    pub fn contains(&self, op: &str, backend: Backend) -> bool {
        self.implementations.contains_key(&(op.to_string(), backend))
    }

    pub fn len(&self) -> usize {
        self.implementations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.implementations.is_empty()
    }

    /// Backends with a strategy registered for `op`.
    pub fn backends_for(&self, op: &str) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self
            .implementations
            .keys()
            .filter(|(kind, _)| kind == op)
            .map(|(_, backend)| *backend)
            .collect();
        backends.sort_by_key(|b| b.to_string());
        backends
    }

    /// The strategy registered for exactly `(op, backend)`.
    pub fn lookup(&self, op: &str, backend: Backend) -> Result<&dyn BackwardImplementation> {
        self.implementations
            .get(&(op.to_string(), backend))
            .map(|b| b.as_ref())
            .ok_or_else(|| BackwardError::NoMatchingImplementation {
                op: op.to_string(),
                backend: backend.to_string(),
            })
    }

    /// Picks the first applicable strategy for `node`, trying `preference` in order.
    pub fn select(
        &self,
        node: NodeIndex,
        state: StateId,
        graph: &Graph,
        preference: &[Backend],
    ) -> Result<(Backend, &dyn BackwardImplementation)> {
        let op = graph.state(state)?.operator(node)?;
        let kind = op.op.kind();
        for &backend in preference {
            let Ok(implementation) = self.lookup(kind, backend) else {
                continue;
            };
            if implementation.applicable(node, state, graph) {
                debug!("selected {kind}/{backend} for '{}'", op.name);
                return Ok((backend, implementation));
            }
            trace!("{kind}/{backend} is not applicable to '{}'", op.name);
        }
        let tried: Vec<String> = preference.iter().map(|b| b.to_string()).collect();
        Err(BackwardError::NoMatchingImplementation {
            op: kind.to_string(),
            backend: tried.join(", "),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DType, Memlet, Operator, OperatorNode};

    struct Never;

    impl BackwardImplementation for Never {
        fn applicable(&self, _: NodeIndex, _: StateId, _: &Graph) -> bool {
            false
        }

        fn backward(
            &self,
            _: &mut BackwardContext<'_>,
            _: &[String],
            _: &[String],
        ) -> Result<(NestedUnit, BackwardResult)> {
            unreachable!("never applicable")
        }
    }

    fn softmax_graph() -> (Graph, StateId, NodeIndex) {
        let mut g = Graph::new("fwd");
        g.add_array("x", vec![2, 3], DType::F32, false).unwrap();
        g.add_array("y", vec![2, 3], DType::F32, false).unwrap();
        let s = g.add_state("s");
        let state = g.state_mut(s).unwrap();
        let node = state.add_operator(
            OperatorNode::new("sm", Operator::Softmax { axis: 1 })
                .with_inputs(&["input"])
                .with_outputs(&["output"]),
        );
        let x = state.add_read("x");
        let y = state.add_write("y");
        state.add_edge(x, None, node, Some("input"), Memlet::full("x"));
        state.add_edge(node, Some("output"), y, None, Memlet::full("y"));
        (g, s, node)
    }

    #[test]
    fn test_default_registry() {
        let registry = Registry::default();
        assert_eq!(registry.len(), 6);
        assert!(registry.contains("Einsum", Backend::Pure));
        assert!(registry.contains("Conv", Backend::Cudnn));
        assert!(!registry.contains("Conv", Backend::Pure));
        assert_eq!(registry.backends_for("BatchNormalization"), vec![Backend::Cudnn]);
    }

    #[test]
    fn test_lookup_missing() {
        let registry = Registry::default();
        let err = registry.lookup("Gemm", Backend::Pure).err().unwrap();
        assert!(matches!(err, BackwardError::NoMatchingImplementation { .. }));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = Registry::default();
        let err = registry.register("Softmax", Backend::Pure, Box::new(Never)).unwrap_err();
        assert!(matches!(err, BackwardError::DuplicateImplementation { .. }));
    }

    #[test]
    fn test_select_falls_back_when_not_applicable() {
        let mut registry = Registry::default();
        registry.register("Softmax", Backend::Cudnn, Box::new(Never)).unwrap();
        let (g, s, node) = softmax_graph();
        let (backend, _) = registry
            .select(node, s, &g, &[Backend::Cudnn, Backend::Pure])
            .unwrap();
        assert_eq!(backend, Backend::Pure);

        let err = registry.select(node, s, &g, &[Backend::Cudnn]).err().unwrap();
        assert!(matches!(err, BackwardError::NoMatchingImplementation { .. }));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!("cuDNN".parse::<Backend>().unwrap(), Backend::Cudnn);
        assert_eq!("default".parse::<Backend>().unwrap(), Backend::Pure);
        assert_eq!(Backend::Cudnn.to_string(), "cuDNN");
    }
}
