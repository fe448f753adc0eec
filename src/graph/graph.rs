use std::collections::BTreeMap;

use petgraph::stable_graph::NodeIndex;

use crate::error::{BackwardError, Result};
use crate::graph::{DType, DataDesc, Memlet, State, Storage};

/// Index of a state within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub usize);

/// A dataflow program: named data descriptors plus a sequence of states.
///
/// `id` is the graph's position in its nesting tree: 0 for a top-level graph,
/// and the embedding order for nested units. Together with the state id and
/// node index it namespaces per-node native resources.
#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    id: usize,
    arrays: BTreeMap<String, DataDesc>,
    states: Vec<State>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: 0,
            arrays: BTreeMap::new(),
            states: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    // --- data descriptors ---

    pub fn add_datadesc(&mut self, name: &str, desc: DataDesc) -> Result<()> {
        if self.arrays.contains_key(name) {
            return Err(BackwardError::DuplicateArray(name.to_string()));
        }
        self.arrays.insert(name.to_string(), desc);
        Ok(())
    }

    pub fn add_array(&mut self, name: &str, shape: Vec<usize>, dtype: DType, transient: bool) -> Result<()> {
        self.add_datadesc(name, DataDesc::array(shape, dtype).with_transient(transient))
    }

    pub fn add_transient(&mut self, name: &str, shape: Vec<usize>, dtype: DType) -> Result<()> {
        self.add_array(name, shape, dtype, true)
    }

    /// Adds a scalar, renaming it first when `find_new_name` is set. Returns the
    /// name actually used.
    pub fn add_scalar(
        &mut self,
        name: &str,
        dtype: DType,
        storage: Storage,
        find_new_name: bool,
    ) -> Result<String> {
        let name = if find_new_name {
            self.find_new_name(name)
        } else {
            name.to_string()
        };
        self.add_datadesc(&name, DataDesc::scalar(dtype).with_storage(storage))?;
        Ok(name)
    }

    /// `base` if unused, otherwise `base_<n>` for the smallest free `n`.
    pub fn find_new_name(&self, base: &str) -> String {
        fresh_name(base, |n| self.arrays.contains_key(n))
    }

    pub fn contains_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    pub fn array(&self, name: &str) -> Result<&DataDesc> {
        self.arrays
            .get(name)
            .ok_or_else(|| BackwardError::UnknownArray(name.to_string()))
    }

    pub fn array_mut(&mut self, name: &str) -> Result<&mut DataDesc> {
        self.arrays
            .get_mut(name)
            .ok_or_else(|| BackwardError::UnknownArray(name.to_string()))
    }

    pub fn arrays(&self) -> impl Iterator<Item = (&String, &DataDesc)> {
        self.arrays.iter()
    }

    /// Memlet moving the whole of `name`.
    pub fn make_array_memlet(&self, name: &str) -> Result<Memlet> {
        self.array(name)?;
        Ok(Memlet::full(name))
    }

    // --- states ---

    pub fn add_state(&mut self, label: impl Into<String>) -> StateId {
        self.states.push(State::new(label));
        StateId(self.states.len() - 1)
    }

    pub fn state(&self, id: StateId) -> Result<&State> {
        self.states.get(id.0).ok_or(BackwardError::InvalidState(id.0))
    }

    pub fn state_mut(&mut self, id: StateId) -> Result<&mut State> {
        self.states.get_mut(id.0).ok_or(BackwardError::InvalidState(id.0))
    }

    pub fn states(&self) -> impl Iterator<Item = (StateId, &State)> {
        self.states.iter().enumerate().map(|(i, s)| (StateId(i), s))
    }

    // --- forward graph queries ---

    /// Descriptor of the array feeding input connector `connector` of `node`.
    pub fn in_desc_with_name(&self, state: StateId, node: NodeIndex, connector: &str) -> Result<&DataDesc> {
        let state = self.state(state)?;
        let name = state
            .in_array(node, connector)
            .ok_or_else(|| missing_connector(state, node, connector))?;
        self.array(name)
    }

    /// Descriptor of the array written by output connector `connector` of `node`.
    pub fn out_desc_with_name(&self, state: StateId, node: NodeIndex, connector: &str) -> Result<&DataDesc> {
        let state = self.state(state)?;
        let name = state
            .out_array(node, connector)
            .ok_or_else(|| missing_connector(state, node, connector))?;
        self.array(name)
    }
}

fn missing_connector(state: &State, node: NodeIndex, connector: &str) -> BackwardError {
    let node = state
        .node(node)
        .map(|n| n.label().to_string())
        .unwrap_or_else(|_| format!("{node:?}"));
    BackwardError::MissingConnector {
        node,
        connector: connector.to_string(),
    }
}

/// `base` if `taken(base)` is false, otherwise the first free `base_<n>`.
pub(crate) fn fresh_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (0..)
        .map(|i| format!("{base}_{i}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
