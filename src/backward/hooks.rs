use std::collections::BTreeSet;

use log::{debug, info};

use crate::error::Result;
use crate::graph::{fresh_name, Graph};

/// A deferred mutation of the forward graph.
pub type CompletionHook = Box<dyn FnOnce(&mut Graph) -> Result<()>>;

/// Queue of forward-graph mutations that must wait until every forward node
/// has been differentiated.
///
/// [`run`](CompletionHooks::run) consumes the queue, so each hook runs at
/// most once, in registration order.
#[derive(Default)]
pub struct CompletionHooks {
    hooks: Vec<(String, CompletionHook)>,
    reserved: BTreeSet<String>,
}

impl CompletionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, hook: CompletionHook) {
        let label = label.into();
        debug!("queued completion hook '{label}'");
        self.hooks.push((label, hook));
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.hooks.iter().map(|(label, _)| label.as_str())
    }

    /// Picks a name for an array a hook will add to `graph`.
    ///
    /// The name is fresh in `graph` and distinct from every name reserved
    /// earlier on this queue.
    pub fn reserve_name(&mut self, graph: &Graph, base: &str) -> String {
        let name = fresh_name(base, |n| graph.contains_array(n) || self.reserved.contains(n));
        self.reserved.insert(name.clone());
        name
    }

    /// Runs every hook against `graph`. Stops at the first failure.
    pub fn run(self, graph: &mut Graph) -> Result<usize> {
        let count = self.hooks.len();
        for (label, hook) in self.hooks {
            debug!("running completion hook '{label}'");
            hook(graph)?;
        }
        if count > 0 {
            info!("applied {count} completion hook(s) to '{}'", graph.name);
        }
        Ok(count)
    }
}

impl std::fmt::Debug for CompletionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHooks")
            .field("hooks", &self.labels().collect::<Vec<_>>())
            .field("reserved", &self.reserved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DType;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_hooks_run_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut hooks = CompletionHooks::new();
        for i in 0..3 {
            let order = order.clone();
            hooks.push(
                format!("hook{i}"),
                Box::new(move |g: &mut Graph| {
                    order.borrow_mut().push(i);
                    g.add_transient(&format!("t{i}"), vec![1], DType::F32)
                }),
            );
        }
        let mut g = Graph::new("g");
        assert_eq!(hooks.run(&mut g).unwrap(), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(g.contains_array("t2"));
    }

    #[test]
    fn test_failing_hook_stops_the_queue() {
        let mut hooks = CompletionHooks::new();
        hooks.push("dup", Box::new(|g: &mut Graph| g.add_transient("x", vec![1], DType::F32)));
        hooks.push("dup", Box::new(|g: &mut Graph| g.add_transient("x", vec![1], DType::F32)));
        hooks.push("after", Box::new(|g: &mut Graph| g.add_transient("y", vec![1], DType::F32)));
        let mut g = Graph::new("g");
        assert!(hooks.run(&mut g).is_err());
        assert!(!g.contains_array("y"));
    }

    #[test]
    fn test_reserve_name_is_unique_across_requests() {
        let mut g = Graph::new("g");
        g.add_transient("reserved_ptr", vec![1], DType::F32).unwrap();
        let mut hooks = CompletionHooks::new();
        assert_eq!(hooks.reserve_name(&g, "reserved_ptr"), "reserved_ptr_0");
        assert_eq!(hooks.reserve_name(&g, "reserved_ptr"), "reserved_ptr_1");
        assert_eq!(hooks.reserve_name(&g, "reserved_size"), "reserved_size");
    }
}
