use serde::{Deserialize, Serialize};
use statehub_types::ComponentId;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Reads the other component's state.
    #[default]
    Data,
    /// Reacts to the other component's events.
    Event,
    /// Must mount after the other component.
    Lifecycle,
}

/// `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: ComponentId,
    pub to: ComponentId,
    pub kind: DependencyKind,
    pub required: bool,
}

/// Directed acyclic dependency graph.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    outgoing: HashMap<ComponentId, BTreeMap<ComponentId, DependencyEdge>>,
}

impl DependencyGraph {
    /// True if adding `from -> to` closes a cycle, i.e. `from` is reachable
    /// from `to` (or they are the same node).
    pub fn would_create_cycle(&self, from: &ComponentId, to: &ComponentId) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![to];
        while let Some(node) = stack.pop() {
            if node == from {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(edges) = self.outgoing.get(node) {
                stack.extend(edges.keys());
            }
        }
        false
    }

    /// Inserts or replaces the edge. Callers check for cycles first.
    pub fn insert(&mut self, edge: DependencyEdge) {
        self.outgoing
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.to.clone(), edge);
    }

    pub fn remove(&mut self, from: &ComponentId, to: &ComponentId) -> bool {
        let Some(edges) = self.outgoing.get_mut(from) else {
            return false;
        };
        let removed = edges.remove(to).is_some();
        if edges.is_empty() {
            self.outgoing.remove(from);
        }
        removed
    }

    /// Drops every edge touching `node`. Returns the number removed.
    pub fn remove_node(&mut self, node: &ComponentId) -> usize {
        let mut removed = self.outgoing.remove(node).map_or(0, |e| e.len());
        for edges in self.outgoing.values_mut() {
            if edges.remove(node).is_some() {
                removed += 1;
            }
        }
        self.outgoing.retain(|_, edges| !edges.is_empty());
        removed
    }

    pub fn edges_from(&self, node: &ComponentId) -> Vec<DependencyEdge> {
        self.outgoing
            .get(node)
            .map(|edges| edges.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, node: &ComponentId) -> Vec<ComponentId> {
        let mut dependents: Vec<ComponentId> = self
            .outgoing
            .iter()
            .filter(|(_, edges)| edges.contains_key(node))
            .map(|(from, _)| from.clone())
            .collect();
        dependents.sort();
        dependents
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.values().map(BTreeMap::len).sum()
    }

    /// Checks acyclicity from scratch. Used by tests and debug assertions.
    pub fn is_acyclic(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a ComponentId,
            marks: &mut HashMap<&'a ComponentId, Mark>,
        ) -> bool {
            match marks.get(node) {
                Some(Mark::Visiting) => return false,
                Some(Mark::Done) => return true,
                None => {}
            }
            marks.insert(node, Mark::Visiting);
            if let Some(edges) = graph.outgoing.get(node) {
                for next in edges.keys() {
                    if !visit(graph, next, marks) {
                        return false;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            true
        }

        let mut marks = HashMap::new();
        self.outgoing.keys().all(|node| visit(self, node, &mut marks))
    }
}
