//! Slot Registry
//!
//! The registry owns every slot and producer node of an instance and
//! answers the structural questions the resolver asks:
//!
//! - which nodes a set of requested names needs (the dependency closure),
//! - in which order they must run (dependencies before dependents),
//! - which part of the closure is broken (unknown names, cycles),
//! - which nodes become stale when a slot changes.
//!
//! # Algorithm
//!
//! Staleness propagation is a breadth-first walk from the changed slots
//! through every node that names them as a dependency, guarded by a visited
//! set so cycles terminate. The closure is collected the same way in the
//! other direction, then sorted with Kahn's algorithm. Nodes that Kahn's
//! algorithm cannot place sit on (or behind) a cycle; they are left out of
//! the order and reported.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::trace;

use super::node::{Node, NodeId, SlotState};
use super::slot::{split_binding, Slot};
use crate::engine::Producer;
use crate::error::EngineError;

/// Nodes needed by a set of requested names.
#[derive(Debug, Default)]
pub struct Closure {
    /// Evaluable nodes, dependencies before dependents.
    pub order: Vec<NodeId>,
    /// Configuration errors found while collecting the closure.
    pub errors: Vec<EngineError>,
}

/// All slots and producer nodes of one instance.
pub struct SlotGraph {
    nodes: IndexMap<NodeId, Node>,
    slots: IndexMap<String, Slot>,

    /// Reverse edges: slot name to the nodes reading it.
    dependents: HashMap<String, IndexSet<NodeId>>,

    old_suffix: String,
}

impl SlotGraph {
    /// Create an empty graph using `old_suffix` for previous-value bindings.
    pub fn new(old_suffix: impl Into<String>) -> Self {
        Self {
            nodes: IndexMap::new(),
            slots: IndexMap::new(),
            dependents: HashMap::new(),
            old_suffix: old_suffix.into(),
        }
    }

    pub fn old_suffix(&self) -> &str {
        &self.old_suffix
    }

    /// Register (or replace) the producer of one or more slots.
    ///
    /// Existing slots keep their value, history and version; they are only
    /// repointed at the new node. Every transitive dependent is marked stale.
    pub fn declare(
        &mut self,
        outputs: SmallVec<[String; 2]>,
        dependencies: SmallVec<[String; 4]>,
        producer: Producer,
        eager: bool,
    ) -> NodeId {
        let co_produced = outputs.len() > 1;
        let cached = outputs.iter().any(|name| {
            self.slots
                .get(name)
                .is_some_and(|slot| slot.value().is_some())
        });
        let mut node = Node::new(outputs.clone(), dependencies, producer, eager);
        if cached {
            node = node.replacing();
        }
        let id = node.id();

        for (index, name) in outputs.iter().enumerate() {
            let index = co_produced.then_some(index);
            match self.slots.get_mut(name) {
                Some(slot) => slot.rebind(id, index),
                None => {
                    self.slots
                        .insert(name.clone(), Slot::new(name.clone(), id, index));
                }
            }
        }
        for dependency in node.dependencies() {
            let (base, _) = split_binding(dependency, &self.old_suffix);
            self.dependents.entry(base.to_string()).or_default().insert(id);
        }
        self.nodes.insert(id, node);
        self.prune();

        self.invalidate_dependents(outputs.into_vec());
        id
    }

    /// Drop nodes no slot points at anymore.
    fn prune(&mut self) {
        let live: HashSet<NodeId> = self.slots.values().map(Slot::node).collect();
        let dead: Vec<NodeId> = self
            .nodes
            .keys()
            .filter(|id| !live.contains(*id))
            .copied()
            .collect();

        for id in dead {
            let Some(node) = self.nodes.shift_remove(&id) else {
                continue;
            };
            for dependency in node.dependencies() {
                let (base, _) = split_binding(dependency, &self.old_suffix);
                if let Some(readers) = self.dependents.get_mut(base) {
                    readers.shift_remove(&id);
                }
            }
        }
    }

    /// Mark a slot's producer stale and cascade to its dependents.
    pub fn mark_changed(&mut self, name: &str) -> Result<Vec<NodeId>, EngineError> {
        let id = self
            .slots
            .get(name)
            .map(Slot::node)
            .ok_or_else(|| EngineError::unknown(name))?;

        if let Some(node) = self.nodes.get_mut(&id) {
            node.mark_stale();
        }
        let outputs = self.owned_outputs(id);
        let mut marked = vec![id];
        marked.extend(self.invalidate_dependents(outputs));
        Ok(marked)
    }

    /// Mark every transitive dependent of the given slots stale.
    ///
    /// The walk stops at nodes that were already unset or stale: their own
    /// dependents cannot hold a value computed after them. Returns the IDs
    /// of the nodes newly marked.
    pub fn invalidate_dependents(&mut self, changed: Vec<String>) -> Vec<NodeId> {
        let mut marked = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<String> = changed.into();

        // BFS over dependents
        while let Some(name) = queue.pop_front() {
            for dependent in self.dependents_of(&name) {
                if !visited.insert(dependent) {
                    continue;
                }
                let newly_stale = self
                    .nodes
                    .get_mut(&dependent)
                    .is_some_and(Node::mark_stale);
                if !newly_stale {
                    continue;
                }

                let outputs = self.owned_outputs(dependent);
                trace!(slot = %name, dependent = ?outputs, "marked stale");
                marked.push(dependent);
                queue.extend(outputs);
            }
        }

        marked
    }

    /// Nodes that list `name` (or its previous value) as a dependency.
    fn dependents_of(&self, name: &str) -> Vec<NodeId> {
        self.dependents
            .get(name)
            .map(|readers| readers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Output names of a node whose slots still point at it.
    pub fn owned_outputs(&self, id: NodeId) -> Vec<String> {
        self.nodes
            .get(&id)
            .map(|node| {
                node.outputs()
                    .iter()
                    .filter(|name| self.slots.get(*name).is_some_and(|slot| slot.node() == id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A readable name for a node, for errors and logs.
    pub fn label(&self, id: NodeId) -> String {
        let owned = self.owned_outputs(id);
        match owned.as_slice() {
            [] => format!("#{}", id.raw()),
            [single] => single.clone(),
            many => many.join(","),
        }
    }

    /// Get a slot by name.
    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> + '_ {
        self.slots.values()
    }

    /// Get a reference to a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Get a mutable reference to a node.
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// The node currently producing `name`.
    pub fn node_of(&self, name: &str) -> Option<&Node> {
        self.slots
            .get(name)
            .and_then(|slot| self.nodes.get(&slot.node()))
    }

    /// Declared dependency names of a slot.
    pub fn dependencies_of(&self, name: &str) -> Result<&[String], EngineError> {
        self.node_of(name)
            .map(Node::dependencies)
            .ok_or_else(|| EngineError::unknown(name))
    }

    /// Current state of a slot.
    pub fn state_of(&self, name: &str) -> Option<SlotState> {
        self.node_of(name).map(Node::state)
    }

    /// Whether `name` holds a current value.
    pub fn is_resolved(&self, name: &str) -> bool {
        match (self.slots.get(name), self.node_of(name)) {
            (Some(slot), Some(node)) => {
                node.state() == SlotState::Resolved && slot.value().is_some()
            }
            _ => false,
        }
    }

    /// One output name per eager node.
    pub fn eager_roots(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.is_eager())
            .filter_map(|node| self.owned_outputs(node.id()).into_iter().next())
            .collect()
    }

    /// Argument values for a node, or `None` while a dependency is not
    /// resolved (or not declared).
    pub fn arguments(&self, id: NodeId) -> Option<Vec<Value>> {
        let node = self.nodes.get(&id)?;
        node.dependencies()
            .iter()
            .map(|dependency| {
                let (base, old) = split_binding(dependency, &self.old_suffix);
                self.is_resolved(base)
                    .then(|| self.slots.get(base).map(|slot| slot.bind(old)))
                    .flatten()
            })
            .collect()
    }

    /// Store the result of a node into its slots and invalidate dependents.
    ///
    /// Co-produced nodes expect an array with one element per output.
    /// Returns the names of the updated slots.
    pub fn store(&mut self, id: NodeId, value: Value) -> Result<Vec<String>, String> {
        let width = self
            .nodes
            .get(&id)
            .map(|node| node.outputs().len())
            .ok_or_else(|| "producer was removed".to_string())?;

        let mut values = if width > 1 {
            match value {
                Value::Array(items) if items.len() == width => items,
                other => {
                    return Err(format!(
                        "expected an array of {} values, got {}",
                        width, other
                    ))
                }
            }
        } else {
            vec![value]
        };

        let owned = self.owned_outputs(id);
        for name in &owned {
            let Some(slot) = self.slots.get_mut(name) else {
                continue;
            };
            if let Some(next) = values.get_mut(slot.index().unwrap_or(0)) {
                slot.assign(std::mem::take(next));
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.mark_resolved();
        }

        self.invalidate_dependents(owned.clone());
        Ok(owned)
    }

    /// Collect the nodes needed by `roots` and sort them.
    pub fn closure<'a, I>(&self, roots: I) -> Closure
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut closure = Closure::default();
        let mut members: IndexSet<NodeId> = IndexSet::new();
        let mut edges: HashMap<NodeId, IndexSet<NodeId>> = HashMap::new();
        let mut queue = VecDeque::new();

        for root in roots {
            let (base, _) = split_binding(root, &self.old_suffix);
            match self.slots.get(base) {
                Some(slot) => queue.push_back(slot.node()),
                None => push_unique(&mut closure.errors, EngineError::unknown(base)),
            }
        }

        while let Some(id) = queue.pop_front() {
            if !members.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };

            let mut dependencies = IndexSet::new();
            for dependency in node.dependencies() {
                let (base, _) = split_binding(dependency, &self.old_suffix);
                match self.slots.get(base) {
                    Some(slot) => {
                        dependencies.insert(slot.node());
                        queue.push_back(slot.node());
                    }
                    None => push_unique(
                        &mut closure.errors,
                        EngineError::UnknownSlot {
                            slot: base.to_string(),
                            needed_by: Some(self.label(id)),
                        },
                    ),
                }
            }
            edges.insert(id, dependencies);
        }

        let (order, leftover) = topological_sort(&members, &edges);
        for error in self.cycles(&leftover, &edges) {
            push_unique(&mut closure.errors, error);
        }
        closure.order = order;
        closure
    }

    /// Describe the cycles behind the nodes Kahn's algorithm left over.
    fn cycles(
        &self,
        leftover: &[NodeId],
        edges: &HashMap<NodeId, IndexSet<NodeId>>,
    ) -> Vec<EngineError> {
        let remaining: HashSet<NodeId> = leftover.iter().copied().collect();
        let mut seen: Vec<Vec<NodeId>> = Vec::new();
        let mut errors = Vec::new();

        for &start in leftover {
            let mut path: Vec<NodeId> = Vec::new();
            let mut current = start;
            loop {
                if let Some(position) = path.iter().position(|id| *id == current) {
                    let cycle = path[position..].to_vec();
                    let mut key = cycle.clone();
                    key.sort();
                    if !seen.contains(&key) {
                        seen.push(key);
                        let mut names: Vec<String> =
                            cycle.iter().map(|id| self.label(*id)).collect();
                        names.push(self.label(cycle[0]));
                        errors.push(EngineError::CyclicDependency { path: names });
                    }
                    break;
                }
                path.push(current);

                // Every leftover node has at least one leftover dependency
                match edges
                    .get(&current)
                    .and_then(|deps| deps.iter().find(|dep| remaining.contains(dep)))
                {
                    Some(next) => current = *next,
                    None => break,
                }
            }
        }

        errors
    }

    /// Get the total number of slots in the graph.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn push_unique(errors: &mut Vec<EngineError>, error: EngineError) {
    if !errors.contains(&error) {
        errors.push(error);
    }
}

/// Kahn's algorithm over the closure.
///
/// Returns the sorted nodes and the nodes that could not be placed.
fn topological_sort(
    members: &IndexSet<NodeId>,
    edges: &HashMap<NodeId, IndexSet<NodeId>>,
) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut in_degree: IndexMap<NodeId, usize> = IndexMap::new();
    let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut result = Vec::with_capacity(members.len());
    let mut queue = VecDeque::new();

    // Calculate in-degrees (edges point from dependency to dependent)
    for &id in members {
        let degree = match edges.get(&id) {
            Some(dependencies) => {
                for dependency in dependencies {
                    dependents.entry(*dependency).or_default().push(id);
                }
                dependencies.len()
            }
            None => 0,
        };
        in_degree.insert(id, degree);
        if degree == 0 {
            queue.push_back(id);
        }
    }

    while let Some(id) = queue.pop_front() {
        result.push(id);

        if let Some(list) = dependents.get(&id) {
            for dependent in list {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }
    }

    let leftover = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id)
        .collect();
    (result, leftover)
}

impl std::fmt::Debug for SlotGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGraph")
            .field("slots", &self.slots.len())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
