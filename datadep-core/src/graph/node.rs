//! Graph Nodes
//!
//! A node is one registered producer. It owns the dependency list, the
//! evaluation state and the invocation token of a computation. The slots it
//! writes to (one, or several for co-produced outputs) live next to it in the
//! registry and point back at the node by [`NodeId`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use smallvec::SmallVec;

use crate::engine::Producer;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluation state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Declared but never computed.
    Unset,

    /// A dependency changed or the slot was explicitly marked changed.
    /// The cached value (if any) is out of date.
    Stale,

    /// An asynchronous producer is in flight.
    Pending,

    /// The cached value is current.
    Resolved,

    /// The producer failed. Not retried until the slot is set or changed.
    Error,
}

impl SlotState {
    /// Whether the resolver should invoke the producer when it is needed.
    pub fn needs_compute(&self) -> bool {
        matches!(self, SlotState::Unset | SlotState::Stale)
    }
}

/// A producer registered in the graph.
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// Slot names written by this node, in result order.
    outputs: SmallVec<[String; 2]>,

    /// Names read by the producer, in argument order. May carry the
    /// "previous value" suffix.
    dependencies: SmallVec<[String; 4]>,

    /// The computation itself.
    producer: Producer,

    /// Recompute on change without an outstanding request.
    eager: bool,

    state: SlotState,

    /// Invocation generation. Bumped whenever an invocation starts or an
    /// in-flight invocation is superseded.
    token: u64,

    /// Message of the last failure, cleared on the next invocation.
    failure: Option<String>,
}

impl Node {
    /// Create a new, never computed node.
    pub fn new(
        outputs: SmallVec<[String; 2]>,
        dependencies: SmallVec<[String; 4]>,
        producer: Producer,
        eager: bool,
    ) -> Self {
        Self {
            id: NodeId::new(),
            outputs,
            dependencies,
            producer,
            eager,
            state: SlotState::Unset,
            token: 0,
            failure: None,
        }
    }

    /// Start out stale instead of unset, for a producer replacing one whose
    /// slots already hold values.
    pub fn replacing(mut self) -> Self {
        self.state = SlotState::Stale;
        self
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Slot names written by this node.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Declared dependency names.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    /// Get the current state.
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Mark the node stale.
    ///
    /// A pending invocation is superseded: its token no longer matches, so
    /// its completion will be discarded. Returns false if the node was
    /// already waiting for (re)computation.
    pub fn mark_stale(&mut self) -> bool {
        match self.state {
            SlotState::Unset | SlotState::Stale => false,
            SlotState::Pending => {
                self.token += 1;
                self.state = SlotState::Stale;
                true
            }
            SlotState::Resolved | SlotState::Error => {
                self.state = SlotState::Stale;
                true
            }
        }
    }

    /// Start an invocation and return its token.
    pub fn begin_invocation(&mut self) -> u64 {
        self.token += 1;
        self.state = SlotState::Pending;
        self.failure = None;
        self.token
    }

    /// Whether a completion carrying `token` may still be applied.
    pub fn accepts(&self, token: u64) -> bool {
        self.state == SlotState::Pending && self.token == token
    }

    pub fn mark_resolved(&mut self) {
        self.state = SlotState::Resolved;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.state = SlotState::Error;
        self.failure = Some(message.into());
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("outputs", &self.outputs)
            .field("dependencies", &self.dependencies)
            .field("producer", &self.producer)
            .field("eager", &self.eager)
            .field("state", &self.state)
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smallvec::smallvec;

    fn constant() -> Node {
        Node::new(
            smallvec!["a".to_string()],
            SmallVec::new(),
            Producer::Constant(json!(1)),
            false,
        )
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn node_starts_unset() {
        let node = constant();
        assert_eq!(node.state(), SlotState::Unset);
        assert!(node.state().needs_compute());
        assert_eq!(node.outputs(), ["a".to_string()]);

        let replacement = constant().replacing();
        assert_eq!(replacement.state(), SlotState::Stale);
        assert!(replacement.state().needs_compute());
    }

    #[test]
    fn state_transitions() {
        let mut node = constant();

        // Unset stays unset when marked stale
        assert!(!node.mark_stale());
        assert_eq!(node.state(), SlotState::Unset);

        let token = node.begin_invocation();
        assert_eq!(node.state(), SlotState::Pending);
        assert!(node.accepts(token));

        node.mark_resolved();
        assert_eq!(node.state(), SlotState::Resolved);
        assert!(!node.accepts(token));

        assert!(node.mark_stale());
        assert_eq!(node.state(), SlotState::Stale);

        node.begin_invocation();
        node.mark_failed("boom");
        assert_eq!(node.state(), SlotState::Error);
        assert_eq!(node.failure(), Some("boom"));
    }

    #[test]
    fn stale_mark_supersedes_pending_invocation() {
        let mut node = constant();
        let token = node.begin_invocation();

        assert!(node.mark_stale());
        assert!(!node.accepts(token));

        let next = node.begin_invocation();
        assert!(next > token);
        assert!(node.accepts(next));
    }
}
