//! Dependency Graph
//!
//! This module holds the structural side of an instance: the named slots,
//! the producer nodes behind them and the dependency edges between them.
//!
//! # Overview
//!
//! - A [`Slot`] is a named, versioned value cell. It remembers the value it
//!   held before its latest change.
//! - A [`Node`] is one registered producer. It writes one slot, or several
//!   for co-produced outputs, and lists the names it reads.
//! - Edges are not stored separately. They are derived from the dependency
//!   names of each node, so a dependency may be declared after its dependent.
//!
//! # Design Decisions
//!
//! 1. Slots and nodes are kept apart. Redeclaring a slot creates a new node
//!    and repoints the slot, so the slot's history and version survive while
//!    completions of the old node can no longer land.
//!
//! 2. Both maps are insertion ordered (`IndexMap`), which makes evaluation
//!    order deterministic for nodes with no ordering constraint between them.
//!
//! 3. Cycles are never evaluated. The closure sort reports them instead.

mod node;
mod registry;
mod slot;

pub use node::{Node, NodeId, SlotState};
pub use registry::{Closure, SlotGraph};
pub use slot::{split_binding, Slot};
