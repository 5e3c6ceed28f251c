//! Resolution Engine
//!
//! This module turns the graph into values. It defines what a producer is,
//! how asynchronous results come back, how callers ask for values and how
//! an evaluation pass walks the graph.
//!
//! # Concepts
//!
//! ## Producers
//!
//! Every slot is produced by a constant, a synchronous function of its
//! dependencies, or an asynchronous function returning a [`Deferred`].
//!
//! ## Requests
//!
//! [`Instance::get`] registers a request. Slots are pulled only when some
//! request (or an eager node) needs them, directly or transitively.
//!
//! ## Passes
//!
//! [`Instance::evaluate`] runs one pass: it recomputes every needed slot
//! that is unset or stale, in dependency order, then delivers callbacks.
//! Nothing is computed outside a pass, except that a deferred result is
//! stored the moment it completes.

mod deferred;
mod instance;
mod producer;
mod request;
mod resolver;

pub use deferred::{Completer, Deferred, Outcome};
pub use instance::{create_instance, Instance, InstanceBuilder, SlotInfo};
pub use producer::{AsyncFn, Names, Producer, ProducerSpec, SyncFn};
pub use request::{Callback, RequestId, Status};
pub use resolver::PassReport;
