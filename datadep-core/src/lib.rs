//! Datadep Core
//!
//! This crate provides a dependency-driven value resolution engine. Named
//! values ("slots") are produced by constants or by functions of other
//! slots; the engine computes requested slots in dependency order, caches
//! the results and recomputes only what a change invalidates.
//!
//! It implements:
//!
//! - Slots with cached, versioned values and a one-step history
//! - Synchronous and asynchronous producers, including co-produced outputs
//! - Lazy pull through requests and eager push for flagged producers
//! - Mirroring of external state through scope watchers
//! - Named providers on top of a shared instance
//!
//! # Architecture
//!
//! - `graph`: slots, producer nodes, closure ordering and invalidation
//! - `engine`: producers, deferred results, requests and evaluation passes
//! - `scope`: external state sources and watchers
//! - `provider`: the provider layer and its registry
//!
//! The engine never schedules itself. Whoever owns an [`Instance`] calls
//! [`Instance::evaluate`] when it wants pending work to happen.
//!
//! # Example
//!
//! ```rust
//! use datadep_core::{Instance, ProducerSpec};
//! use serde_json::{json, Value};
//! use std::sync::{Arc, Mutex};
//!
//! let data = Instance::new();
//! data.set("bar", json!("BAR")).unwrap();
//! data.set(
//!     "foo",
//!     ProducerSpec::compute(["bar", "bar:old"], |args| Ok(json!([args[0], args[1]]))),
//! )
//! .unwrap();
//!
//! let seen = Arc::new(Mutex::new(Value::Null));
//! let seen_clone = seen.clone();
//! data.get("foo", move |values| *seen_clone.lock().unwrap() = values[0].clone());
//!
//! data.evaluate();
//! assert_eq!(*seen.lock().unwrap(), json!(["BAR", null]));
//!
//! data.set("bar", json!("FOOBAR")).unwrap();
//! data.evaluate();
//! assert_eq!(*seen.lock().unwrap(), json!(["FOOBAR", "BAR"]));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod provider;
pub mod scope;

pub use config::InstanceConfig;
pub use engine::{
    create_instance, Completer, Deferred, Instance, InstanceBuilder, Names, PassReport,
    ProducerSpec, SlotInfo, Status,
};
pub use error::{EngineError, ProducerError};
pub use graph::SlotState;
pub use provider::{create_provider, Provider, ProviderOptions, ProviderRegistry, ResolveHandle};
pub use scope::{JsonScope, ScopeSource};
