//! Instances
//!
//! An [`Instance`] is one isolated graph: its own slot namespace, its own
//! outstanding requests and its own evaluation passes. Handles are cheap to
//! clone and share the same graph.
//!
//! # Thread Safety
//!
//! All engine state sits behind a single `parking_lot::Mutex`. The lock is
//! never held while user code runs: producers, deferred completions and
//! request callbacks are all invoked after it is released. `set` and
//! `changed` calls that arrive while a pass is running are queued and
//! applied when the pass ends.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::producer::{Names, ProducerSpec};
use super::request::{Callback, Request, Status};
use super::resolver::{run_pass, PassReport};
use crate::config::InstanceConfig;
use crate::error::EngineError;
use crate::graph::{split_binding, SlotGraph, SlotState};
use crate::scope::{declare_watched, ScopeSource, ScopeWatcher};

/// State shared by all handles of an instance.
pub(crate) struct Shared {
    pub(crate) state: Mutex<EngineState>,
    pub(crate) config: InstanceConfig,
    pub(crate) scope: Option<Arc<dyn ScopeSource>>,
}

pub(crate) struct EngineState {
    pub(crate) graph: SlotGraph,
    pub(crate) requests: Vec<Request>,
    pub(crate) watchers: Vec<ScopeWatcher>,

    /// A pass is running.
    pub(crate) evaluating: bool,

    /// Declarations and change marks received during a pass.
    pub(crate) queued: Vec<QueuedOp>,

    /// Failures of deferred results completed outside a pass.
    pub(crate) failures: Vec<EngineError>,
}

/// A mutation postponed until the running pass ends.
pub(crate) enum QueuedOp {
    Declare { names: Names, spec: ProducerSpec },
    Changed(String),
}

impl QueuedOp {
    pub(crate) fn apply(self, graph: &mut SlotGraph) {
        match self {
            QueuedOp::Declare { names, spec } => declare(graph, names, spec),
            QueuedOp::Changed(name) => {
                if let Err(error) = graph.mark_changed(&name) {
                    warn!(%error, "queued change dropped");
                }
            }
        }
    }
}

fn declare(graph: &mut SlotGraph, names: Names, spec: ProducerSpec) {
    let (dependencies, producer, eager) = spec.into_parts();
    debug!(
        slots = ?names.as_slice(),
        kind = producer.kind(),
        eager,
        "declare"
    );
    graph.declare(names.into_inner(), dependencies, producer, eager);
}

/// Reject empty, duplicated or suffixed output names.
fn validate(names: &Names, old_suffix: &str) -> Result<(), EngineError> {
    if names.is_empty() {
        return Err(EngineError::InvalidOperation(
            "a declaration needs at least one name".into(),
        ));
    }
    for (index, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(EngineError::InvalidOperation(
                "slot names must not be empty".into(),
            ));
        }
        if split_binding(name, old_suffix).1 {
            return Err(EngineError::InvalidOperation(format!(
                "`{}` names a previous value and cannot be declared",
                name
            )));
        }
        if names.as_slice()[..index].contains(name) {
            return Err(EngineError::InvalidOperation(format!(
                "`{}` is declared twice",
                name
            )));
        }
    }
    Ok(())
}

/// Serializable view of one slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotInfo {
    pub name: String,
    pub state: SlotState,
    pub version: u64,
    pub value: Option<Value>,
    pub dependencies: Vec<String>,
    pub eager: bool,
    /// Message of the last producer failure.
    pub failure: Option<String>,
}

/// Builder for [`Instance`].
#[derive(Default)]
pub struct InstanceBuilder {
    config: InstanceConfig,
    scope: Option<Arc<dyn ScopeSource>>,
}

impl InstanceBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: InstanceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn old_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.old_suffix = suffix.into();
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    /// External state read by [`Instance::watch_scope`].
    pub fn scope(mut self, scope: Arc<dyn ScopeSource>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn build(self) -> Instance {
        let graph = SlotGraph::new(self.config.old_suffix.clone());
        Instance {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState {
                    graph,
                    requests: Vec::new(),
                    watchers: Vec::new(),
                    evaluating: false,
                    queued: Vec::new(),
                    failures: Vec::new(),
                }),
                config: self.config,
                scope: self.scope,
            }),
        }
    }
}

/// Create an instance, optionally bound to an external scope.
pub fn create_instance(scope: Option<Arc<dyn ScopeSource>>) -> Instance {
    let builder = match scope {
        Some(scope) => Instance::builder().scope(scope),
        None => Instance::builder(),
    };
    builder.build()
}

/// A dependency graph of named slots.
///
/// # Example
///
/// ```rust
/// use datadep_core::{Instance, ProducerSpec};
/// use serde_json::json;
/// use std::sync::{Arc, Mutex};
///
/// let data = Instance::new();
/// data.set("foo", ProducerSpec::from_fn(|| json!("FOO"))).unwrap();
///
/// let seen = Arc::new(Mutex::new(None));
/// let seen_clone = seen.clone();
/// let status = data.get("foo", move |values| {
///     *seen_clone.lock().unwrap() = Some(values[0].clone());
/// });
/// assert!(!status.is_loaded());
///
/// data.evaluate();
/// assert!(status.is_loaded());
/// assert_eq!(*seen.lock().unwrap(), Some(json!("FOO")));
/// ```
#[derive(Clone)]
pub struct Instance {
    shared: Arc<Shared>,
}

impl Instance {
    /// Create an instance with the default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> InstanceBuilder {
        InstanceBuilder::default()
    }

    /// The configuration this instance was built with.
    pub fn config(&self) -> &InstanceConfig {
        &self.shared.config
    }

    /// Declare (or redeclare) the producer of one or more slots.
    ///
    /// Several names mean the producer returns an array with one element
    /// per name. Nothing is computed here; the next [`evaluate`] picks the
    /// change up.
    ///
    /// [`evaluate`]: Instance::evaluate
    pub fn set(
        &self,
        names: impl Into<Names>,
        spec: impl Into<ProducerSpec>,
    ) -> Result<(), EngineError> {
        let names = names.into();
        let spec = spec.into();
        let mut state = self.shared.state.lock();
        validate(&names, state.graph.old_suffix())?;

        if state.evaluating {
            debug!(slots = ?names.as_slice(), "declaration queued until the pass ends");
            state.queued.push(QueuedOp::Declare { names, spec });
        } else {
            declare(&mut state.graph, names, spec);
        }
        Ok(())
    }

    /// Ask for the values of one or more slots.
    ///
    /// The callback receives the values positionally once all of them are
    /// resolved, and again after every pass that recomputed one of them.
    /// Names may carry the previous-value suffix.
    pub fn get<F>(&self, names: impl Into<Names>, callback: F) -> Status
    where
        F: FnMut(&[Value]) + Send + 'static,
    {
        self.register(names.into(), Box::new(callback), false)
    }

    /// Like [`get`](Instance::get), but the request is dropped after its
    /// first delivery.
    pub(crate) fn request_once(&self, names: Names, callback: Callback) -> Status {
        self.register(names, callback, true)
    }

    fn register(&self, names: Names, callback: Callback, once: bool) -> Status {
        let (request, status) = Request::new(names, callback, once);
        self.shared.state.lock().requests.push(request);
        status
    }

    /// Mark a slot stale without redeclaring it.
    ///
    /// Used when a producer reads state the engine cannot observe.
    pub fn changed(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.shared.state.lock();
        if state.graph.slot(name).is_none() {
            return Err(EngineError::unknown(name));
        }

        if state.evaluating {
            state.queued.push(QueuedOp::Changed(name.to_string()));
            return Ok(());
        }
        state.graph.mark_changed(name)?;
        Ok(())
    }

    /// Mirror a location of the external scope into the slot `name`.
    ///
    /// `path` is a dotted path into the scope and defaults to `name`. The
    /// location is read again at the start of every pass.
    pub fn watch_scope(&self, name: &str, path: Option<&str>) -> Result<(), EngineError> {
        let Some(source) = &self.shared.scope else {
            return Err(EngineError::InvalidOperation(
                "instance has no scope to watch".into(),
            ));
        };
        let path = path.unwrap_or(name);
        let current = source.read(path);

        let mut state = self.shared.state.lock();
        validate(&Names::from(name), state.graph.old_suffix())?;
        state.watchers.retain(|watcher| watcher.name() != name);
        state
            .watchers
            .push(ScopeWatcher::new(name, path, current.clone()));

        if state.evaluating {
            state.queued.push(QueuedOp::Declare {
                names: Names::from(name),
                spec: ProducerSpec::value(current),
            });
        } else {
            declare_watched(&mut state.graph, name, current);
        }
        Ok(())
    }

    /// Run one evaluation pass.
    ///
    /// This is the entry point of the external trigger. Calling it from
    /// inside a running pass does nothing.
    pub fn evaluate(&self) -> PassReport {
        run_pass(&self.shared)
    }

    /// Declared dependencies of a slot.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<String>, EngineError> {
        let state = self.shared.state.lock();
        state.graph.dependencies_of(name).map(<[String]>::to_vec)
    }

    /// Cached value of a slot, if it ever had one.
    ///
    /// With the previous-value suffix this is the value held before the
    /// latest change.
    pub fn value(&self, name: &str) -> Option<Value> {
        let state = self.shared.state.lock();
        let (base, old) = split_binding(name, state.graph.old_suffix());
        let slot = state.graph.slot(base)?;
        if old {
            Some(slot.previous().clone())
        } else {
            slot.value().cloned()
        }
    }

    pub fn state_of(&self, name: &str) -> Option<SlotState> {
        self.shared.state.lock().graph.state_of(name)
    }

    pub fn version_of(&self, name: &str) -> Option<u64> {
        self.shared.state.lock().graph.slot(name).map(|slot| slot.version())
    }

    /// Describe every slot, in declaration order.
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let state = self.shared.state.lock();
        let graph = &state.graph;
        graph
            .slots()
            .filter_map(|slot| {
                let node = graph.node(slot.node())?;
                Some(SlotInfo {
                    name: slot.name().to_string(),
                    state: node.state(),
                    version: slot.version(),
                    value: slot.value().cloned(),
                    dependencies: node.dependencies().to_vec(),
                    eager: node.is_eager(),
                    failure: node.failure().map(str::to_string),
                })
            })
            .collect()
    }

    /// Number of outstanding requests.
    pub fn pending_requests(&self) -> usize {
        self.shared.state.lock().requests.len()
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Instance")
            .field("label", &self.shared.config.label)
            .field("graph", &state.graph)
            .field("requests", &state.requests.len())
            .field("evaluating", &state.evaluating)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_rejects_bad_names() {
        let data = Instance::new();
        assert!(matches!(
            data.set(Vec::<String>::new(), json!(1)),
            Err(EngineError::InvalidOperation(_))
        ));
        assert!(data.set(["a", "a"], json!([1, 1])).is_err());
        assert!(data.set("a:old", json!(1)).is_err());
        assert!(data.set("", json!(1)).is_err());
        assert!(data.set("a", json!(1)).is_ok());
    }

    #[test]
    fn custom_suffix_is_used() {
        let data = Instance::builder().old_suffix("@prev").label("t").build();
        assert_eq!(data.config().label.as_deref(), Some("t"));
        assert!(data.set("a:old", json!(1)).is_ok());
        assert!(data.set("a@prev", json!(1)).is_err());
    }

    #[test]
    fn changed_requires_known_slot() {
        let data = Instance::new();
        assert_eq!(data.changed("nope"), Err(EngineError::unknown("nope")));
    }

    #[test]
    fn watch_scope_needs_a_source() {
        let data = create_instance(None);
        assert!(matches!(
            data.watch_scope("foo", None),
            Err(EngineError::InvalidOperation(_))
        ));
    }

    #[test]
    fn snapshot_describes_slots() {
        let data = Instance::new();
        data.set("a", json!(1)).unwrap();
        data.set(
            "b",
            ProducerSpec::compute(["a"], |args| Ok(args[0].clone())).eager(true),
        )
        .unwrap();
        data.evaluate();

        let snapshot = data.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].name, "b");
        assert_eq!(snapshot[1].state, SlotState::Resolved);
        assert_eq!(snapshot[1].value, Some(json!(1)));
        assert_eq!(snapshot[1].dependencies, vec!["a".to_string()]);
        assert!(snapshot[1].eager);

        let json = serde_json::to_value(&snapshot[0]).unwrap();
        assert_eq!(json["state"], json!("resolved"));
    }
}
