//! Requests and status handles.
//!
//! A request is created by [`Instance::get`](crate::Instance::get). It keeps
//! the wanted names, the caller's callback and the [`Status`] shared with the
//! caller. At the end of every pass the resolver checks each request against
//! the graph; a request whose wanted slots are all resolved, and whose slot
//! versions moved since the last delivery, yields a [`Delivery`] that is
//! fired once the engine lock is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::warn;

use super::producer::Names;
use crate::graph::{split_binding, SlotGraph};

/// Callback receiving the wanted values positionally.
pub type Callback = Box<dyn FnMut(&[Value]) + Send>;

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The caller's view of a request.
///
/// `is_loaded` is updated at the end of every evaluation pass: it is true
/// while every wanted slot holds a current value.
#[derive(Debug, Clone)]
pub struct Status {
    id: RequestId,
    loaded: Arc<AtomicBool>,
}

impl Status {
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }
}

/// An outstanding request.
pub(crate) struct Request {
    id: RequestId,
    wanted: Names,
    callback: Arc<Mutex<Callback>>,
    loaded: Arc<AtomicBool>,

    /// Slot versions at the last delivery.
    delivered: Option<Vec<u64>>,

    /// Dropped from the instance after its first delivery.
    once: bool,
}

impl Request {
    pub(crate) fn new(wanted: Names, callback: Callback, once: bool) -> (Self, Status) {
        let id = RequestId::new();
        let loaded = Arc::new(AtomicBool::new(false));
        let status = Status {
            id,
            loaded: Arc::clone(&loaded),
        };
        let request = Self {
            id,
            wanted,
            callback: Arc::new(Mutex::new(callback)),
            loaded,
            delivered: None,
            once,
        };
        (request, status)
    }

    pub(crate) fn wanted(&self) -> &Names {
        &self.wanted
    }

    pub(crate) fn is_once(&self) -> bool {
        self.once
    }

    /// Refresh the loaded flag and decide whether the callback is due.
    pub(crate) fn check(&mut self, graph: &SlotGraph) -> Option<Delivery> {
        let suffix = graph.old_suffix();
        let ready = self
            .wanted
            .iter()
            .all(|name| graph.is_resolved(split_binding(name, suffix).0));
        self.loaded.store(ready, Ordering::Release);
        if !ready {
            return None;
        }

        let mut versions = Vec::with_capacity(self.wanted.len());
        let mut values = Vec::with_capacity(self.wanted.len());
        for name in self.wanted.iter() {
            let (base, old) = split_binding(name, suffix);
            let slot = graph.slot(base)?;
            versions.push(slot.version());
            values.push(slot.bind(old));
        }

        if self.delivered.as_ref() == Some(&versions) {
            return None;
        }
        self.delivered = Some(versions);

        Some(Delivery {
            request: self.id,
            callback: Arc::clone(&self.callback),
            values,
        })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("wanted", &self.wanted)
            .field("once", &self.once)
            .field("delivered", &self.delivered)
            .finish()
    }
}

/// A callback invocation waiting to run outside the engine lock.
pub(crate) struct Delivery {
    request: RequestId,
    callback: Arc<Mutex<Callback>>,
    values: Vec<Value>,
}

impl Delivery {
    pub(crate) fn request(&self) -> RequestId {
        self.request
    }

    pub(crate) fn fire(self) {
        match self.callback.try_lock() {
            Some(mut callback) => (*callback)(&self.values),
            // Only reachable when the callback itself drives a pass
            None => warn!(
                request = self.request.raw(),
                "callback is still running; delivery skipped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Producer;
    use serde_json::json;
    use smallvec::{smallvec, SmallVec};

    fn recorder() -> (Arc<Mutex<Vec<Vec<Value>>>>, Callback) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_clone = calls.clone();
        let callback: Callback = Box::new(move |values: &[Value]| {
            calls_clone.lock().push(values.to_vec());
        });
        (calls, callback)
    }

    fn resolved_graph() -> (SlotGraph, crate::graph::NodeId) {
        let mut graph = SlotGraph::new(":old");
        let id = graph.declare(
            smallvec!["foo".to_string()],
            SmallVec::new(),
            Producer::Constant(json!("FOO")),
            false,
        );
        graph.node_mut(id).unwrap().begin_invocation();
        graph.store(id, json!("FOO")).unwrap();
        (graph, id)
    }

    #[test]
    fn not_loaded_until_resolved() {
        let graph = SlotGraph::new(":old");
        let (calls, callback) = recorder();
        let (mut request, status) = Request::new("foo".into(), callback, false);

        assert!(request.check(&graph).is_none());
        assert!(!status.is_loaded());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn delivers_once_per_version() {
        let (mut graph, id) = resolved_graph();
        let (calls, callback) = recorder();
        let (mut request, status) = Request::new(["foo", "foo:old"].into(), callback, false);

        request.check(&graph).unwrap().fire();
        assert!(status.is_loaded());
        assert!(request.check(&graph).is_none());

        graph.node_mut(id).unwrap().mark_stale();
        assert!(request.check(&graph).is_none());
        assert!(!status.is_loaded());

        graph.node_mut(id).unwrap().begin_invocation();
        graph.store(id, json!("BAR")).unwrap();
        request.check(&graph).unwrap().fire();

        assert_eq!(
            *calls.lock(),
            vec![
                vec![json!("FOO"), Value::Null],
                vec![json!("BAR"), json!("FOO")],
            ]
        );
    }

    #[test]
    fn busy_callback_is_skipped() {
        let (graph, _) = resolved_graph();
        let (calls, callback) = recorder();
        let (mut request, _) = Request::new("foo".into(), callback, true);
        assert!(request.is_once());

        let delivery = request.check(&graph).unwrap();
        let guard = delivery.callback.lock();
        let second = Delivery {
            request: delivery.request,
            callback: Arc::clone(&delivery.callback),
            values: vec![],
        };
        second.fire();
        drop(guard);

        assert!(calls.lock().is_empty());
        delivery.fire();
        assert_eq!(calls.lock().len(), 1);
    }
}
