//! Scope Watching
//!
//! An instance can mirror locations of an external, mutable state object
//! into slots. The engine never looks at that object directly: it only sees
//! a [`ScopeSource`] that reads a value by dotted path.
//!
//! Each watched location becomes a constant slot. At the start of every
//! evaluation pass the watchers read their location again; when the value
//! differs from the one last seen, the slot is redeclared with the new
//! value. Dependents then go stale the usual way, and the `:old` binding of
//! the slot yields the value it held before.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use smallvec::{smallvec, SmallVec};
use tracing::{trace, warn};

use crate::engine::Producer;
use crate::graph::SlotGraph;

/// Read access to an external state object.
///
/// Missing locations read as `Value::Null`.
pub trait ScopeSource: Send + Sync {
    fn read(&self, path: &str) -> Value;
}

impl<F> ScopeSource for F
where
    F: Fn(&str) -> Value + Send + Sync,
{
    fn read(&self, path: &str) -> Value {
        self(path)
    }
}

/// A shared JSON object usable as a scope.
///
/// Clones share the same object.
///
/// ```rust
/// use datadep_core::scope::{JsonScope, ScopeSource};
/// use serde_json::json;
///
/// let scope = JsonScope::default();
/// scope.set("foo.bar", json!("FOOBAR"));
/// assert_eq!(scope.read("foo"), json!({ "bar": "FOOBAR" }));
/// assert_eq!(scope.read("foo.baz"), json!(null));
/// ```
#[derive(Debug, Clone)]
pub struct JsonScope {
    root: Arc<RwLock<Value>>,
}

impl JsonScope {
    /// Wrap an existing value. Non-object roots are replaced by `{}`.
    pub fn new(root: Value) -> Self {
        let root = match root {
            Value::Object(_) => root,
            _ => Value::Object(Map::new()),
        };
        Self {
            root: Arc::new(RwLock::new(root)),
        }
    }

    /// Value at `path`, or null.
    pub fn get(&self, path: &str) -> Value {
        let root = self.root.read();
        let mut current = &*root;
        for segment in path.split('.') {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Value::Null,
            }
        }
        current.clone()
    }

    /// Store `value` at `path`, creating intermediate objects.
    pub fn set(&self, path: &str, value: Value) {
        let mut root = self.root.write();
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(last) = segments.pop() else {
            return;
        };

        let mut current = &mut *root;
        for segment in segments {
            let Some(map) = object_mut(current) else {
                return;
            };
            current = map
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if let Some(map) = object_mut(current) {
            map.insert(last.to_string(), value);
        }
    }

    /// Delete the value at `path`. Returns the removed value.
    pub fn remove(&self, path: &str) -> Option<Value> {
        let mut root = self.root.write();
        let (parent, key) = match path.rsplit_once('.') {
            Some((parent, key)) => (Some(parent), key),
            None => (None, path),
        };

        let mut current = &mut *root;
        if let Some(parent) = parent {
            for segment in parent.split('.') {
                current = current.as_object_mut()?.get_mut(segment)?;
            }
        }
        current.as_object_mut()?.remove(key)
    }
}

impl Default for JsonScope {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl ScopeSource for JsonScope {
    fn read(&self, path: &str) -> Value {
        self.get(path)
    }
}

/// Coerce `value` into an object, replacing scalars.
fn object_mut(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}

/// Mirrors one scope location into a slot.
#[derive(Debug, Clone)]
pub(crate) struct ScopeWatcher {
    name: String,
    path: String,
    last: Value,
}

impl ScopeWatcher {
    pub(crate) fn new(name: impl Into<String>, path: impl Into<String>, current: Value) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            last: current,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Read the location; returns the new value if it changed.
    pub(crate) fn poll(&mut self, source: &dyn ScopeSource) -> Option<Value> {
        let current = source.read(&self.path);
        if current == self.last {
            return None;
        }
        self.last = current.clone();
        Some(current)
    }
}

/// Declare the watched slot as a constant.
pub(crate) fn declare_watched(graph: &mut SlotGraph, name: &str, value: Value) {
    graph.declare(
        smallvec![name.to_string()],
        SmallVec::new(),
        Producer::Constant(value),
        false,
    );
}

/// Read every watched location. Returns the slots whose location changed,
/// with their new value. Runs without the engine lock; a panicking read
/// leaves its watcher as it was.
pub(crate) fn poll_watchers(
    source: &dyn ScopeSource,
    watchers: &mut [ScopeWatcher],
) -> Vec<(String, Value)> {
    let mut changed = Vec::new();
    for watcher in watchers.iter_mut() {
        match panic::catch_unwind(AssertUnwindSafe(|| watcher.poll(source))) {
            Ok(Some(value)) => {
                trace!(slot = watcher.name(), "scope value changed");
                changed.push((watcher.name().to_string(), value));
            }
            Ok(None) => {}
            Err(_) => warn!(
                slot = watcher.name(),
                path = %watcher.path,
                "scope read panicked; location skipped"
            ),
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_paths() {
        let scope = JsonScope::new(json!({ "foo": "FOO", "list": [1, 2] }));
        assert_eq!(scope.get("foo"), json!("FOO"));
        assert_eq!(scope.get("foo.bar"), Value::Null);
        assert_eq!(scope.get("list.1"), json!(2));

        scope.set("foo.bar", json!("FOOBAR"));
        assert_eq!(scope.get("foo"), json!({ "bar": "FOOBAR" }));

        assert_eq!(scope.remove("foo.bar"), Some(json!("FOOBAR")));
        assert_eq!(scope.remove("foo"), Some(json!({})));
        assert_eq!(scope.remove("foo"), None);
        assert_eq!(scope.get("foo"), Value::Null);
    }

    #[test]
    fn watcher_reports_changes_only() {
        let scope = JsonScope::new(json!({ "foo": "FOO" }));
        let mut watcher = ScopeWatcher::new("foo", "foo", scope.get("foo"));

        assert_eq!(watcher.poll(&scope), None);
        scope.set("foo", json!("BAR"));
        assert_eq!(watcher.poll(&scope), Some(json!("BAR")));
        assert_eq!(watcher.poll(&scope), None);
    }

    #[test]
    fn closures_are_sources() {
        let source = |path: &str| json!(path.len());
        let mut watcher = ScopeWatcher::new("n", "abc", Value::Null);
        assert_eq!(watcher.poll(&source), Some(json!(3)));
    }

    #[test]
    fn poll_reports_changed_locations() {
        let scope = JsonScope::default();
        let mut watchers = vec![ScopeWatcher::new("foo", "foo", Value::Null)];
        assert!(poll_watchers(&scope, &mut watchers).is_empty());

        scope.set("foo", json!(1));
        assert_eq!(
            poll_watchers(&scope, &mut watchers),
            vec![("foo".to_string(), json!(1))]
        );
        assert!(poll_watchers(&scope, &mut watchers).is_empty());
    }

    #[test]
    fn panicking_read_skips_the_location() {
        let source = |path: &str| -> Value {
            if path == "bad" {
                panic!("unreadable");
            }
            json!(path)
        };
        let mut watchers = vec![
            ScopeWatcher::new("a", "bad", Value::Null),
            ScopeWatcher::new("b", "good", Value::Null),
        ];
        assert_eq!(
            poll_watchers(&source, &mut watchers),
            vec![("b".to_string(), json!("good"))]
        );
    }

    #[test]
    fn declare_watched_replaces_the_producer() {
        let mut graph = SlotGraph::new(":old");
        declare_watched(&mut graph, "foo", Value::Null);
        let before = graph.slot("foo").unwrap().node();
        declare_watched(&mut graph, "foo", json!(1));
        assert_ne!(graph.slot("foo").unwrap().node(), before);
    }
}
