//! Slots: named, versioned value cells.

use serde_json::Value;

use super::node::NodeId;

/// A named value cell.
///
/// The slot survives redeclaration: replacing its producer only repoints
/// `node`, so the cached value, the one-step history and the version keep
/// growing monotonically.
#[derive(Debug, Clone)]
pub struct Slot {
    name: String,

    /// The node currently producing this slot.
    node: NodeId,

    /// Position in the node's result array for co-produced outputs.
    index: Option<usize>,

    /// Last computed value.
    value: Option<Value>,

    /// Value held before the most recent change.
    previous: Value,

    version: u64,
}

impl Slot {
    pub fn new(name: impl Into<String>, node: NodeId, index: Option<usize>) -> Self {
        Self {
            name: name.into(),
            node,
            index,
            value: None,
            previous: Value::Null,
            version: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Point the slot at a new producer node.
    pub fn rebind(&mut self, node: NodeId, index: Option<usize>) {
        self.node = node;
        self.index = index;
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn previous(&self) -> &Value {
        &self.previous
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Store a freshly computed value and bump the version.
    pub fn assign(&mut self, value: Value) {
        self.previous = self.value.replace(value).unwrap_or(Value::Null);
        self.version += 1;
    }

    /// The value bound for a dependency on this slot.
    ///
    /// `old` selects the previous value instead of the current one.
    pub fn bind(&self, old: bool) -> Value {
        if old {
            self.previous.clone()
        } else {
            self.value.clone().unwrap_or(Value::Null)
        }
    }
}

/// Split a binding name into the slot name and a "previous value" flag.
///
/// `split_binding("foo:old", ":old")` is `("foo", true)`.
pub fn split_binding<'a>(name: &'a str, old_suffix: &str) -> (&'a str, bool) {
    match name.strip_suffix(old_suffix) {
        Some(base) if !old_suffix.is_empty() && !base.is_empty() => (base, true),
        _ => (name, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assign_keeps_one_step_history() {
        let mut slot = Slot::new("foo", NodeId::new(), None);
        assert_eq!(slot.version(), 0);
        assert_eq!(slot.bind(true), Value::Null);

        slot.assign(json!("A"));
        assert_eq!(slot.version(), 1);
        assert_eq!(slot.bind(false), json!("A"));
        assert_eq!(slot.bind(true), Value::Null);

        slot.assign(json!("B"));
        slot.assign(json!("C"));
        assert_eq!(slot.version(), 3);
        assert_eq!(slot.bind(true), json!("B"));
    }

    #[test]
    fn rebind_preserves_value_and_version() {
        let mut slot = Slot::new("foo", NodeId::new(), None);
        slot.assign(json!(1));

        let other = NodeId::new();
        slot.rebind(other, Some(1));
        assert_eq!(slot.node(), other);
        assert_eq!(slot.index(), Some(1));
        assert_eq!(slot.value(), Some(&json!(1)));
        assert_eq!(slot.version(), 1);
    }

    #[test]
    fn split_binding_detects_suffix() {
        assert_eq!(split_binding("foo:old", ":old"), ("foo", true));
        assert_eq!(split_binding("foo", ":old"), ("foo", false));
        assert_eq!(split_binding(":old", ":old"), (":old", false));
    }
}
