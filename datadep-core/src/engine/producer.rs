//! Producer Declarations
//!
//! Every declaration form accepted by [`Instance::set`](crate::Instance::set)
//! collapses into one shape before it reaches the graph: a list of
//! dependency names plus a [`Producer`]. The producer is a tagged variant
//! chosen once at declaration time:
//!
//! - `Constant`: a plain value, assigned when the slot is first needed.
//! - `Sync`: a function of the dependency values returning the result.
//! - `Async`: a function of the dependency values returning a [`Deferred`]
//!   that completes later.
//!
//! Dependency values are passed positionally, in declared order.

use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;
use smallvec::SmallVec;

use super::deferred::Deferred;
use crate::error::ProducerError;

/// Synchronous producer function.
pub type SyncFn = Arc<dyn Fn(&[Value]) -> Result<Value, ProducerError> + Send + Sync>;

/// Asynchronous producer function.
pub type AsyncFn = Arc<dyn Fn(&[Value]) -> Result<Deferred, ProducerError> + Send + Sync>;

/// The computation behind a slot.
#[derive(Clone)]
pub enum Producer {
    /// A plain value.
    Constant(Value),

    /// Computes the value synchronously from the dependency values.
    Sync(SyncFn),

    /// Starts a computation that completes later.
    Async(AsyncFn),
}

impl Producer {
    /// Short name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Producer::Constant(_) => "constant",
            Producer::Sync(_) => "sync",
            Producer::Async(_) => "async",
        }
    }
}

impl Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Producer::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Producer::Sync(_) => f.write_str("Sync(..)"),
            Producer::Async(_) => f.write_str("Async(..)"),
        }
    }
}

/// One or more slot names.
///
/// Several names in a declaration mean the producer returns an array with
/// one element per name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Names(SmallVec<[String; 2]>);

impl Names {
    pub fn iter(&self) -> impl Iterator<Item = &String> + '_ {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub(crate) fn into_inner(self) -> SmallVec<[String; 2]> {
        self.0
    }
}

impl From<&str> for Names {
    fn from(name: &str) -> Self {
        Names(SmallVec::from_iter([name.to_string()]))
    }
}

impl From<String> for Names {
    fn from(name: String) -> Self {
        Names(SmallVec::from_iter([name]))
    }
}

impl From<&String> for Names {
    fn from(name: &String) -> Self {
        Names::from(name.as_str())
    }
}

impl<const N: usize> From<[&str; N]> for Names {
    fn from(names: [&str; N]) -> Self {
        names.into_iter().map(str::to_string).collect()
    }
}

impl From<&[&str]> for Names {
    fn from(names: &[&str]) -> Self {
        names.iter().map(|name| name.to_string()).collect()
    }
}

impl From<Vec<&str>> for Names {
    fn from(names: Vec<&str>) -> Self {
        names.into_iter().map(str::to_string).collect()
    }
}

impl From<Vec<String>> for Names {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().collect()
    }
}

impl From<&[String]> for Names {
    fn from(names: &[String]) -> Self {
        names.iter().cloned().collect()
    }
}

impl FromIterator<String> for Names {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Names(iter.into_iter().collect())
    }
}

/// A producer declaration: dependencies, producer and the eager flag.
///
/// # Example
///
/// ```rust
/// use datadep_core::{Instance, ProducerSpec};
/// use serde_json::{json, Value};
///
/// let data = Instance::new();
/// data.set("bar", json!("BAR")).unwrap();
/// data.set(
///     "foo",
///     ProducerSpec::compute(["bar"], |args| Ok(Value::String(format!("{}!", args[0])))),
/// )
/// .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ProducerSpec {
    dependencies: SmallVec<[String; 4]>,
    producer: Producer,
    eager: bool,
}

impl ProducerSpec {
    /// A constant value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            dependencies: SmallVec::new(),
            producer: Producer::Constant(value.into()),
            eager: false,
        }
    }

    /// An infallible function without dependencies.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::compute(std::iter::empty::<String>(), move |_| Ok(f()))
    }

    /// A synchronous function of the named dependencies.
    pub fn compute<D, F>(dependencies: D, f: F) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        F: Fn(&[Value]) -> Result<Value, ProducerError> + Send + Sync + 'static,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            producer: Producer::Sync(Arc::new(f)),
            eager: false,
        }
    }

    /// An asynchronous function of the named dependencies.
    ///
    /// The function returns a [`Deferred`]; the slot stays pending until the
    /// matching [`Completer`](crate::Completer) fires.
    pub fn compute_async<D, F>(dependencies: D, f: F) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        F: Fn(&[Value]) -> Result<Deferred, ProducerError> + Send + Sync + 'static,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            producer: Producer::Async(Arc::new(f)),
            eager: false,
        }
    }

    /// Assemble a declaration from already separated parts.
    pub fn from_parts<D>(dependencies: D, producer: Producer) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            producer,
            eager: false,
        }
    }

    /// Recompute whenever a dependency changes, even without a request.
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub(crate) fn into_parts(self) -> (SmallVec<[String; 4]>, Producer, bool) {
        (self.dependencies, self.producer, self.eager)
    }
}

impl From<Value> for ProducerSpec {
    fn from(value: Value) -> Self {
        ProducerSpec::value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_from_common_shapes() {
        assert_eq!(Names::from("a").as_slice(), ["a".to_string()]);
        assert_eq!(Names::from(["a", "b"]).len(), 2);
        assert_eq!(Names::from(vec!["a".to_string()]).len(), 1);
        assert!(Names::from(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn value_spec_has_no_dependencies() {
        let spec: ProducerSpec = json!("A").into();
        assert!(spec.dependencies().is_empty());
        assert!(!spec.is_eager());
        assert_eq!(spec.producer().kind(), "constant");
    }

    #[test]
    fn compute_spec_keeps_dependency_order() {
        let spec = ProducerSpec::compute(["b", "a:old"], |args| Ok(args[0].clone())).eager(true);
        assert_eq!(spec.dependencies(), ["b".to_string(), "a:old".to_string()]);
        assert!(spec.is_eager());

        let Producer::Sync(f) = spec.producer() else {
            panic!("expected a sync producer");
        };
        assert_eq!(f(&[json!(1), json!(2)]).unwrap(), json!(1));
    }

    #[test]
    fn from_fn_ignores_arguments() {
        let spec = ProducerSpec::from_fn(|| json!("FOO"));
        let Producer::Sync(f) = spec.producer() else {
            panic!("expected a sync producer");
        };
        assert_eq!(f(&[]).unwrap(), json!("FOO"));
    }
}
