//! Providers
//!
//! Providers are a thin, object-style layer over one shared [`Instance`].
//! Each provider declares the slots it produces when it is created and
//! registers itself under those names in a [`ProviderRegistry`], so other
//! parts of a program can look providers up by name.
//!
//! A provider producing several names is registered once per name as a
//! *filtered* provider that only exposes that one output.
//!
//! # Example
//!
//! ```rust
//! use datadep_core::provider::{create_provider, ProviderOptions, ProviderRegistry};
//! use serde_json::json;
//!
//! let registry = ProviderRegistry::new();
//! let foo = create_provider(ProviderOptions::new(&registry, "foo").value(json!("FOO"))).unwrap();
//! let bar = create_provider(
//!     ProviderOptions::new(&registry, "bar")
//!         .dependencies(["foo"])
//!         .factory(|args| Ok(json!(format!("{}!", args[0].as_str().unwrap_or_default())))),
//! )
//! .unwrap();
//!
//! let mut handle = bar.resolve();
//! registry.digest();
//! assert_eq!(handle.try_value(), Some(json!("FOO!")));
//!
//! foo.set(json!("BAR")).unwrap();
//! assert!(registry.provider("bar").is_some());
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::engine::{
    Deferred, Instance, Names, PassReport, Producer, ProducerSpec, Status,
};
use crate::error::{EngineError, ProducerError};

/// Named providers sharing one instance.
///
/// Clones share the same instance and the same name table.
#[derive(Clone)]
pub struct ProviderRegistry {
    instance: Instance,
    providers: Arc<Mutex<IndexMap<String, Provider>>>,
}

impl ProviderRegistry {
    /// A registry backed by a fresh instance.
    pub fn new() -> Self {
        Self::with_instance(Instance::new())
    }

    /// A registry declaring its providers into `instance`.
    pub fn with_instance(instance: Instance) -> Self {
        Self {
            instance,
            providers: Arc::new(Mutex::new(IndexMap::new())),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Look a provider up by produced name.
    pub fn provider(&self, name: &str) -> Option<Provider> {
        self.providers.lock().get(name).cloned()
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.providers.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.lock().is_empty()
    }

    /// Run one evaluation pass of the backing instance.
    pub fn digest(&self) -> PassReport {
        self.instance.evaluate()
    }

    fn register(&self, name: &str, provider: Provider) {
        self.providers.lock().insert(name.to_string(), provider);
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("names", &self.names())
            .finish()
    }
}

enum Source {
    Value(Value),
    Factory(Producer),
}

/// Options for [`create_provider`].
pub struct ProviderOptions {
    registry: ProviderRegistry,
    produces: Names,
    dependencies: Vec<String>,
    source: Option<Source>,
    conflicting: bool,
    eager: bool,
}

impl ProviderOptions {
    pub fn new(registry: &ProviderRegistry, produces: impl Into<Names>) -> Self {
        Self {
            registry: registry.clone(),
            produces: produces.into(),
            dependencies: Vec::new(),
            source: None,
            conflicting: false,
            eager: false,
        }
    }

    /// Names passed to the factory, in order.
    pub fn dependencies<D>(mut self, dependencies: D) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Compute the value synchronously.
    pub fn factory<F>(self, factory: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ProducerError> + Send + Sync + 'static,
    {
        self.source(Source::Factory(Producer::Sync(Arc::new(factory))))
    }

    /// Compute the value asynchronously.
    pub fn deferred_factory<F>(self, factory: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Deferred, ProducerError> + Send + Sync + 'static,
    {
        self.source(Source::Factory(Producer::Async(Arc::new(factory))))
    }

    /// Provide a constant. Only value providers accept [`Provider::set`].
    pub fn value(self, value: impl Into<Value>) -> Self {
        self.source(Source::Value(value.into()))
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    fn source(mut self, source: Source) -> Self {
        self.conflicting |= self.source.is_some();
        self.source = Some(source);
        self
    }
}

/// Create a provider, declare its slots and register it.
pub fn create_provider(options: ProviderOptions) -> Result<Provider, EngineError> {
    let ProviderOptions {
        registry,
        produces,
        dependencies,
        source,
        conflicting,
        eager,
    } = options;

    if conflicting {
        return Err(EngineError::InvalidOperation(
            "a provider takes either a factory or a value".into(),
        ));
    }
    let (kind, producer) = match source {
        Some(Source::Value(value)) if dependencies.is_empty() => {
            (ProviderKind::Value, Producer::Constant(value))
        }
        Some(Source::Value(_)) => {
            return Err(EngineError::InvalidOperation(
                "a value provider cannot have dependencies".into(),
            ))
        }
        Some(Source::Factory(producer)) => (ProviderKind::Factory, producer),
        None => {
            return Err(EngineError::InvalidOperation(
                "a provider needs a factory or a value".into(),
            ))
        }
    };

    let spec = ProducerSpec::from_parts(dependencies, producer).eager(eager);
    registry.instance.set(produces.clone(), spec)?;
    debug!(produces = ?produces.as_slice(), "provider created");

    let provider = Provider {
        instance: registry.instance.clone(),
        produces,
        kind,
    };
    match provider.produces.as_slice() {
        [name] => registry.register(name, provider.clone()),
        names => {
            for name in names {
                registry.register(name, provider.filtered(name)?);
            }
        }
    }
    Ok(provider)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Value,
    Factory,
    Filtered,
}

/// Handle to slots declared by [`create_provider`].
#[derive(Clone)]
pub struct Provider {
    instance: Instance,
    produces: Names,
    kind: ProviderKind,
}

impl Provider {
    pub fn produces(&self) -> &Names {
        &self.produces
    }

    /// Request the produced value.
    ///
    /// The handle is fulfilled by the first pass after which every produced
    /// slot is resolved. Several names yield an array.
    pub fn resolve(&self) -> ResolveHandle {
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        let single = self.produces.len() == 1;

        let status = self.instance.request_once(
            self.produces.clone(),
            Box::new(move |values: &[Value]| {
                let Some(sender) = sender.take() else {
                    return;
                };
                let value = if single {
                    values.first().cloned().unwrap_or(Value::Null)
                } else {
                    Value::Array(values.to_vec())
                };
                // The caller may have dropped the handle
                let _ = sender.send(value);
            }),
        );

        ResolveHandle { receiver, status }
    }

    /// Cached value, if every produced slot has one.
    pub fn get(&self) -> Option<Value> {
        match self.produces.as_slice() {
            [name] => self.instance.value(name),
            names => names
                .iter()
                .map(|name| self.instance.value(name))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Replace the value of a value provider.
    pub fn set(&self, value: impl Into<Value>) -> Result<(), EngineError> {
        if self.kind != ProviderKind::Value {
            return Err(EngineError::InvalidOperation(format!(
                "cannot set `{}`: provider is not defined by a value",
                self.produces.as_slice().join(",")
            )));
        }
        self.instance
            .set(self.produces.clone(), ProducerSpec::value(value))
    }

    /// A provider exposing only the output `name`.
    pub fn filtered(&self, name: &str) -> Result<Provider, EngineError> {
        if !self.produces.iter().any(|produced| produced == name) {
            return Err(EngineError::unknown(name));
        }
        Ok(Provider {
            instance: self.instance.clone(),
            produces: Names::from(name),
            kind: ProviderKind::Filtered,
        })
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("produces", &self.produces)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Pending result of [`Provider::resolve`].
///
/// Await it, or poll it with [`try_value`](ResolveHandle::try_value) after a
/// pass. Resolves to `None` if the instance is dropped first.
#[derive(Debug)]
pub struct ResolveHandle {
    receiver: oneshot::Receiver<Value>,
    status: Status,
}

impl ResolveHandle {
    /// The value, if a pass already delivered it.
    pub fn try_value(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }
}

impl Future for ResolveHandle {
    type Output = Option<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(Result::ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_need_exactly_one_source() {
        let registry = ProviderRegistry::new();
        assert!(create_provider(ProviderOptions::new(&registry, "a")).is_err());
        assert!(create_provider(
            ProviderOptions::new(&registry, "a")
                .value(json!(1))
                .factory(|_| Ok(json!(2)))
        )
        .is_err());
        assert!(create_provider(
            ProviderOptions::new(&registry, "a")
                .dependencies(["b"])
                .value(json!(1))
        )
        .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn multi_output_registers_filtered_providers() {
        let registry = ProviderRegistry::new();
        let root = create_provider(
            ProviderOptions::new(&registry, ["a", "b"]).factory(|_| Ok(json!(["A", "B"]))),
        )
        .unwrap();

        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        let a = registry.provider("a").unwrap();
        assert_eq!(a.produces().as_slice(), ["a".to_string()]);
        assert!(a.set(json!("X")).is_err());
        assert_eq!(root.filtered("c").unwrap_err(), EngineError::unknown("c"));

        root.resolve();
        registry.digest();
        assert_eq!(a.get(), Some(json!("A")));
        assert_eq!(root.get(), Some(json!(["A", "B"])));
    }

    #[test]
    fn resolve_handle_drops_request_after_delivery() {
        let registry = ProviderRegistry::new();
        let foo = create_provider(ProviderOptions::new(&registry, "foo").value(json!("FOO")))
            .unwrap();

        let mut handle = foo.resolve();
        assert_eq!(registry.instance().pending_requests(), 1);
        assert_eq!(handle.try_value(), None);

        registry.digest();
        assert!(handle.status().is_loaded());
        assert_eq!(handle.try_value(), Some(json!("FOO")));
        assert_eq!(registry.instance().pending_requests(), 0);
    }
}
