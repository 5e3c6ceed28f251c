//! Evaluation Passes
//!
//! # How a Pass Works
//!
//! A pass first reads watched scope locations again, then runs a sequence
//! of rounds. Each round:
//!
//! 1. Collects the roots: every name wanted by an outstanding request plus
//!    one output of every eager node.
//! 2. Computes the dependency closure of the roots and sorts it, reporting
//!    unknown names and cycles.
//! 3. Walks the sorted closure and invokes every node that is unset or stale
//!    and whose dependencies all hold current values.
//!
//! Synchronous results are stored immediately, so dependents later in the
//! same round already see them. Storing a value marks the dependents stale,
//! which is what makes eager nodes downstream of a change recompute. Rounds
//! repeat until one of them invokes nothing.
//!
//! Producers run without the engine lock held. Every invocation carries the
//! node's token; a result is only stored while the node still accepts that
//! token, so completions of superseded invocations are dropped.
//!
//! When the rounds settle, requests are checked, queued `set`/`changed`
//! calls are applied and due callbacks fire, again outside the lock. A
//! panicking callback is logged and does not keep the others from firing.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, debug_span, trace, warn};

use super::deferred::{Deferred, Outcome};
use super::instance::{EngineState, Shared};
use super::producer::Producer;
use crate::error::{EngineError, ProducerError};
use crate::graph::NodeId;
use crate::scope::{declare_watched, poll_watchers, ScopeSource};

/// Summary of one evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Number of producers invoked.
    pub invoked: usize,
    /// Errors encountered, without duplicates.
    pub errors: Vec<EngineError>,
}

impl PassReport {
    /// Returns true if the pass ran into no error.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record an error. Returns false if it was already recorded.
    pub(crate) fn push_error(&mut self, error: EngineError) -> bool {
        if self.errors.contains(&error) {
            return false;
        }
        self.errors.push(error);
        true
    }
}

/// A node ready to run, detached from the engine lock.
struct Prepared {
    token: u64,
    producer: Producer,
    arguments: Vec<Value>,
    label: String,
}

enum Invocation {
    Ready(Outcome),
    Deferred(Deferred),
}

/// Run one evaluation pass over the instance.
pub(crate) fn run_pass(shared: &Arc<Shared>) -> PassReport {
    let span = debug_span!(
        "evaluate",
        instance = shared.config.label.as_deref().unwrap_or("-")
    );
    let _guard = span.enter();

    let mut report = PassReport::default();
    {
        let mut state = shared.state.lock();
        if state.evaluating {
            warn!("evaluate called while a pass is running; ignored");
            return report;
        }
        state.evaluating = true;
    }
    let _running = Running(shared);

    if let Some(source) = &shared.scope {
        poll_scope(shared, source.as_ref());
    }

    loop {
        let plan = plan(shared, &mut report);
        let mut progressed = false;

        for id in plan {
            let Some(prepared) = prepare(shared, id) else {
                continue;
            };
            progressed = true;
            report.invoked += 1;
            debug!(
                slot = %prepared.label,
                kind = prepared.producer.kind(),
                "invoking producer"
            );

            match invoke(&prepared.producer, &prepared.arguments) {
                Invocation::Ready(outcome) => {
                    if let Some(error) = complete(shared, id, prepared.token, outcome) {
                        report.push_error(error);
                    }
                }
                Invocation::Deferred(deferred) => {
                    attach(shared, id, prepared.token, deferred, &mut report)
                }
            }
        }

        if !progressed {
            break;
        }
    }

    finish(shared, report)
}

/// Clears the `evaluating` flag when a pass unwinds.
struct Running<'a>(&'a Shared);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.0.state.lock();
            state.evaluating = false;
            warn!("pass aborted by a panic");
        }
    }
}

/// Re-read watched scope locations and redeclare the changed slots.
///
/// The source is read without the engine lock, so it may call back into
/// the instance.
fn poll_scope(shared: &Shared, source: &dyn ScopeSource) {
    let mut watchers = std::mem::take(&mut shared.state.lock().watchers);
    let changed = poll_watchers(source, &mut watchers);

    let mut state = shared.state.lock();
    let EngineState {
        graph,
        watchers: current,
        ..
    } = &mut *state;

    // Watchers registered while reading replace the polled ones
    let replaced = |name: &str| current.iter().any(|watcher| watcher.name() == name);
    for (name, value) in changed {
        if !replaced(&name) {
            declare_watched(graph, &name, value);
        }
    }
    watchers.retain(|watcher| !replaced(watcher.name()));
    watchers.append(current);
    *current = watchers;
}

/// Sorted closure of the current roots, filtered to nodes needing work.
fn plan(shared: &Shared, report: &mut PassReport) -> Vec<NodeId> {
    let state = shared.state.lock();
    let graph = &state.graph;

    let eager = graph.eager_roots();
    let roots = state
        .requests
        .iter()
        .flat_map(|request| request.wanted().iter().map(String::as_str))
        .chain(eager.iter().map(String::as_str));
    let closure = graph.closure(roots);

    for error in closure.errors {
        let message = error.to_string();
        if report.push_error(error) {
            warn!(%message, "configuration error");
        }
    }

    closure
        .order
        .into_iter()
        .filter(|id| {
            graph
                .node(*id)
                .is_some_and(|node| node.state().needs_compute())
        })
        .collect()
}

/// Start an invocation if the node still needs one and its arguments are
/// available.
fn prepare(shared: &Shared, id: NodeId) -> Option<Prepared> {
    let mut state = shared.state.lock();
    let graph = &mut state.graph;

    if !graph.node(id)?.state().needs_compute() {
        return None;
    }
    let arguments = graph.arguments(id)?;
    let label = graph.label(id);

    let node = graph.node_mut(id)?;
    let token = node.begin_invocation();
    Some(Prepared {
        token,
        producer: node.producer().clone(),
        arguments,
        label,
    })
}

fn invoke(producer: &Producer, arguments: &[Value]) -> Invocation {
    match producer {
        Producer::Constant(value) => Invocation::Ready(Ok(value.clone())),
        Producer::Sync(func) => {
            Invocation::Ready(guarded(|| func(arguments)).and_then(|result| result))
        }
        Producer::Async(func) => match guarded(|| func(arguments)) {
            Ok(Ok(deferred)) => Invocation::Deferred(deferred),
            Ok(Err(error)) | Err(error) => Invocation::Ready(Err(error)),
        },
    }
}

/// Run user code, turning a panic into a producer error.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, ProducerError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| ProducerError::new(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

/// Wire a deferred result back into the graph.
fn attach(
    shared: &Arc<Shared>,
    id: NodeId,
    token: u64,
    deferred: Deferred,
    report: &mut PassReport,
) {
    if let Some(outcome) = deferred.take_outcome() {
        if let Some(error) = complete(shared, id, token, outcome) {
            report.push_error(error);
        }
        return;
    }

    let weak = Arc::downgrade(shared);
    deferred.on_complete(move |outcome| {
        let Some(shared) = weak.upgrade() else {
            trace!("completion arrived after the instance was dropped");
            return;
        };
        let mut state = shared.state.lock();
        if let Some(error) = apply(&mut state, id, token, outcome) {
            state.failures.push(error);
        }
    });
}

fn complete(shared: &Shared, id: NodeId, token: u64, outcome: Outcome) -> Option<EngineError> {
    let mut state = shared.state.lock();
    apply(&mut state, id, token, outcome)
}

/// Store an outcome if the invocation is still current.
fn apply(
    state: &mut EngineState,
    id: NodeId,
    token: u64,
    outcome: Outcome,
) -> Option<EngineError> {
    let graph = &mut state.graph;
    match graph.node(id) {
        Some(node) if node.accepts(token) => {}
        _ => {
            trace!(node = id.raw(), token, "discarding superseded completion");
            return None;
        }
    }

    let label = graph.label(id);
    let stored = outcome
        .map_err(|error| error.message().to_string())
        .and_then(|value| graph.store(id, value));

    match stored {
        Ok(updated) => {
            debug!(slot = %label, ?updated, "resolved");
            None
        }
        Err(message) => {
            warn!(slot = %label, %message, "producer failed");
            if let Some(node) = graph.node_mut(id) {
                node.mark_failed(message.clone());
            }
            Some(EngineError::ProducerFailure {
                slot: label,
                message,
            })
        }
    }
}

/// Deliver callbacks and apply queued operations.
fn finish(shared: &Shared, mut report: PassReport) -> PassReport {
    let deliveries = {
        let mut state = shared.state.lock();
        for error in std::mem::take(&mut state.failures) {
            report.push_error(error);
        }

        let EngineState {
            graph, requests, ..
        } = &mut *state;
        let mut deliveries = Vec::new();
        requests.retain_mut(|request| match request.check(graph) {
            Some(delivery) => {
                deliveries.push(delivery);
                !request.is_once()
            }
            None => true,
        });

        state.evaluating = false;
        for op in std::mem::take(&mut state.queued) {
            op.apply(&mut state.graph);
        }
        deliveries
    };

    debug!(
        invoked = report.invoked,
        errors = report.errors.len(),
        delivered = deliveries.len(),
        "pass finished"
    );

    for delivery in deliveries {
        let request = delivery.request();
        if let Err(error) = guarded(|| delivery.fire()) {
            warn!(request = request.raw(), %error, "callback failed");
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_deduplicates_errors() {
        let mut report = PassReport::default();
        assert!(report.is_clean());
        assert!(report.push_error(EngineError::unknown("a")));
        assert!(!report.push_error(EngineError::unknown("a")));
        assert_eq!(report.errors.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn panics_become_producer_errors() {
        let producer = Producer::Sync(Arc::new(|_: &[Value]| -> Result<Value, ProducerError> {
            panic!("kaputt")
        }));
        match invoke(&producer, &[]) {
            Invocation::Ready(Err(error)) => assert_eq!(error.message(), "panicked: kaputt"),
            _ => panic!("expected a failed invocation"),
        }
    }

    #[test]
    fn constants_are_ready() {
        let producer = Producer::Constant(serde_json::json!(1));
        assert!(matches!(
            invoke(&producer, &[]),
            Invocation::Ready(Ok(value)) if value == serde_json::json!(1)
        ));
    }
}
