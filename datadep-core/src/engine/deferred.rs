//! Deferred Results
//!
//! A [`Deferred`] is the pending result of an asynchronous producer. It is
//! created together with a [`Completer`]; whoever owns the completer (a
//! spawned task, an I/O callback, a test) fires it exactly once with the
//! value or a failure.
//!
//! The engine attaches a single listener to the deferred. If the completer
//! fired before the listener was attached, the outcome is kept and handed to
//! the listener as soon as it arrives, so no completion is lost between
//! evaluation passes.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::ProducerError;

/// Outcome carried by a deferred.
pub type Outcome = Result<Value, ProducerError>;

type Listener = Box<dyn FnOnce(Outcome) + Send>;

#[derive(Default)]
struct Shared {
    outcome: Option<Outcome>,
    listener: Option<Listener>,
}

/// A pending computation.
pub struct Deferred {
    shared: Arc<Mutex<Shared>>,
}

/// The write side of a [`Deferred`].
pub struct Completer {
    shared: Arc<Mutex<Shared>>,
}

impl Deferred {
    /// Create a pending deferred and its completer.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Deferred, Completer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Deferred {
                shared: Arc::clone(&shared),
            },
            Completer { shared },
        )
    }

    /// A deferred that already holds a value.
    pub fn resolved(value: impl Into<Value>) -> Self {
        let (deferred, completer) = Deferred::new();
        completer.resolve(value);
        deferred
    }

    /// A deferred that already failed.
    pub fn rejected(error: impl Into<ProducerError>) -> Self {
        let (deferred, completer) = Deferred::new();
        completer.reject(error);
        deferred
    }

    /// Whether the completer has fired and the outcome is still unclaimed.
    pub fn is_complete(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    /// Take the outcome if the completer already fired.
    pub(crate) fn take_outcome(&self) -> Option<Outcome> {
        self.shared.lock().outcome.take()
    }

    /// Attach the listener. Runs it right away if the outcome is known.
    pub(crate) fn on_complete<F>(self, listener: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let mut shared = self.shared.lock();
        match shared.outcome.take() {
            Some(outcome) => {
                drop(shared);
                listener(outcome);
            }
            None => shared.listener = Some(Box::new(listener)),
        }
    }
}

impl Completer {
    /// Complete with a value.
    pub fn resolve(self, value: impl Into<Value>) {
        self.complete(Ok(value.into()));
    }

    /// Complete with a failure.
    pub fn reject(self, error: impl Into<ProducerError>) {
        self.complete(Err(error.into()));
    }

    fn complete(self, outcome: Outcome) {
        let listener = {
            let mut shared = self.shared.lock();
            match shared.listener.take() {
                Some(listener) => listener,
                None => {
                    shared.outcome = Some(outcome);
                    return;
                }
            }
        };
        // Listener runs without the lock held
        listener(outcome);
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capture() -> (Arc<Mutex<Option<Outcome>>>, impl FnOnce(Outcome) + Send + 'static) {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        (seen, move |outcome| *seen_clone.lock() = Some(outcome))
    }

    #[test]
    fn listener_runs_on_later_completion() {
        let (deferred, completer) = Deferred::new();
        let (seen, listener) = capture();

        deferred.on_complete(listener);
        assert!(seen.lock().is_none());

        completer.resolve("FOO");
        assert_eq!(*seen.lock(), Some(Ok(json!("FOO"))));
    }

    #[test]
    fn outcome_is_kept_until_listener_arrives() {
        let (deferred, completer) = Deferred::new();
        completer.reject("nope");
        assert!(deferred.is_complete());

        let (seen, listener) = capture();
        deferred.on_complete(listener);
        assert_eq!(*seen.lock(), Some(Err(ProducerError::new("nope"))));
    }

    #[test]
    fn ready_constructors() {
        let deferred = Deferred::resolved(json!(1));
        assert_eq!(deferred.take_outcome(), Some(Ok(json!(1))));
        assert_eq!(deferred.take_outcome(), None);

        let failed = Deferred::rejected("bad");
        assert!(failed.is_complete());
    }

    #[test]
    fn completer_can_fire_from_another_thread() {
        let (deferred, completer) = Deferred::new();
        let (seen, listener) = capture();
        deferred.on_complete(listener);

        std::thread::spawn(move || completer.resolve(json!([1, 2])))
            .join()
            .unwrap();

        assert_eq!(*seen.lock(), Some(Ok(json!([1, 2]))));
    }
}
