//! Error types for the resolution engine.
//!
//! Configuration errors (`UnknownSlot`, `CyclicDependency`) and producer
//! failures never abort an [`Instance`](crate::Instance). They are confined
//! to the slots that need the broken part of the graph and are reported in
//! the [`PassReport`](crate::PassReport) of the pass that ran into them.

use thiserror::Error;

/// Errors raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A slot (or a dependency of a slot) was never declared.
    #[error("unknown slot `{slot}`{}", needed_by_suffix(.needed_by))]
    UnknownSlot {
        /// The missing slot name.
        slot: String,
        /// The slot whose producer asked for it, if any.
        needed_by: Option<String>,
    },

    /// The dependency closure of a request contains a cycle.
    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency {
        /// Slot names forming the cycle, first name repeated at the end.
        path: Vec<String>,
    },

    /// A producer returned an error, panicked, or its deferred result was
    /// rejected.
    #[error("producer for `{slot}` failed: {message}")]
    ProducerFailure {
        /// The slot whose producer failed.
        slot: String,
        /// Failure description.
        message: String,
    },

    /// The operation is not legal for the target.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

fn needed_by_suffix(needed_by: &Option<String>) -> String {
    match needed_by {
        Some(name) => format!(" (required by `{}`)", name),
        None => String::new(),
    }
}

impl EngineError {
    /// Shorthand for an unknown slot with no known dependent.
    pub fn unknown(slot: impl Into<String>) -> Self {
        EngineError::UnknownSlot {
            slot: slot.into(),
            needed_by: None,
        }
    }

    /// Returns true for errors caused by the shape of the graph rather than
    /// by a producer at runtime.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownSlot { .. } | EngineError::CyclicDependency { .. }
        )
    }
}

/// Failure reported by a user factory.
///
/// Factories return `Result<_, ProducerError>`; anything displayable can be
/// converted with `?` or `.into()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProducerError {
    message: String,
}

impl ProducerError {
    /// Create a producer error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for ProducerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ProducerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for ProducerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_slot_mentions_dependent() {
        let err = EngineError::UnknownSlot {
            slot: "a".into(),
            needed_by: Some("b".into()),
        };
        assert_eq!(err.to_string(), "unknown slot `a` (required by `b`)");
        assert_eq!(EngineError::unknown("a").to_string(), "unknown slot `a`");
    }

    #[test]
    fn cycle_is_rendered_as_path() {
        let err = EngineError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
        assert!(err.is_configuration());
    }

    #[test]
    fn producer_error_converts_from_strings() {
        let err: ProducerError = "boom".into();
        assert_eq!(err.message(), "boom");
        assert!(!EngineError::InvalidOperation("x".into()).is_configuration());
    }
}
