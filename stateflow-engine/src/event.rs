//! Events and event-descriptor matching.

use stateflow_value::Value;
use std::fmt;
use uuid::Uuid;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Raised by the interpreter itself (`error.*`, `done.*`).
    Platform,
    /// Raised by executable content within the session.
    Internal,
    /// Sent from outside the session or by an invoked service.
    External,
}

/// A processed-exactly-once event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Dot-segmented name, e.g. `done.invoke.loader`.
    pub name: String,
    pub kind: EventKind,
    /// Session or service that produced the event.
    pub origin: Option<String>,
    /// The `send` id that produced this event, when any.
    pub send_id: Option<String>,
    /// Set on events emitted by an invoked service.
    pub invoke_id: Option<String>,
    pub data: Value,
}

impl Event {
    pub fn new(name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            name: name.into(),
            kind,
            origin: None,
            send_id: None,
            invoke_id: None,
            data: Value::Undefined,
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self::new(name, EventKind::External)
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self::new(name, EventKind::Internal)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: impl Into<String>) -> Self {
        self.invoke_id = Some(invoke_id.into());
        self
    }

    /// Platform event for an evaluator failure during action execution.
    pub fn error_execution(reason: impl Into<String>) -> Self {
        Self::new("error.execution", EventKind::Platform).with_data(Value::from(reason.into()))
    }

    /// Platform event for an invoked service failure.
    pub fn error_communication(invoke_id: &str, reason: impl Into<String>) -> Self {
        Self::new(
            format!("error.communication.{invoke_id}"),
            EventKind::Platform,
        )
        .with_data(Value::from(reason.into()))
    }

    /// Raised when a compound or parallel state completes.
    pub fn done_state(state_id: &str, data: Value) -> Self {
        Self::new(format!("done.state.{state_id}"), EventKind::Platform).with_data(data)
    }

    /// Raised when an invoked service completes.
    pub fn done_invoke(invoke_id: &str, data: Value) -> Self {
        Self::new(format!("done.invoke.{invoke_id}"), EventKind::External)
            .with_data(data)
            .with_invoke_id(invoke_id)
    }

    pub fn is_error(&self) -> bool {
        self.name == "error" || self.name.starts_with("error.")
    }
}

/// True when `descriptor` matches `event_name`.
///
/// `*` matches every event. Otherwise the descriptor's dot-separated
/// tokens (with a trailing `.*` stripped) must be a token prefix of the
/// event name: `done.invoke` matches `done.invoke.loader` but never
/// `done.invoked`.
pub fn descriptor_matches(descriptor: &str, event_name: &str) -> bool {
    if descriptor == "*" {
        return true;
    }
    let descriptor = descriptor
        .strip_suffix(".*")
        .unwrap_or(descriptor)
        .trim_end_matches('.');
    if descriptor.is_empty() {
        return false;
    }

    let mut event_tokens = event_name.split('.');
    for token in descriptor.split('.') {
        if event_tokens.next() != Some(token) {
            return false;
        }
    }
    true
}

/// A logical invoke id plus a per-activation unique suffix, so a
/// cancelled-and-restarted invocation never collides with a stale
/// in-flight response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvokeId {
    pub logical: String,
    pub unique: String,
}

impl InvokeId {
    /// Creates a fresh activation of the logical id.
    pub fn fresh(logical: impl Into<String>) -> Self {
        let logical = logical.into();
        let unique = format!("{}.{}", logical, Uuid::new_v4().simple());
        Self { logical, unique }
    }

    /// Rebuilds an activation from persisted parts.
    pub fn from_parts(logical: impl Into<String>, unique: impl Into<String>) -> Self {
        Self {
            logical: logical.into(),
            unique: unique.into(),
        }
    }
}

impl fmt::Display for InvokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything() {
        assert!(descriptor_matches("*", "anything.at.all"));
        assert!(descriptor_matches("*", "x"));
    }

    #[test]
    fn token_prefix_matching() {
        assert!(descriptor_matches("done.invoke", "done.invoke.loader"));
        assert!(descriptor_matches("done.invoke.*", "done.invoke.loader"));
        assert!(descriptor_matches("done.invoke", "done.invoke"));
        assert!(!descriptor_matches("done.invoke", "done.invoked"));
        assert!(!descriptor_matches("done.invoke.loader", "done.invoke"));
        assert!(!descriptor_matches("error", "done.invoke"));
    }

    #[test]
    fn error_prefix_matching() {
        assert!(descriptor_matches("error", "error.execution"));
        assert!(descriptor_matches("error.*", "error.communication.svc"));
        assert!(!descriptor_matches("error.execution", "error.communication.svc"));
    }

    #[test]
    fn invoke_ids_never_collide_across_activations() {
        let first = InvokeId::fresh("loader");
        let second = InvokeId::fresh("loader");
        assert_eq!(first.logical, second.logical);
        assert_ne!(first.unique, second.unique);
        assert!(first.unique.starts_with("loader."));
    }

    #[test]
    fn error_event_detection() {
        assert!(Event::error_execution("boom").is_error());
        assert!(Event::error_communication("svc", "down").is_error());
        assert!(!Event::external("errors.custom").is_error());
    }
}
