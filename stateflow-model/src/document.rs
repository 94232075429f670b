//! Statechart document AST.
//!
//! The compiler consumes an already-parsed, validated document; these types
//! are that parsed form. They derive serde so a document can be written as
//! a JSON DSL:
//!
//! ```json
//! {
//!   "name": "traffic",
//!   "states": [
//!     {"kind": "state", "id": "red",
//!      "transitions": [{"events": ["tick"], "targets": ["green"]}]},
//!     {"kind": "state", "id": "green",
//!      "transitions": [{"events": ["tick"], "targets": ["red"]}]}
//!   ]
//! }
//! ```
//!
//! Expressions (`cond`, `expr`, `location` payloads) are raw text here;
//! the engine's data-model binding compiles each one exactly once at model
//! build time.

use serde::{Deserialize, Serialize};

/// Raw expression text, resolved by the data-model binding at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Expression(pub String);

impl Expression {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The root of a statechart document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMachineDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Initial state ids. Empty means "first child state".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,

    /// Top-level data-model declarations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDocument>,

    pub states: Vec<StateDocument>,
}

/// A state entity in the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateDocument {
    State(Box<CompoundDocument>),
    Parallel(Box<ParallelDocument>),
    Final(Box<FinalDocument>),
    History(Box<HistoryDocument>),
}

impl StateDocument {
    pub fn id(&self) -> &str {
        match self {
            StateDocument::State(s) => &s.id,
            StateDocument::Parallel(p) => &p.id,
            StateDocument::Final(f) => &f.id,
            StateDocument::History(h) => &h.id,
        }
    }
}

/// An atomic or compound state (atomic when `states` is empty).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompoundDocument {
    pub id: String,

    /// Initial child ids for compound states. Empty means "first child".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invokes: Vec<InvokeDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<ActionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDocument>,
}

/// A parallel state: all child regions are active simultaneously.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelDocument {
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invokes: Vec<InvokeDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<ActionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datamodel: Vec<DataDocument>,
}

/// A final state. Entering it completes its parent's region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalDocument {
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<ActionDocument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionDocument>,

    /// Evaluated at entry; delivered in `done.state.*` events and recorded
    /// as the run's final value for a top-level final state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_data: Option<Expression>,
}

/// A history pseudostate. Never active itself; records its parent's
/// configuration on exit for later re-entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub id: String,

    /// Deep history restores the full nested configuration; shallow
    /// history restores only the immediate child.
    #[serde(default)]
    pub deep: bool,

    /// Default targets entered when no history has been recorded yet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

/// A transition between states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDocument {
    /// Event descriptors ("error.*", "done.invoke", ...). Empty means
    /// eventless.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,

    /// Guard condition; a failing or throwing guard disables the
    /// transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<Expression>,

    /// Target state ids. Empty means targetless (actions only, no
    /// exit/entry).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// Internal transitions do not exit their source state when every
    /// target is a descendant of it.
    #[serde(default)]
    pub internal: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDocument>,
}

/// An invoked external service declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeDocument {
    /// Logical invoke id; auto-generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Service type understood by the service factory (e.g. "echo").
    #[serde(rename = "type")]
    pub service_type: String,

    /// Source expression, evaluated against the current data model at
    /// start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Expression>,

    /// Inline content expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Expression>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDocument>,

    /// Forward every external event received by the session to this
    /// service while it runs.
    #[serde(default)]
    pub auto_forward: bool,

    /// Actions run against the payload of events returned by the service,
    /// before the event is processed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<ActionDocument>,
}

/// A named parameter passed to an invoked service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDocument {
    pub name: String,
    pub expr: Expression,
}

/// A data-model declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDocument {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expression>,
}

/// Executable content: the closed set of built-in action kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionDocument {
    Assign {
        location: String,
        expr: Expression,
    },
    Raise {
        event: String,
    },
    Send {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Expression>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        /// `None` targets this session's external queue; `"#_internal"`
        /// targets the internal queue; `"#_invoke_<id>"` targets a running
        /// invoked service.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Cancel {
        send_id: String,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<Expression>,
    },
    Script {
        source: Expression,
    },
    If {
        branches: Vec<IfBranchDocument>,
    },
    ForEach {
        array: Expression,
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        actions: Vec<ActionDocument>,
    },
}

/// One arm of an `if` action; `cond: None` is the `else` arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfBranchDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<Expression>,
    pub actions: Vec<ActionDocument>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_from_json_dsl() {
        let doc: StateMachineDocument = serde_json::from_value(json!({
            "name": "traffic",
            "states": [
                {"kind": "state", "id": "red",
                 "on_entry": [{"action": "log", "label": "entered red"}],
                 "transitions": [{"events": ["tick"], "targets": ["green"]}]},
                {"kind": "state", "id": "green",
                 "transitions": [
                     {"events": ["tick"], "targets": ["red"],
                      "cond": "ctx.enabled"}
                 ]},
                {"kind": "final", "id": "off"}
            ]
        }))
        .unwrap();

        assert_eq!(doc.name.as_deref(), Some("traffic"));
        assert_eq!(doc.states.len(), 3);
        assert_eq!(doc.states[0].id(), "red");

        let StateDocument::State(green) = &doc.states[1] else {
            panic!("expected state");
        };
        assert_eq!(
            green.transitions[0].cond,
            Some(Expression::from("ctx.enabled"))
        );
    }

    #[test]
    fn invoke_document_type_field() {
        let invoke: InvokeDocument = serde_json::from_value(json!({
            "type": "echo",
            "id": "svc",
            "auto_forward": true
        }))
        .unwrap();
        assert_eq!(invoke.service_type, "echo");
        assert_eq!(invoke.id.as_deref(), Some("svc"));
        assert!(invoke.auto_forward);
    }
}
