//! Model build error types.

use std::fmt;

/// Errors that fail model construction before any run starts.
///
/// `Display`/`Error` are implemented by hand because the `source` fields
/// hold state/expression text (not an error cause), which `thiserror`'s
/// name-based source inference cannot express.
#[derive(Debug)]
pub enum ModelError {
    UnresolvedTarget {
        source: String,
        target: String,
    },

    DuplicateStateId {
        id: String,
    },

    EmptyDocument,

    InvalidInitial {
        state: String,
        target: String,
        reason: &'static str,
    },

    HistoryOutsideCompound {
        id: String,
    },

    EvaluatorResolution {
        kind: &'static str,
        source: String,
        reason: String,
    },

    Json(serde_json::Error),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnresolvedTarget { source, target } => write!(
                f,
                "unresolved transition target '{target}' (from state '{source}')"
            ),
            ModelError::DuplicateStateId { id } => write!(f, "duplicate state id: '{id}'"),
            ModelError::EmptyDocument => write!(f, "document has no states"),
            ModelError::InvalidInitial {
                state,
                target,
                reason,
            } => write!(
                f,
                "invalid initial target '{target}' for '{state}': {reason}"
            ),
            ModelError::HistoryOutsideCompound { id } => write!(
                f,
                "history state '{id}' must be a child of a compound state"
            ),
            ModelError::EvaluatorResolution {
                kind,
                source,
                reason,
            } => write!(f, "cannot resolve {kind} '{source}': {reason}"),
            ModelError::Json(err) => write!(f, "JSON error: {err}"),
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Json(err)
    }
}
