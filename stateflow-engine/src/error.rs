//! Interpreter error taxonomy.
//!
//! Model-build failures are fatal before a run starts
//! ([`stateflow_model::ModelError`]). At run time, evaluator failures
//! inside actions become `error.execution` platform events and invoke
//! failures become `error.communication.<invoke-id>` events, both
//! delivered through the internal queue without aborting the run. Only
//! platform invariant violations, cancellation, and (under the
//! [`UnhandledErrorBehaviour::HaltStateMachine`] policy) unhandled error
//! events end a run with [`RunError`].

use stateflow_checkpoint::CheckpointError;
use stateflow_model::ModelError;
use stateflow_value::ValueError;
use thiserror::Error;

/// An evaluator failed while executing an action or expression.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("evaluation of '{expr}' failed: {reason}")]
    Evaluation { expr: String, reason: String },

    #[error("illegal location '{location}': {reason}")]
    IllegalLocation { location: String, reason: String },

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// An invoked service failed to start or reported failure.
#[derive(Debug, Error)]
pub enum CommunicationError {
    #[error("unknown service type: '{service_type}'")]
    UnknownServiceType { service_type: String },

    #[error("invoke '{invoke_id}' failed to start: {reason}")]
    StartFailed { invoke_id: String, reason: String },

    #[error("event channel closed")]
    ChannelClosed,
}

/// Policy for error events that no transition handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledErrorBehaviour {
    /// Log the event and keep running.
    #[default]
    Ignore,
    /// Terminate the run with [`RunError::UnhandledError`].
    HaltStateMachine,
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run was cancelled")]
    Cancelled,

    #[error("unhandled error event: '{event}'")]
    UnhandledError { event: String },

    #[error("platform invariant violated: {0}")]
    Platform(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Value(#[from] ValueError),
}
