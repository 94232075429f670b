//! # stateflow-engine
//!
//! Statechart execution engine for stateflow.
//!
//! This crate provides:
//! - Build-time evaluator resolution over a compiled model
//! - The interpreter step loop (microsteps, macrosteps, stable points)
//! - Event queues, delayed sends, and invoked-service management
//! - The basic expression binding for guards and assignments
//! - Checkpoint persistence and session restore

pub mod action;
pub mod binding;
pub mod build;
pub mod datamodel;
pub mod error;
pub mod event;
pub mod interpreter;
pub mod invoke;
mod persist;
pub mod queue;

pub use action::{CompiledAction, PendingSends, SendTarget};
pub use binding::{
    BasicBinding, CompileError, ConditionEvaluator, DataModelBinding, LocationEvaluator,
    ScriptEvaluator, ValueEvaluator,
};
pub use build::{build_model, CompiledInvoke, CompiledModel};
pub use datamodel::DataModel;
pub use error::{CommunicationError, ExecutionError, RunError, UnhandledErrorBehaviour};
pub use event::{descriptor_matches, Event, EventKind, InvokeId};
pub use interpreter::{
    CancelHandle, CheckpointGranularity, Interpreter, InterpreterOptions,
};
pub use invoke::{
    EchoFactory, InvokeManager, InvokeRequest, InvokedService, ServiceFactory, ServiceRegistry,
    StartInvoke,
};
pub use queue::{EventQueue, EventSender};
