//! # stateflow-model
//!
//! Compiled statechart model for stateflow.
//!
//! This crate provides:
//! - The document AST types the engine consumes (an already-parsed
//!   statechart; serde-derived so documents can be loaded from JSON)
//! - The immutable compiled node arena, indexed by document-order ids
//! - The two-pass compiler: pass one allocates nodes and ids in document
//!   order, pass two resolves transition targets and initial/history
//!   references

pub mod compiler;
pub mod document;
pub mod error;
pub mod node;

pub use compiler::build;
pub use document::{
    ActionDocument, DataDocument, Expression, FinalDocument, HistoryDocument, IfBranchDocument,
    InvokeDocument, ParallelDocument, ParamDocument, StateDocument, StateMachineDocument,
    TransitionDocument,
};
pub use error::ModelError;
pub use node::{
    DataNode, DocumentId, FinalNode, HistoryNode, InvokeNode, Model, Node, ParallelNode,
    StateMachineNode, StateNode, TransitionNode,
};
