//! # stateflow
//!
//! A hierarchical statechart execution engine with checkpoint
//! resumability.
//!
//! The workspace splits into four crates, all re-exported here:
//! - [`value`]: the runtime [`Value`] model and its binary codec
//! - [`model`]: the document AST and the compiled node arena
//! - [`engine`]: the interpreter, event queues, bindings, and invokes
//! - [`checkpoint`]: the append-only key-path checkpoint log
//!
//! # Example
//!
//! ```
//! use stateflow::{build_model, BasicBinding, Event, Interpreter, ServiceRegistry, Value};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let document = serde_json::from_value(serde_json::json!({
//!     "states": [
//!         {"kind": "state", "id": "idle",
//!          "transitions": [{"events": ["go"], "targets": ["end"]}]},
//!         {"kind": "final", "id": "end", "done_data": "'completed'"}
//!     ]
//! }))
//! .unwrap();
//!
//! let compiled = Arc::new(build_model(&document, &BasicBinding).unwrap());
//! let session = Interpreter::new(compiled, Arc::new(ServiceRegistry::new()));
//! let sender = session.sender();
//! let run = tokio::spawn(session.run(Value::Undefined));
//!
//! sender.send(Event::external("go")).unwrap();
//! assert_eq!(run.await.unwrap().unwrap(), Value::from("completed"));
//! # }
//! ```

pub use stateflow_checkpoint as checkpoint;
pub use stateflow_engine as engine;
pub use stateflow_model as model;
pub use stateflow_value as value;

pub use stateflow_checkpoint::{CheckpointLog, FileLog, FsyncPolicy, KeyPath, LogConfig, MemoryLog};
pub use stateflow_engine::{
    build_model, BasicBinding, CancelHandle, CheckpointGranularity, CompiledModel,
    DataModelBinding, Event, EventKind, EventSender, Interpreter, InterpreterOptions, RunError,
    ServiceFactory, ServiceRegistry, UnhandledErrorBehaviour,
};
pub use stateflow_model::{DocumentId, Model, ModelError, StateMachineDocument};
pub use stateflow_value::{Number, Obj, Value, ValueError};
