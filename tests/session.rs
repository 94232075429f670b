//! End-to-end session tests through the facade crate.

use stateflow::{
    build_model, BasicBinding, CheckpointLog, CompiledModel, Event, FileLog, Interpreter,
    LogConfig, RunError, ServiceRegistry, Value,
};
use std::sync::Arc;
use std::time::Duration;

fn compile(doc: serde_json::Value) -> Arc<CompiledModel> {
    let document = serde_json::from_value(doc).unwrap();
    Arc::new(build_model(&document, &BasicBinding).unwrap())
}

fn order_document() -> serde_json::Value {
    serde_json::json!({
        "name": "order",
        "datamodel": [{"id": "receipt"}],
        "states": [
            {"kind": "state", "id": "validating",
             "invokes": [{"type": "echo", "id": "validator", "content": "'order-ok'",
                          "finalize": [{"action": "assign", "location": "receipt",
                                        "expr": "_event.data"}]}],
             "transitions": [{"events": ["done.invoke.validator"], "targets": ["fulfilling"]}]},
            {"kind": "parallel", "id": "fulfilling",
             "transitions": [{"events": ["done.state.fulfilling"], "targets": ["done"]}],
             "states": [
                 {"kind": "state", "id": "payment", "states": [
                     {"kind": "state", "id": "charging",
                      "transitions": [{"events": ["charged"], "targets": ["paid"]}]},
                     {"kind": "final", "id": "paid"}
                 ]},
                 {"kind": "state", "id": "shipping", "states": [
                     {"kind": "state", "id": "packing",
                      "transitions": [{"events": ["shipped"], "targets": ["sent"]}]},
                     {"kind": "final", "id": "sent"}
                 ]}
             ]},
            {"kind": "final", "id": "done", "done_data": "receipt"}
        ]
    })
}

async fn finished(
    handle: tokio::task::JoinHandle<Result<Value, RunError>>,
) -> Result<Value, RunError> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not complete")
        .expect("run task panicked")
}

/// Lets the spawned session and the echo service task make progress.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn order_flow_with_invoke_and_parallel_regions() {
    let session = Interpreter::new(compile(order_document()), Arc::new(ServiceRegistry::new()));
    let sender = session.sender();
    let run = tokio::spawn(session.run(Value::Undefined));

    // The validator echo service moves the machine into the parallel
    // state on its own; wait for that before driving the regions.
    settle().await;
    sender.send(Event::external("charged")).unwrap();
    sender.send(Event::external("shipped")).unwrap();

    assert_eq!(finished(run).await.unwrap(), Value::from("order-ok"));
}

#[tokio::test]
async fn crash_and_restore_from_file_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("order.ckpt");
    let compiled = compile(order_document());

    {
        let log: Arc<dyn CheckpointLog> =
            Arc::new(FileLog::open(LogConfig::new(&path)).unwrap());
        let session = Interpreter::new(compiled.clone(), Arc::new(ServiceRegistry::new()))
            .with_checkpoint(log);
        let sender = session.sender();
        let cancel = session.cancel_handle();
        let run = tokio::spawn(session.run(Value::Undefined));

        settle().await;
        sender.send(Event::external("charged")).unwrap();
        settle().await;
        cancel.cancel();
        assert!(matches!(finished(run).await, Err(RunError::Cancelled)));
    }

    // Reopen the log and pick up where the first session stopped: the
    // payment region is already final, only shipping remains.
    let log: Arc<dyn CheckpointLog> = Arc::new(FileLog::open(LogConfig::new(&path)).unwrap());
    let restored =
        Interpreter::restore(compiled, Arc::new(ServiceRegistry::new()), log).unwrap();
    let sender = restored.sender();
    let run = tokio::spawn(restored.resume());

    sender.send(Event::external("shipped")).unwrap();
    assert_eq!(finished(run).await.unwrap(), Value::from("order-ok"));
}
