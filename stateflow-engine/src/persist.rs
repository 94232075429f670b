//! Checkpoint layout.
//!
//! Three key-path roots:
//!
//! ```text
//! config/<document-id>      -> 0x01           (active state marker)
//! datamodel                 -> Value codec    (the whole root object)
//! invokes/<logical-id>      -> Value codec    ({unique, state})
//! ```
//!
//! Each snapshot first removes the `config` and `invokes` subtrees, then
//! re-stores the live view, so the log's last-write-wins index always
//! reads as one consistent snapshot.

use crate::datamodel::DataModel;
use crate::error::RunError;
use crate::invoke::InvokeManager;
use stateflow_checkpoint::{CheckpointLog, KeyPath, Segment};
use stateflow_model::DocumentId;
use stateflow_value::{decode_value, encode_value, Obj, Value};
use std::collections::BTreeSet;

const CONFIG: &str = "config";
const DATAMODEL: &str = "datamodel";
const INVOKES: &str = "invokes";

/// Writes one consistent snapshot of the session.
pub(crate) fn save(
    log: &dyn CheckpointLog,
    configuration: &BTreeSet<DocumentId>,
    data: &DataModel,
    invokes: &InvokeManager,
) -> Result<(), RunError> {
    log.remove_subtree(&KeyPath::root(CONFIG))?;
    for &id in configuration {
        log.store(&KeyPath::root(CONFIG).child(id.as_u32()), &[1])?;
    }

    let encoded = encode_value(&Value::Object(data.root().clone()))?;
    log.store(&KeyPath::root(DATAMODEL), &encoded)?;

    log.remove_subtree(&KeyPath::root(INVOKES))?;
    for (logical, unique, state) in invokes.snapshot() {
        let record = Obj::new();
        record.add("unique", unique).map_err(RunError::Value)?;
        record
            .add("state", state.as_u32() as i64)
            .map_err(RunError::Value)?;
        let encoded = encode_value(&Value::from(record))?;
        log.store(&KeyPath::root(INVOKES).child(logical.as_str()), &encoded)?;
    }

    Ok(())
}

/// A snapshot read back from a checkpoint log.
pub(crate) struct Restored {
    pub configuration: BTreeSet<DocumentId>,
    pub root: Option<Obj>,
    /// (logical id, unique id of the interrupted activation, state).
    pub invokes: Vec<(String, String, DocumentId)>,
}

/// Reads the last snapshot, or `None` when the log is empty.
pub(crate) fn load(log: &dyn CheckpointLog) -> Result<Option<Restored>, RunError> {
    let entries = log.entries()?;
    if entries.is_empty() {
        return Ok(None);
    }

    let mut restored = Restored {
        configuration: BTreeSet::new(),
        root: None,
        invokes: Vec::new(),
    };

    for (path, bytes) in entries {
        match path.segments() {
            [Segment::Key(root), Segment::Index(id)] if root == CONFIG => {
                restored.configuration.insert(DocumentId(*id as u32));
            }
            [Segment::Key(root)] if root == DATAMODEL => {
                let value = decode_value(&bytes)?;
                restored.root = Some(value.as_object().map_err(RunError::Value)?);
            }
            [Segment::Key(root), Segment::Key(logical)] if root == INVOKES => {
                let record = decode_value(&bytes)?.as_object().map_err(RunError::Value)?;
                let unique = record.get("unique").as_string_or_default().to_string();
                let state = match record.get("state").as_number() {
                    Ok(n) => n.to_i64_exact().unwrap_or(0) as u32,
                    Err(_) => 0,
                };
                restored
                    .invokes
                    .push((logical.clone(), unique, DocumentId(state)));
            }
            other => {
                return Err(RunError::Platform(format!(
                    "unrecognized checkpoint key: {other:?}"
                )));
            }
        }
    }

    Ok(Some(restored))
}
