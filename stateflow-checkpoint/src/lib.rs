//! Append-only checkpoint log.
//!
//! The interpreter persists its resumable state as (key path, value bytes)
//! records: active configuration by document id, the data-model value tree,
//! and invoke bookkeeping. This crate provides the key-path encoding, the
//! on-disk record framing, and two [`CheckpointLog`] implementations - an
//! in-memory log for tests and ephemeral sessions, and a file-backed log
//! that replays its records into a last-write-wins index on open.

pub mod error;
pub mod keypath;
pub mod log;
pub mod record;

pub use error::CheckpointError;
pub use keypath::{KeyPath, Segment};
pub use log::{CheckpointLog, FileLog, FsyncPolicy, LogConfig, MemoryLog};
pub use record::{CheckpointOp, CheckpointRecord};

/// Size of a record header on disk (magic + op + flags + reserved +
/// key length + value length + crc32c).
pub const RECORD_HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 4 + 4 + 4;
