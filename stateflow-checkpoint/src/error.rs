//! Checkpoint log error types.

use thiserror::Error;

/// Errors from the checkpoint log.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("corrupted record at offset {offset}: crc expected {expected:#010x}, got {actual:#010x}")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("invalid key path: {reason}")]
    InvalidKeyPath { reason: String },

    #[error("checkpoint log is closed")]
    Closed,
}
