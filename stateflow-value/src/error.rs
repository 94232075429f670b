//! Value error types.

use thiserror::Error;

/// Errors from value narrowing, mutation, and the binary codec.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("access violation: '{target}' is {access}")]
    AccessViolation {
        target: String,
        access: &'static str,
    },

    #[error("cyclic value cannot be encoded")]
    CyclicValue,

    #[error("unknown value tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("unexpected end of value stream")]
    UnexpectedEof,

    #[error("invalid UTF-8 in string payload: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(i64),

    #[error("invalid UTC offset: {0} seconds")]
    InvalidOffset(i32),
}
