//! # stateflow-value
//!
//! Runtime value model for stateflow.
//!
//! This crate provides:
//! - The tagged, cheaply copyable [`Value`] type used for data-model
//!   storage, event payloads, and expression results
//! - [`Obj`], an ordered mapping with per-entry access levels and
//!   optional case-insensitive key lookup
//! - Conversion to and from `serde_json::Value`
//! - A self-describing binary encoding for checkpointing

pub mod codec;
pub mod convert;
pub mod error;
pub mod object;
pub mod value;

pub use codec::{decode_value, encode_value};
pub use convert::{from_json, to_json};
pub use error::ValueError;
pub use object::{AccessLevel, Entry, Obj};
pub use value::{DateTime, Lazy, LazyValue, Number, Value};
