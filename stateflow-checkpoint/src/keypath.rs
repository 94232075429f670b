//! Key-path encoding.
//!
//! A key path is a sequence of segments addressing one slot of the
//! persisted state tree. Each segment is either a small integer (a
//! document-id or array index) or a string (a named field). The encoding
//! is self-delimiting and order-preserving:
//!
//! ```text
//! segment := 0x01 varint          (index)
//!          | 0x02 varint utf8     (string, length-prefixed)
//! path    := segment* terminator
//! varint  := length byte (1..=8) + minimal big-endian value bytes
//! ```
//!
//! The terminator byte is `0x00` for an exact key and `0xFF` for a
//! subtree prefix, so `["A"]` and `["AB"]` never collide and subtree
//! deletion is unambiguous.

use crate::error::CheckpointError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

const SEG_INDEX: u8 = 0x01;
const SEG_KEY: u8 = 0x02;
const TERM_EXACT: u8 = 0x00;
const TERM_SUBTREE: u8 = 0xFF;

/// One step of a key path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Segment {
    /// Document-id or array index.
    Index(u64),
    /// Named field.
    Key(String),
}

impl From<u64> for Segment {
    fn from(i: u64) -> Self {
        Segment::Index(i)
    }
}

impl From<u32> for Segment {
    fn from(i: u32) -> Self {
        Segment::Index(i as u64)
    }
}

impl From<&str> for Segment {
    fn from(s: &str) -> Self {
        Segment::Key(s.to_string())
    }
}

impl From<String> for Segment {
    fn from(s: String) -> Self {
        Segment::Key(s)
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Index(i) => write!(f, "{i}"),
            Segment::Key(s) => write!(f, "{s}"),
        }
    }
}

/// A sequence of segments addressing a persisted slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath(Vec<Segment>);

impl KeyPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn root(segment: impl Into<Segment>) -> Self {
        Self(vec![segment.into()])
    }

    /// Extends the path by one segment, returning the child path.
    pub fn child(&self, segment: impl Into<Segment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn push(&mut self, segment: impl Into<Segment>) {
        self.0.push(segment.into());
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `self` equals `prefix` or lies beneath it.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Encodes as an exact key (terminator `0x00`).
    pub fn encode(&self) -> Bytes {
        self.encode_with(TERM_EXACT)
    }

    /// Encodes as a subtree prefix (terminator `0xFF`).
    pub fn encode_subtree(&self) -> Bytes {
        self.encode_with(TERM_SUBTREE)
    }

    fn encode_with(&self, terminator: u8) -> Bytes {
        let mut buf = BytesMut::new();
        for segment in &self.0 {
            match segment {
                Segment::Index(i) => {
                    buf.put_u8(SEG_INDEX);
                    put_varint(&mut buf, *i);
                }
                Segment::Key(s) => {
                    buf.put_u8(SEG_KEY);
                    put_varint(&mut buf, s.len() as u64);
                    buf.put_slice(s.as_bytes());
                }
            }
        }
        buf.put_u8(terminator);
        buf.freeze()
    }

    /// Decodes a path; the bool is true for a subtree prefix.
    pub fn decode(buf: &[u8]) -> Result<(KeyPath, bool), CheckpointError> {
        let mut segments = Vec::new();
        let mut pos = 0usize;
        loop {
            let tag = *buf.get(pos).ok_or_else(|| CheckpointError::InvalidKeyPath {
                reason: "missing terminator".to_string(),
            })?;
            pos += 1;
            match tag {
                TERM_EXACT => return Ok((KeyPath(segments), false)),
                TERM_SUBTREE => return Ok((KeyPath(segments), true)),
                SEG_INDEX => {
                    let (value, read) = get_varint(&buf[pos..])?;
                    pos += read;
                    segments.push(Segment::Index(value));
                }
                SEG_KEY => {
                    let (len, read) = get_varint(&buf[pos..])?;
                    pos += read;
                    let len = len as usize;
                    let end = pos.checked_add(len).filter(|&e| e <= buf.len()).ok_or_else(
                        || CheckpointError::InvalidKeyPath {
                            reason: "string segment extends past buffer".to_string(),
                        },
                    )?;
                    let text = std::str::from_utf8(&buf[pos..end]).map_err(|_| {
                        CheckpointError::InvalidKeyPath {
                            reason: "string segment is not UTF-8".to_string(),
                        }
                    })?;
                    pos = end;
                    segments.push(Segment::Key(text.to_string()));
                }
                other => {
                    return Err(CheckpointError::InvalidKeyPath {
                        reason: format!("unknown segment tag {other:#04x}"),
                    });
                }
            }
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl<S: Into<Segment>> FromIterator<S> for KeyPath {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Order-preserving varint: one length byte then that many big-endian
/// value bytes, leading zeros stripped.
fn put_varint(buf: &mut BytesMut, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    buf.put_u8((8 - skip) as u8);
    buf.put_slice(&bytes[skip..]);
}

fn get_varint(buf: &[u8]) -> Result<(u64, usize), CheckpointError> {
    let len = *buf.first().ok_or_else(|| CheckpointError::InvalidKeyPath {
        reason: "truncated varint".to_string(),
    })? as usize;
    if !(1..=8).contains(&len) || buf.len() < 1 + len {
        return Err(CheckpointError::InvalidKeyPath {
            reason: format!("bad varint length {len}"),
        });
    }
    let mut value = 0u64;
    for &b in &buf[1..=len] {
        value = (value << 8) | b as u64;
    }
    Ok((value, 1 + len))
}
