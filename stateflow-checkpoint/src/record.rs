//! Checkpoint record framing.
//!
//! Each record has the following on-disk format:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+----------+
//! | magic    | op       | flags    | reserved | key_len  | val_len  | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+----------+
//! | key path bytes      | value bytes                                          |
//! | key_len bytes       | val_len bytes                                        |
//! +---------------------+------------------------------------------------------+
//! ```
//!
//! The crc covers key and value bytes. A `RemoveSubtree` record carries a
//! subtree-terminated key path and no value.

use crate::error::CheckpointError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for checkpoint records: "SFCP"
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SFCP";

/// Maximum record payload size (key + value, 16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Operation carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckpointOp {
    /// Sets the value at an exact key path.
    Put = 1,
    /// Logically deletes every key beneath a prefix.
    RemoveSubtree = 2,
}

impl TryFrom<u8> for CheckpointOp {
    type Error = CheckpointError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CheckpointOp::Put),
            2 => Ok(CheckpointOp::RemoveSubtree),
            _ => Err(CheckpointError::InvalidHeader {
                offset: 0,
                reason: format!("unknown op: {value}"),
            }),
        }
    }
}

/// A complete checkpoint record.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub op: CheckpointOp,
    pub key: Bytes,
    pub value: Bytes,
}

impl CheckpointRecord {
    pub fn put(key: Bytes, value: Bytes) -> Self {
        Self {
            op: CheckpointOp::Put,
            key,
            value,
        }
    }

    pub fn remove_subtree(key: Bytes) -> Self {
        Self {
            op: CheckpointOp::RemoveSubtree,
            key,
            value: Bytes::new(),
        }
    }

    /// Encodes the record into bytes.
    pub fn encode(&self) -> Result<BytesMut, CheckpointError> {
        let payload_len = self.key.len() + self.value.len();
        if payload_len > MAX_RECORD_SIZE {
            return Err(CheckpointError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        let mut crc = crc32c::crc32c(&self.key);
        crc = crc32c::crc32c_append(crc, &self.value);

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload_len);
        buf.put_slice(&CHECKPOINT_MAGIC);
        buf.put_u8(self.op as u8);
        buf.put_u8(0); // flags
        buf.put_u16(0); // reserved
        buf.put_u32(self.key.len() as u32);
        buf.put_u32(self.value.len() as u32);
        buf.put_u32(crc);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
        Ok(buf)
    }

    /// Decodes one record from the front of `buf`. Returns `None` when the
    /// buffer holds an incomplete record or zero padding at end of file.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, CheckpointError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != CHECKPOINT_MAGIC {
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(CheckpointError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {magic:?}"),
            });
        }

        let op = CheckpointOp::try_from(buf[4]).map_err(|_| CheckpointError::InvalidHeader {
            offset,
            reason: format!("unknown op: {}", buf[4]),
        })?;
        // flags: buf[5], reserved: buf[6..8]
        let key_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let value_len = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);

        let payload_len = key_len + value_len;
        if payload_len > MAX_RECORD_SIZE {
            return Err(CheckpointError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let key = buf.split_to(key_len).freeze();
        let value = buf.split_to(value_len).freeze();

        let mut crc_actual = crc32c::crc32c(&key);
        crc_actual = crc32c::crc32c_append(crc_actual, &value);
        if crc_actual != crc_expected {
            return Err(CheckpointError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self { op, key, value }))
    }

    /// Total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + self.value.len()
    }
}
