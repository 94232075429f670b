//! Self-describing binary encoding for values.
//!
//! Each value is a 1-byte tag followed by a fixed-size payload per
//! numeric/date sub-variant, or a length-prefixed payload for strings and
//! objects:
//!
//! ```text
//! 0x00 undefined            (no payload)
//! 0x01 null                 (no payload)
//! 0x02 false / 0x03 true    (no payload)
//! 0x04 int32                (4 bytes, big-endian)
//! 0x05 int64                (8 bytes)
//! 0x06 double               (8 bytes, IEEE-754 bits)
//! 0x07 decimal              (16 bytes, rust_decimal serialization)
//! 0x08 datetime, naive      (8 bytes, micros since epoch)
//! 0x09 datetime, UTC        (8 bytes, micros since epoch)
//! 0x0A datetime, offset     (8 bytes micros + 4 bytes offset seconds)
//! 0x0B string               (u32 length + UTF-8 bytes)
//! 0x0C object               (flags, u32 count, entries)
//! ```
//!
//! `Pending` values are resolved before encoding. Shared substructure is
//! duplicated (identity is a clone-time concern, not a wire concern);
//! cyclic structure is rejected with `CyclicValue`.

use crate::error::ValueError;
use crate::object::{AccessLevel, Entry, Obj};
use crate::value::{DateTime, Number, Value};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime as ChronoDateTime, FixedOffset};
use rust_decimal::Decimal;
use std::sync::Arc;

const TAG_UNDEFINED: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT32: u8 = 0x04;
const TAG_INT64: u8 = 0x05;
const TAG_DOUBLE: u8 = 0x06;
const TAG_DECIMAL: u8 = 0x07;
const TAG_DT_NAIVE: u8 = 0x08;
const TAG_DT_UTC: u8 = 0x09;
const TAG_DT_OFFSET: u8 = 0x0A;
const TAG_STRING: u8 = 0x0B;
const TAG_OBJECT: u8 = 0x0C;

// Object flag bits.
const OBJ_CASE_INSENSITIVE: u8 = 0b0000_0001;
// Entry flag bits.
const ENTRY_HAS_KEY: u8 = 0b0000_0001;
const ENTRY_HAS_METADATA: u8 = 0b0000_1000;
// Access occupies two bits in both flag bytes.
const ACCESS_SHIFT: u8 = 1;
const ACCESS_MASK: u8 = 0b0000_0110;

fn encode_access(access: AccessLevel) -> u8 {
    let bits = match access {
        AccessLevel::Writable => 0u8,
        AccessLevel::ReadOnly => 1,
        AccessLevel::Constant => 2,
    };
    bits << ACCESS_SHIFT
}

fn decode_access(flags: u8) -> AccessLevel {
    match (flags & ACCESS_MASK) >> ACCESS_SHIFT {
        1 => AccessLevel::ReadOnly,
        2 => AccessLevel::Constant,
        _ => AccessLevel::Writable,
    }
}

/// Encodes a value into a self-describing byte string.
pub fn encode_value(value: &Value) -> Result<Bytes, ValueError> {
    let mut buf = BytesMut::new();
    write_value(&mut buf, value, &mut Vec::new())?;
    Ok(buf.freeze())
}

/// Decodes a value previously produced by [`encode_value`].
pub fn decode_value(bytes: &[u8]) -> Result<Value, ValueError> {
    let mut buf = bytes;
    let value = read_value(&mut buf)?;
    Ok(value)
}

fn write_value(
    buf: &mut BytesMut,
    value: &Value,
    visiting: &mut Vec<usize>,
) -> Result<(), ValueError> {
    match value.resolve() {
        Value::Undefined => buf.put_u8(TAG_UNDEFINED),
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Boolean(false) => buf.put_u8(TAG_FALSE),
        Value::Boolean(true) => buf.put_u8(TAG_TRUE),
        Value::Number(Number::Int32(i)) => {
            buf.put_u8(TAG_INT32);
            buf.put_i32(i);
        }
        Value::Number(Number::Int64(i)) => {
            buf.put_u8(TAG_INT64);
            buf.put_i64(i);
        }
        Value::Number(Number::Double(d)) => {
            buf.put_u8(TAG_DOUBLE);
            // Raw bits, so NaN payloads survive the round trip.
            buf.put_u64(d.to_bits());
        }
        Value::Number(Number::Decimal(d)) => {
            buf.put_u8(TAG_DECIMAL);
            buf.put_slice(&d.serialize());
        }
        Value::DateTime(DateTime::Naive(dt)) => {
            buf.put_u8(TAG_DT_NAIVE);
            buf.put_i64(dt.and_utc().timestamp_micros());
        }
        Value::DateTime(DateTime::Utc(dt)) => {
            buf.put_u8(TAG_DT_UTC);
            buf.put_i64(dt.timestamp_micros());
        }
        Value::DateTime(DateTime::Offset(dt)) => {
            buf.put_u8(TAG_DT_OFFSET);
            buf.put_i64(dt.timestamp_micros());
            buf.put_i32(dt.offset().local_minus_utc());
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            write_str(buf, &s);
        }
        Value::Object(obj) => {
            let identity = obj.identity();
            if visiting.contains(&identity) {
                return Err(ValueError::CyclicValue);
            }
            visiting.push(identity);

            buf.put_u8(TAG_OBJECT);
            let mut flags = encode_access(obj.access());
            if obj.is_case_insensitive() {
                flags |= OBJ_CASE_INSENSITIVE;
            }
            buf.put_u8(flags);

            let entries = obj.entries();
            buf.put_u32(entries.len() as u32);
            for entry in &entries {
                let mut entry_flags = encode_access(entry.access);
                if entry.key.is_some() {
                    entry_flags |= ENTRY_HAS_KEY;
                }
                if entry.metadata.is_some() {
                    entry_flags |= ENTRY_HAS_METADATA;
                }
                buf.put_u8(entry_flags);
                if let Some(key) = &entry.key {
                    write_str(buf, key);
                }
                write_value(buf, &entry.value, visiting)?;
                if let Some(metadata) = &entry.metadata {
                    write_value(buf, &Value::Object(metadata.clone()), visiting)?;
                }
            }

            visiting.pop();
        }
        Value::Pending(_) => unreachable!("resolve never returns Pending"),
    }
    Ok(())
}

fn write_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn need(buf: &impl Buf, n: usize) -> Result<(), ValueError> {
    if buf.remaining() < n {
        Err(ValueError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_value(buf: &mut &[u8]) -> Result<Value, ValueError> {
    need(buf, 1)?;
    let tag = buf.get_u8();
    Ok(match tag {
        TAG_UNDEFINED => Value::Undefined,
        TAG_NULL => Value::Null,
        TAG_FALSE => Value::Boolean(false),
        TAG_TRUE => Value::Boolean(true),
        TAG_INT32 => {
            need(buf, 4)?;
            Value::Number(Number::Int32(buf.get_i32()))
        }
        TAG_INT64 => {
            need(buf, 8)?;
            Value::Number(Number::Int64(buf.get_i64()))
        }
        TAG_DOUBLE => {
            need(buf, 8)?;
            Value::Number(Number::Double(f64::from_bits(buf.get_u64())))
        }
        TAG_DECIMAL => {
            need(buf, 16)?;
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Value::Number(Number::Decimal(Decimal::deserialize(raw)))
        }
        TAG_DT_NAIVE => {
            need(buf, 8)?;
            let micros = buf.get_i64();
            Value::DateTime(DateTime::Naive(instant_from_micros(micros)?.naive_utc()))
        }
        TAG_DT_UTC => {
            need(buf, 8)?;
            let micros = buf.get_i64();
            Value::DateTime(DateTime::Utc(instant_from_micros(micros)?))
        }
        TAG_DT_OFFSET => {
            need(buf, 12)?;
            let micros = buf.get_i64();
            let offset_secs = buf.get_i32();
            let offset = FixedOffset::east_opt(offset_secs)
                .ok_or(ValueError::InvalidOffset(offset_secs))?;
            Value::DateTime(DateTime::Offset(
                instant_from_micros(micros)?.with_timezone(&offset),
            ))
        }
        TAG_STRING => Value::String(read_str(buf)?),
        TAG_OBJECT => {
            need(buf, 5)?;
            let flags = buf.get_u8();
            let obj = if flags & OBJ_CASE_INSENSITIVE != 0 {
                Obj::case_insensitive()
            } else {
                Obj::new()
            };
            let count = buf.get_u32() as usize;
            for _ in 0..count {
                need(buf, 1)?;
                let entry_flags = buf.get_u8();
                let key = if entry_flags & ENTRY_HAS_KEY != 0 {
                    Some(read_str(buf)?)
                } else {
                    None
                };
                let value = read_value(buf)?;
                let metadata = if entry_flags & ENTRY_HAS_METADATA != 0 {
                    Some(read_value(buf)?.as_object()?)
                } else {
                    None
                };
                // The freshly decoded object is writable until frozen below.
                let _ = obj.add_entry(Entry {
                    key,
                    value,
                    access: decode_access(entry_flags),
                    metadata,
                });
            }
            match decode_access(flags) {
                AccessLevel::Writable => Value::Object(obj),
                AccessLevel::ReadOnly => Value::Object(obj.clone_readonly()),
                AccessLevel::Constant => Value::Object(obj.as_constant()),
            }
        }
        other => return Err(ValueError::UnknownTag(other)),
    })
}

fn read_str(buf: &mut &[u8]) -> Result<Arc<str>, ValueError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let (head, tail) = buf.split_at(len);
    let s = std::str::from_utf8(head)?;
    let out = Arc::from(s);
    *buf = tail;
    Ok(out)
}

fn instant_from_micros(micros: i64) -> Result<ChronoDateTime<chrono::Utc>, ValueError> {
    ChronoDateTime::from_timestamp_micros(micros).ok_or(ValueError::InvalidTimestamp(micros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn roundtrip(value: &Value) -> Value {
        let bytes = encode_value(value).unwrap();
        decode_value(&bytes).unwrap()
    }

    #[test]
    fn scalar_roundtrips() {
        for value in [
            Value::Undefined,
            Value::Null,
            Value::Boolean(true),
            Value::Boolean(false),
            Value::from(i32::MIN),
            Value::from(i64::MAX),
            Value::from(-0.0f64),
            Value::from("hello"),
            Value::from(""),
            Value::from(Decimal::MAX),
            Value::from(Decimal::MIN),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn numeric_subtype_is_preserved() {
        // Int32(1) == Int64(1) by value equality, so check the tag too.
        let decoded = roundtrip(&Value::from(1i32));
        assert!(matches!(
            decoded.as_number().unwrap(),
            Number::Int32(1)
        ));
        let decoded = roundtrip(&Value::from(1i64));
        assert!(matches!(
            decoded.as_number().unwrap(),
            Number::Int64(1)
        ));
    }

    #[test]
    fn nan_survives_but_stays_unequal() {
        let bytes = encode_value(&Value::from(f64::NAN)).unwrap();
        let decoded = decode_value(&bytes).unwrap();
        let n = decoded.as_number().unwrap();
        assert!(n.is_nan());
        assert_ne!(decoded, Value::from(f64::NAN));
    }

    #[test]
    fn datetime_kind_is_preserved() {
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let offset = utc.with_timezone(&FixedOffset::east_opt(5 * 3600).unwrap());
        let naive = utc.naive_utc();

        assert!(matches!(
            roundtrip(&Value::from(utc)).as_datetime().unwrap(),
            DateTime::Utc(dt) if dt == utc
        ));
        assert!(matches!(
            roundtrip(&Value::from(offset)).as_datetime().unwrap(),
            DateTime::Offset(dt) if dt == offset && dt.offset().local_minus_utc() == 5 * 3600
        ));
        assert!(matches!(
            roundtrip(&Value::from(naive)).as_datetime().unwrap(),
            DateTime::Naive(dt) if dt == naive
        ));
    }

    #[test]
    fn object_roundtrip_with_metadata_and_access() {
        let meta = Obj::new();
        meta.add("source", "doc").unwrap();

        let obj = Obj::case_insensitive();
        obj.add_entry(
            Entry::new("pinned", Value::from(7i32))
                .with_access(AccessLevel::ReadOnly)
                .with_metadata(meta),
        )
        .unwrap();
        obj.push(Value::from("slot")).unwrap();

        let decoded = roundtrip(&Value::Object(obj.clone()));
        let decoded_obj = decoded.as_object().unwrap();
        assert!(decoded_obj.is_case_insensitive());
        assert_eq!(decoded_obj.get("PINNED"), Value::from(7i32));

        let entry = decoded_obj.get_entry("pinned").unwrap();
        assert_eq!(entry.access, AccessLevel::ReadOnly);
        assert_eq!(
            entry.metadata.unwrap().get("source"),
            Value::from("doc")
        );
        assert_eq!(decoded, Value::Object(obj));
    }

    #[test]
    fn readonly_object_stays_readonly_after_decode() {
        let obj = Obj::new();
        obj.add("a", 1i32).unwrap();
        let frozen = obj.clone_readonly();

        let decoded = roundtrip(&Value::Object(frozen)).as_object().unwrap();
        assert!(decoded.set("a", 2i32).is_err());
    }

    #[test]
    fn cyclic_object_is_rejected() {
        let a = Obj::new();
        a.add("self", a.clone()).unwrap();
        assert!(matches!(
            encode_value(&Value::Object(a)),
            Err(ValueError::CyclicValue)
        ));
    }

    #[test]
    fn pending_resolves_before_encoding() {
        let lazy = Value::Pending(crate::value::Lazy::new(|| Value::from(9i32)));
        assert_eq!(roundtrip(&lazy), Value::from(9i32));
    }

    #[test]
    fn truncated_input_reports_eof() {
        let bytes = encode_value(&Value::from("hello")).unwrap();
        assert!(matches!(
            decode_value(&bytes[..bytes.len() - 1]),
            Err(ValueError::UnexpectedEof)
        ));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            decode_value(&[0x7F]),
            Err(ValueError::UnknownTag(0x7F))
        ));
    }

    proptest! {
        #[test]
        fn prop_number_roundtrip(i in any::<i64>(), d in any::<f64>()) {
            let int_value = Value::from(i);
            prop_assert_eq!(roundtrip(&int_value), int_value);

            let bytes = encode_value(&Value::from(d)).unwrap();
            let decoded = decode_value(&bytes).unwrap();
            let n = decoded.as_number().unwrap();
            prop_assert_eq!(n.to_f64().to_bits(), d.to_bits());
        }

        #[test]
        fn prop_string_roundtrip(s in ".*") {
            let value = Value::from(s.as_str());
            prop_assert_eq!(roundtrip(&value), value);
        }
    }
}
