//! The tagged runtime value type.
//!
//! `Value` is immutable and cheap to copy: strings are shared `Arc<str>`,
//! objects are handles onto shared storage, and everything else is a small
//! scalar. A value may also be `Pending` - a deferred producer that every
//! accessor transparently resolves before inspecting the tag.

use crate::error::ValueError;
use crate::object::Obj;
use chrono::{DateTime as ChronoDateTime, FixedOffset, NaiveDateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A dynamically typed runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(Number),
    DateTime(DateTime),
    String(Arc<str>),
    Object(Obj),
    /// A deferred computation of the real value.
    Pending(Lazy),
}

/// Numeric sub-variants preserving exact integer vs. floating semantics.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int32(i32),
    Int64(i64),
    Double(f64),
    Decimal(Decimal),
}

/// A date/time instant tagged with its offset awareness.
#[derive(Debug, Clone, Copy)]
pub enum DateTime {
    /// No offset information (wall-clock time).
    Naive(NaiveDateTime),
    Utc(ChronoDateTime<Utc>),
    Offset(ChronoDateTime<FixedOffset>),
}

/// A producer for a deferred value.
pub trait LazyValue: Send + Sync {
    fn produce(&self) -> Value;
}

/// Shared handle to a lazy producer.
#[derive(Clone)]
pub struct Lazy(Arc<dyn LazyValue>);

impl Lazy {
    pub fn new(producer: impl LazyValue + 'static) -> Self {
        Self(Arc::new(producer))
    }

    pub fn produce(&self) -> Value {
        self.0.produce()
    }
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Lazy(..)")
    }
}

impl<F> LazyValue for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn produce(&self) -> Value {
        self()
    }
}

impl Number {
    pub fn is_nan(&self) -> bool {
        matches!(self, Number::Double(d) if d.is_nan())
    }

    /// Returns the exact i64 value if this number is mathematically an
    /// integer representable in 64 bits.
    pub fn to_i64_exact(&self) -> Option<i64> {
        match self {
            Number::Int32(i) => Some(*i as i64),
            Number::Int64(i) => Some(*i),
            Number::Double(d) => {
                let i = *d as i64;
                if (i as f64) == *d {
                    Some(i)
                } else {
                    None
                }
            }
            Number::Decimal(d) => {
                if d.fract().is_zero() {
                    d.to_i64()
                } else {
                    None
                }
            }
        }
    }

    /// Converts to `Decimal`, failing for non-finite or out-of-range doubles.
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Number::Int32(i) => Some(Decimal::from(*i)),
            Number::Int64(i) => Some(Decimal::from(*i)),
            Number::Double(d) => Decimal::from_f64(*d),
            Number::Decimal(d) => Some(*d),
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            Number::Int32(i) => *i as f64,
            Number::Int64(i) => *i as f64,
            Number::Double(d) => *d,
            Number::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
        }
    }

    /// Returns `Some(1)` for +inf, `Some(-1)` for -inf.
    fn infinity_sign(&self) -> Option<i8> {
        match self {
            Number::Double(d) if d.is_infinite() => {
                Some(if *d > 0.0 { 1 } else { -1 })
            }
            _ => None,
        }
    }

    /// Compares across sub-variants through the widest common
    /// representation. Integer pairs compare as i64; anything involving a
    /// `Decimal` compares as `Decimal`; doubles outside the decimal range
    /// (including infinities) fall back to f64 ordering. NaN never
    /// compares.
    pub fn compare(&self, other: &Number) -> Option<Ordering> {
        if self.is_nan() || other.is_nan() {
            return None;
        }

        if let (Number::Int32(_) | Number::Int64(_), Number::Int32(_) | Number::Int64(_)) =
            (self, other)
        {
            // to_i64_exact is infallible for integer variants
            return Some(self.to_i64_exact()?.cmp(&other.to_i64_exact()?));
        }

        match (self.infinity_sign(), other.infinity_sign()) {
            (Some(a), Some(b)) => return Some(a.cmp(&b)),
            (Some(a), None) => {
                return Some(if a > 0 { Ordering::Greater } else { Ordering::Less })
            }
            (None, Some(b)) => {
                return Some(if b > 0 { Ordering::Less } else { Ordering::Greater })
            }
            (None, None) => {}
        }

        match (self.to_decimal(), other.to_decimal()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            // Finite but outside the decimal range.
            _ => self.to_f64().partial_cmp(&other.to_f64()),
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Canonical form mirrors `compare`: exact i64 first, then decimal,
        // then raw bits. NaN compares unequal to everything, so its hash
        // only needs to be deterministic.
        if self.is_nan() {
            state.write_u8(0xFF);
            return;
        }
        if let Some(i) = self.to_i64_exact() {
            state.write_u8(0);
            i.hash(state);
        } else if let Some(d) = self.to_decimal() {
            state.write_u8(1);
            d.normalize().serialize().hash(state);
        } else {
            state.write_u8(2);
            self.to_f64().to_bits().hash(state);
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int32(i) => write!(f, "{i}"),
            Number::Int64(i) => write!(f, "{i}"),
            Number::Double(d) => write!(f, "{d}"),
            Number::Decimal(d) => write!(f, "{d}"),
        }
    }
}

impl DateTime {
    /// The absolute instant, if this value carries offset information.
    pub fn to_utc_instant(&self) -> Option<ChronoDateTime<Utc>> {
        match self {
            DateTime::Naive(_) => None,
            DateTime::Utc(dt) => Some(*dt),
            DateTime::Offset(dt) => Some(dt.with_timezone(&Utc)),
        }
    }
}

impl PartialEq for DateTime {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DateTime::Naive(a), DateTime::Naive(b)) => a == b,
            _ => match (self.to_utc_instant(), other.to_utc_instant()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Hash for DateTime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.to_utc_instant() {
            Some(instant) => {
                state.write_u8(0);
                instant.timestamp_micros().hash(state);
            }
            None => {
                state.write_u8(1);
                if let DateTime::Naive(dt) = self {
                    dt.and_utc().timestamp_micros().hash(state);
                }
            }
        }
    }
}

impl Value {
    /// Resolves any number of `Pending` layers to a concrete value.
    pub fn resolve(&self) -> Value {
        let mut current = self.clone();
        while let Value::Pending(lazy) = current {
            current = lazy.produce();
        }
        current
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::DateTime(_) => "datetime",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Pending(_) => "pending",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.resolve(), Value::Undefined)
    }

    /// Truthiness for guard-style checks: undefined/null are false,
    /// numbers are false when zero or NaN, strings when empty.
    pub fn truthy(&self) -> bool {
        match self.resolve() {
            Value::Undefined | Value::Null => false,
            Value::Boolean(b) => b,
            Value::Number(n) => !n.is_nan() && n != Number::Int32(0),
            Value::DateTime(_) => true,
            Value::String(s) => !s.is_empty(),
            Value::Object(_) => true,
            Value::Pending(_) => unreachable!("resolve never returns Pending"),
        }
    }

    pub fn as_boolean(&self) -> Result<bool, ValueError> {
        match self.resolve() {
            Value::Boolean(b) => Ok(b),
            other => Err(ValueError::TypeMismatch {
                expected: "boolean",
                actual: other.type_name(),
            }),
        }
    }

    pub fn as_number(&self) -> Result<Number, ValueError> {
        match self.resolve() {
            Value::Number(n) => Ok(n),
            other => Err(ValueError::TypeMismatch {
                expected: "number",
                actual: other.type_name(),
            }),
        }
    }

    pub fn as_string(&self) -> Result<Arc<str>, ValueError> {
        match self.resolve() {
            Value::String(s) => Ok(s),
            other => Err(ValueError::TypeMismatch {
                expected: "string",
                actual: other.type_name(),
            }),
        }
    }

    pub fn as_datetime(&self) -> Result<DateTime, ValueError> {
        match self.resolve() {
            Value::DateTime(dt) => Ok(dt),
            other => Err(ValueError::TypeMismatch {
                expected: "datetime",
                actual: other.type_name(),
            }),
        }
    }

    pub fn as_object(&self) -> Result<Obj, ValueError> {
        match self.resolve() {
            Value::Object(o) => Ok(o),
            other => Err(ValueError::TypeMismatch {
                expected: "object",
                actual: other.type_name(),
            }),
        }
    }

    /// Narrows to an object and returns its entry values in order.
    pub fn as_list(&self) -> Result<Vec<Value>, ValueError> {
        Ok(self.as_object()?.values())
    }

    pub fn as_boolean_or_default(&self) -> bool {
        self.as_boolean().unwrap_or(false)
    }

    pub fn as_number_or_default(&self) -> Number {
        self.as_number().unwrap_or(Number::Int32(0))
    }

    pub fn as_string_or_default(&self) -> Arc<str> {
        self.as_string().unwrap_or_else(|_| Arc::from(""))
    }

    pub fn as_object_or_default(&self) -> Obj {
        self.as_object().unwrap_or_default()
    }

    pub fn as_list_or_default(&self) -> Vec<Value> {
        self.as_list().unwrap_or_default()
    }

    /// Renders the value as display text (used by `log` actions).
    pub fn to_display_string(&self) -> String {
        match self.resolve() {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::DateTime(DateTime::Naive(dt)) => dt.to_string(),
            Value::DateTime(DateTime::Utc(dt)) => dt.to_rfc3339(),
            Value::DateTime(DateTime::Offset(dt)) => dt.to_rfc3339(),
            Value::String(s) => s.to_string(),
            Value::Object(o) => format!("[object: {} entries]", o.len()),
            Value::Pending(_) => unreachable!("resolve never returns Pending"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self.resolve(), other.resolve()) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.resolve() {
            Value::Undefined => state.write_u8(0),
            Value::Null => state.write_u8(1),
            Value::Boolean(b) => {
                state.write_u8(2);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(3);
                n.hash(state);
            }
            Value::DateTime(dt) => {
                state.write_u8(4);
                dt.hash(state);
            }
            Value::String(s) => {
                state.write_u8(5);
                s.hash(state);
            }
            Value::Object(o) => {
                // Keys only: hashing entry values could recurse through a
                // cycle. Equal objects share their key sequence, so
                // eq => same hash still holds.
                state.write_u8(6);
                o.len().hash(state);
                for key in o.keys().into_iter().flatten() {
                    key.hash(state);
                }
            }
            Value::Pending(_) => unreachable!("resolve never returns Pending"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Number(Number::Int32(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Number(Number::Int64(i))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Number(Number::Double(d))
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Number(Number::Decimal(d))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<Arc<str>> for Value {
    fn from(s: Arc<str>) -> Self {
        Value::String(s)
    }
}

impl From<Obj> for Value {
    fn from(o: Obj) -> Self {
        Value::Object(o)
    }
}

impl From<ChronoDateTime<Utc>> for Value {
    fn from(dt: ChronoDateTime<Utc>) -> Self {
        Value::DateTime(DateTime::Utc(dt))
    }
}

impl From<ChronoDateTime<FixedOffset>> for Value {
    fn from(dt: ChronoDateTime<FixedOffset>) -> Self {
        Value::DateTime(DateTime::Offset(dt))
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(DateTime::Naive(dt))
    }
}
