use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

// ============================================================================
// Property Values
// ============================================================================
//
// One tagged union covers every persistable field kind. Date-times are held
// in UTC; offsets survive only in `DateTimeOffset`. Complex objects and
// value objects are kept in their string encodings and compare by them.
//
// ============================================================================

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Present but null. Absence is modelled by the key not being in the bag.
    Null,
    String(String),
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Guid(Uuid),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
    DateTimeOffset(DateTime<FixedOffset>),
    /// Enumeration member stored by name.
    Enum(String),
    /// Opaque object in its JSON encoding.
    Complex(String),
    /// Value object in its delimited dehydrated form.
    ValueObject(String),
}

/// The declared kind of a property, used for zero values and coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    String,
    Boolean,
    Int32,
    Int64,
    Double,
    Guid,
    Binary,
    DateTime,
    DateTimeOffset,
    Enum,
    Complex,
    ValueObject,
}

impl ValueKind {
    /// Zero value for the kind. Reference-like kinds default to null.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Boolean => Value::Boolean(false),
            ValueKind::Int32 => Value::Int32(0),
            ValueKind::Int64 => Value::Int64(0),
            ValueKind::Double => Value::Double(0.0),
            ValueKind::Guid => Value::Guid(Uuid::nil()),
            ValueKind::DateTime => Value::DateTime(DateTime::<Utc>::UNIX_EPOCH),
            ValueKind::DateTimeOffset => {
                Value::DateTimeOffset(DateTime::<Utc>::UNIX_EPOCH.fixed_offset())
            }
            ValueKind::String
            | ValueKind::Binary
            | ValueKind::Enum
            | ValueKind::Complex
            | ValueKind::ValueObject => Value::Null,
        }
    }
}

impl Value {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(ValueKind::String),
            Value::Boolean(_) => Some(ValueKind::Boolean),
            Value::Int32(_) => Some(ValueKind::Int32),
            Value::Int64(_) => Some(ValueKind::Int64),
            Value::Double(_) => Some(ValueKind::Double),
            Value::Guid(_) => Some(ValueKind::Guid),
            Value::Binary(_) => Some(ValueKind::Binary),
            Value::DateTime(_) => Some(ValueKind::DateTime),
            Value::DateTimeOffset(_) => Some(ValueKind::DateTimeOffset),
            Value::Enum(_) => Some(ValueKind::Enum),
            Value::Complex(_) => Some(ValueKind::Complex),
            Value::ValueObject(_) => Some(ValueKind::ValueObject),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn enumeration(name: impl Into<String>) -> Self {
        Value::Enum(name.into())
    }

    /// Encodes an arbitrary serializable object as a complex value.
    pub fn complex<T: Serialize>(object: &T) -> StoreResult<Self> {
        Ok(Value::Complex(serde_json::to_string(object)?))
    }

    /// Decodes a complex value back into its object form.
    pub fn to_complex<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        match self {
            Value::Null => Ok(None),
            Value::Complex(json) => Ok(Some(serde_json::from_str(json)?)),
            other => Err(StoreError::InvalidArgument(format!(
                "expected a complex value, found {:?}",
                other.kind()
            ))),
        }
    }

    /// Text view for string-like kinds.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Enum(s) | Value::Complex(s) | Value::ValueObject(s) => {
                Some(s)
            }
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Value::Guid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(v) => Some(v),
            _ => None,
        }
    }

    /// Instant view shared by both date-time kinds.
    pub fn as_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(v) => Some(*v),
            Value::DateTimeOffset(v) => Some(v.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Orders two values of compatible kinds.
    ///
    /// Numbers compare numerically across widths, date-times compare by
    /// instant regardless of offset, string-like kinds compare ordinally.
    /// Returns `None` for null operands and for incompatible kinds.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Guid(a), Value::Guid(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => {
                if let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) {
                    return Some(a.cmp(&b));
                }
                if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
                    return a.partial_cmp(&b);
                }
                if let (Some(a), Some(b)) = (self.as_instant(), other.as_instant()) {
                    return Some(a.cmp(&b));
                }
                if let (Some(a), Some(b)) = (self.as_text(), other.as_text()) {
                    return Some(a.cmp(b));
                }
                None
            }
        }
    }

    /// Value equality, treating equal instants and equal numbers as equal.
    pub fn value_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Adapts a stored value to the declared kind where a lossless
    /// conversion exists; otherwise returns the value unchanged.
    pub fn coerce(self, kind: ValueKind) -> Value {
        match (self, kind) {
            (Value::Int32(v), ValueKind::Int64) => Value::Int64(v as i64),
            (Value::Int64(v), ValueKind::Int32) if i32::try_from(v).is_ok() => {
                Value::Int32(v as i32)
            }
            (Value::Int32(v), ValueKind::Double) => Value::Double(v as f64),
            (Value::Int64(v), ValueKind::Double) => Value::Double(v as f64),
            (Value::DateTimeOffset(v), ValueKind::DateTime) => Value::DateTime(v.with_timezone(&Utc)),
            (Value::DateTime(v), ValueKind::DateTimeOffset) => Value::DateTimeOffset(v.fixed_offset()),
            (Value::String(v), ValueKind::Enum) => Value::Enum(v),
            (Value::String(v), ValueKind::Guid) => match Uuid::parse_str(&v) {
                Ok(guid) => Value::Guid(guid),
                Err(_) => Value::String(v),
            },
            (value, _) => value,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Guid(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Binary(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<DateTime<Local>> for Value {
    fn from(v: DateTime<Local>) -> Self {
        Value::DateTime(v.with_timezone(&Utc))
    }
}

/// Naive date-times carry no zone and are taken to be UTC already.
impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(Utc.from_utc_datetime(&v))
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(v: DateTime<FixedOffset>) -> Self {
        Value::DateTimeOffset(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

// ============================================================================
// Three-state optional
// ============================================================================

/// A field that is absent, present-but-null, or present with a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Optional<T> {
    Absent,
    Null,
    Value(T),
}

impl<T> Optional<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Optional::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Optional::Null)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Optional::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Optional<U> {
        match self {
            Optional::Absent => Optional::Absent,
            Optional::Null => Optional::Null,
            Optional::Value(v) => Optional::Value(f(v)),
        }
    }
}

/// `None` means present-but-null; absence must be stated explicitly.
impl<T> From<Option<T>> for Optional<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => Optional::Value(inner),
            None => Optional::Null,
        }
    }
}
