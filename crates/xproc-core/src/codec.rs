//! Marshalling codec for call arguments and return values.
//!
//! Values are written back to back with no per-field tags; the declared
//! [`WireType`] sequence of a method is the schema. All integers are big-endian.
//!
//! ```text
//! bool       [u8: 0 | 1]
//! i32        [i32]
//! i64        [i64]
//! f64        [u64: IEEE-754 bits]
//! timestamp  [i64: milliseconds since the Unix epoch]
//! string     [u32: len][UTF-8 bytes of len]     len == 0xFFFF_FFFF means null
//! string[]   [u32: count][string]*count         elements are never null
//! i32[]      [u32: count][i32]*count
//! void       (nothing)
//! ```
//!
//! Timestamps with a sub-millisecond part are rejected on encode so that
//! decoding always gives back the value that was encoded.

use crate::descriptor::MethodDescriptor;
use crate::error::{Result, XprocError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length prefix reserved for a null string.
pub const NULL_STRING_LEN: u32 = 0xFFFF_FFFF;

/// Declared type of an argument or return slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    /// No value. Only valid as a return type.
    Void,
    Bool,
    I32,
    I64,
    F64,
    /// Millisecond-precision UTC timestamp.
    Timestamp,
    /// Non-null string.
    String,
    /// String that may be null.
    NullableString,
    /// Sequence of non-null strings.
    StringArray,
    I32Array,
}

impl WireType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireType::Void => "void",
            WireType::Bool => "bool",
            WireType::I32 => "i32",
            WireType::I64 => "i64",
            WireType::F64 => "f64",
            WireType::Timestamp => "timestamp",
            WireType::String => "string",
            WireType::NullableString => "string?",
            WireType::StringArray => "string[]",
            WireType::I32Array => "i32[]",
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, WireType::NullableString)
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A marshallable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Timestamp(DateTime<Utc>),
    /// `None` is the null string; only valid in a `NullableString` slot.
    Str(Option<String>),
    StringArray(Vec<String>),
    I32Array(Vec<i32>),
}

impl Value {
    /// Human-readable kind, used in mismatch messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Timestamp(_) => "timestamp",
            Value::Str(Some(_)) => "string",
            Value::Str(None) => "null string",
            Value::StringArray(_) => "string[]",
            Value::I32Array(_) => "i32[]",
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Str(Some(s.into()))
    }

    pub fn null_string() -> Self {
        Value::Str(None)
    }

    /// Timestamp from milliseconds since the Unix epoch.
    pub fn timestamp_millis(millis: i64) -> Result<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .map(Value::Timestamp)
            .ok_or_else(|| XprocError::malformed(format!("timestamp {} out of range", millis)))
    }

    pub fn into_unit(self) -> Result<()> {
        match self {
            Value::Void => Ok(()),
            other => Err(mismatch("void", &other)),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(v),
            other => Err(mismatch("bool", &other)),
        }
    }

    pub fn into_i32(self) -> Result<i32> {
        match self {
            Value::I32(v) => Ok(v),
            other => Err(mismatch("i32", &other)),
        }
    }

    pub fn into_i64(self) -> Result<i64> {
        match self {
            Value::I64(v) => Ok(v),
            other => Err(mismatch("i64", &other)),
        }
    }

    pub fn into_f64(self) -> Result<f64> {
        match self {
            Value::F64(v) => Ok(v),
            other => Err(mismatch("f64", &other)),
        }
    }

    pub fn into_timestamp(self) -> Result<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Ok(v),
            other => Err(mismatch("timestamp", &other)),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            Value::Str(Some(v)) => Ok(v),
            other => Err(mismatch("string", &other)),
        }
    }

    pub fn into_nullable_string(self) -> Result<Option<String>> {
        match self {
            Value::Str(v) => Ok(v),
            other => Err(mismatch("string?", &other)),
        }
    }

    pub fn into_string_array(self) -> Result<Vec<String>> {
        match self {
            Value::StringArray(v) => Ok(v),
            other => Err(mismatch("string[]", &other)),
        }
    }

    pub fn into_i32_array(self) -> Result<Vec<i32>> {
        match self {
            Value::I32Array(v) => Ok(v),
            other => Err(mismatch("i32[]", &other)),
        }
    }
}

fn mismatch(expected: &str, actual: &Value) -> XprocError {
    XprocError::malformed(format!("expected {}, got {}", expected, actual.kind()))
}

/// Encode `values` against the declared `types`, in order.
pub fn encode(values: &[Value], types: &[WireType]) -> Result<Bytes> {
    if values.len() != types.len() {
        return Err(XprocError::malformed(format!(
            "expected {} values, got {}",
            types.len(),
            values.len()
        )));
    }

    let mut buf = BytesMut::new();
    for (index, (value, ty)) in values.iter().zip(types).enumerate() {
        encode_value(&mut buf, value, *ty).map_err(|e| at_slot(index, e))?;
    }
    Ok(buf.freeze())
}

/// Decode exactly `types.len()` values from `payload`.
///
/// Fails on short reads and on trailing bytes; never reads past the slice.
pub fn decode(payload: &[u8], types: &[WireType]) -> Result<Vec<Value>> {
    let mut cursor = payload;
    let mut values = Vec::with_capacity(types.len());
    for (index, ty) in types.iter().enumerate() {
        let value = decode_value(&mut cursor, *ty).map_err(|e| at_slot(index, e))?;
        values.push(value);
    }

    if cursor.has_remaining() {
        return Err(XprocError::malformed(format!(
            "{} trailing bytes after {} values",
            cursor.remaining(),
            types.len()
        )));
    }
    Ok(values)
}

/// Encode call arguments for `method`.
pub fn encode_arguments(method: &MethodDescriptor, args: &[Value]) -> Result<Bytes> {
    encode(args, method.argument_types())
}

/// Decode call arguments for `method`.
pub fn decode_arguments(method: &MethodDescriptor, payload: &[u8]) -> Result<Vec<Value>> {
    decode(payload, method.argument_types())
}

/// Encode the return value of `method`.
pub fn encode_return(method: &MethodDescriptor, value: &Value) -> Result<Bytes> {
    encode(std::slice::from_ref(value), std::slice::from_ref(&method.return_type()))
}

/// Decode the return value of `method`.
pub fn decode_return(method: &MethodDescriptor, payload: &[u8]) -> Result<Value> {
    let mut values = decode(payload, std::slice::from_ref(&method.return_type()))?;
    values
        .pop()
        .ok_or_else(|| XprocError::malformed("missing return value"))
}

/// Write a nullable string with its length prefix.
pub fn put_string(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        None => buf.put_u32(NULL_STRING_LEN),
        Some(s) => {
            if s.len() >= NULL_STRING_LEN as usize {
                return Err(XprocError::malformed(format!(
                    "string of {} bytes is too long to encode",
                    s.len()
                )));
            }
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

/// Read a nullable string written by [`put_string`].
pub fn get_string(cursor: &mut &[u8]) -> Result<Option<String>> {
    require(cursor, 4, "string length")?;
    let len = cursor.get_u32();
    if len == NULL_STRING_LEN {
        return Ok(None);
    }

    let len = len as usize;
    require(cursor, len, "string bytes")?;
    let bytes = cursor[..len].to_vec();
    cursor.advance(len);
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| XprocError::malformed("invalid UTF-8 in string"))
}

fn encode_value(buf: &mut BytesMut, value: &Value, ty: WireType) -> Result<()> {
    match (ty, value) {
        (WireType::Void, Value::Void) => {}
        (WireType::Bool, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
        (WireType::I32, Value::I32(v)) => buf.put_i32(*v),
        (WireType::I64, Value::I64(v)) => buf.put_i64(*v),
        (WireType::F64, Value::F64(v)) => buf.put_f64(*v),
        (WireType::Timestamp, Value::Timestamp(v)) => {
            if v.timestamp_subsec_nanos() % 1_000_000 != 0 {
                return Err(XprocError::malformed(format!(
                    "timestamp {} is finer than a millisecond",
                    v.to_rfc3339()
                )));
            }
            buf.put_i64(v.timestamp_millis())
        }
        (WireType::String | WireType::NullableString, Value::Str(Some(s))) => {
            put_string(buf, Some(s))?
        }
        (WireType::NullableString, Value::Str(None)) => put_string(buf, None)?,
        (WireType::StringArray, Value::StringArray(items)) => {
            put_count(buf, items.len())?;
            for item in items {
                put_string(buf, Some(item))?;
            }
        }
        (WireType::I32Array, Value::I32Array(items)) => {
            put_count(buf, items.len())?;
            for item in items {
                buf.put_i32(*item);
            }
        }
        (ty, value) => {
            return Err(XprocError::malformed(format!(
                "expected {}, got {}",
                ty,
                value.kind()
            )))
        }
    }
    Ok(())
}

fn decode_value(cursor: &mut &[u8], ty: WireType) -> Result<Value> {
    let value = match ty {
        WireType::Void => Value::Void,
        WireType::Bool => {
            require(cursor, 1, "bool")?;
            match cursor.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(XprocError::malformed(format!("invalid bool byte {}", other))),
            }
        }
        WireType::I32 => {
            require(cursor, 4, "i32")?;
            Value::I32(cursor.get_i32())
        }
        WireType::I64 => {
            require(cursor, 8, "i64")?;
            Value::I64(cursor.get_i64())
        }
        WireType::F64 => {
            require(cursor, 8, "f64")?;
            Value::F64(cursor.get_f64())
        }
        WireType::Timestamp => {
            require(cursor, 8, "timestamp")?;
            Value::timestamp_millis(cursor.get_i64())?
        }
        WireType::String => match get_string(cursor)? {
            Some(s) => Value::Str(Some(s)),
            None => return Err(XprocError::malformed("null in non-null string slot")),
        },
        WireType::NullableString => Value::Str(get_string(cursor)?),
        WireType::StringArray => {
            let count = get_count(cursor, "string[]")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                match get_string(cursor)? {
                    Some(s) => items.push(s),
                    None => return Err(XprocError::malformed("null element in string[]")),
                }
            }
            Value::StringArray(items)
        }
        WireType::I32Array => {
            let count = get_count(cursor, "i32[]")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.get_i32());
            }
            Value::I32Array(items)
        }
    };
    Ok(value)
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = u32::try_from(count)
        .map_err(|_| XprocError::malformed(format!("array of {} elements is too long", count)))?;
    buf.put_u32(count);
    Ok(())
}

/// Read an element count. Every element takes at least four bytes, so a
/// count the rest of the payload can't hold is rejected before allocating.
fn get_count(cursor: &mut &[u8], what: &str) -> Result<usize> {
    require(cursor, 4, what)?;
    let count = cursor.get_u32() as usize;
    require(cursor, count.saturating_mul(4), what)?;
    Ok(count)
}

fn require(cursor: &[u8], needed: usize, what: &str) -> Result<()> {
    if cursor.len() < needed {
        return Err(XprocError::malformed(format!(
            "truncated {}: need {} bytes, {} left",
            what,
            needed,
            cursor.len()
        )));
    }
    Ok(())
}

fn at_slot(index: usize, err: XprocError) -> XprocError {
    match err {
        XprocError::MalformedPayload { message } => {
            XprocError::malformed(format!("slot {}: {}", index, message))
        }
        other => other,
    }
}
