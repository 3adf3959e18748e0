//! Conversions between command-line text, wire values and JSON output.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use xproc::{Value, WireType};

/// Parse one command-line argument for a slot of type `ty`.
///
/// `null` is accepted for nullable strings. Timestamps take RFC 3339 or
/// milliseconds since the Unix epoch. Arrays are JSON arrays.
pub fn parse_argument(raw: &str, ty: WireType) -> Result<Value> {
    let value = match ty {
        WireType::Void => bail!("void is not an argument type"),
        WireType::Bool => Value::Bool(raw.parse().with_context(|| format!("not a bool: {}", raw))?),
        WireType::I32 => Value::I32(raw.parse().with_context(|| format!("not an i32: {}", raw))?),
        WireType::I64 => Value::I64(raw.parse().with_context(|| format!("not an i64: {}", raw))?),
        WireType::F64 => Value::F64(raw.parse().with_context(|| format!("not an f64: {}", raw))?),
        WireType::Timestamp => Value::Timestamp(parse_timestamp(raw)?),
        WireType::String => Value::string(raw),
        WireType::NullableString if raw == "null" => Value::null_string(),
        WireType::NullableString => Value::string(raw),
        WireType::StringArray => Value::StringArray(
            serde_json::from_str(raw).with_context(|| format!("not a string array: {}", raw))?,
        ),
        WireType::I32Array => Value::I32Array(
            serde_json::from_str(raw).with_context(|| format!("not an i32 array: {}", raw))?,
        ),
    };
    Ok(value)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| anyhow!("timestamp out of range: {}", raw));
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("not a timestamp: {}", raw))?
        .with_timezone(&Utc))
}

/// JSON rendering of a returned value.
pub fn render(value: &Value) -> serde_json::Value {
    match value {
        Value::Void => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::I32(n) => json!(n),
        Value::I64(n) => json!(n),
        Value::F64(n) => json!(n),
        Value::Timestamp(ts) => json!(ts.to_rfc3339()),
        Value::Str(s) => json!(s),
        Value::StringArray(items) => json!(items),
        Value::I32Array(items) => json!(items),
    }
}
