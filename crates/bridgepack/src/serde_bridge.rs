//! Conversions between [`Value`] and arbitrary serde types.
//!
//! These go through untagged JSON: a struct becomes a plain map, and a map
//! key that happens to be `__type__` is data, not a tag. Non-finite floats
//! inside a serde type are lost by `serde_json` (they serialize as null), so
//! callers that need them should build a [`Value`] directly.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Number;

use crate::Value;
use crate::Wire;
use crate::error::Error;
use crate::error::Result;

/// Converts any serializable host value into a [`Value`].
///
/// # Errors
/// Returns [`Error::Encode`] naming `T` when serde rejects the shape, for
/// example a map whose keys are not strings.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let wire = serde_json::to_value(value)
        .map_err(|e| Error::encode(std::any::type_name::<T>(), e.to_string()))?;
    from_plain(wire)
}

/// Converts a [`Value`] into any deserializable host type.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let wire = to_plain(value)?;
    serde_json::from_value(wire).map_err(|e| {
        Error::decode(format!("cannot read {} as {}: {}", value.type_name(), std::any::type_name::<T>(), e))
    })
}

fn from_plain(wire: Wire) -> Result<Value> {
    Ok(match wire {
        Wire::Null => Value::Null,
        Wire::Bool(b) => Value::Bool(b),
        Wire::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(
                n.as_f64()
                    .ok_or_else(|| Error::encode("number", format!("{} is out of range", n)))?,
            ),
        },
        Wire::String(s) => Value::Str(s),
        Wire::Array(items) => Value::List(items.into_iter().map(from_plain).collect::<Result<_>>()?),
        Wire::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, from_plain(v)?)))
                .collect::<Result<_>>()?,
        ),
    })
}

fn to_plain(value: &Value) -> Result<Wire> {
    Ok(match value {
        Value::Null => Wire::Null,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::from(*i),
        Value::Float(f) => plain_float(*f)?,
        Value::Str(s) => Wire::String(s.clone()),
        Value::Bytes(data) => Wire::Array(data.iter().map(|b| Wire::from(*b)).collect()),
        Value::Complex { re, im } => Wire::Array(vec![plain_float(*re)?, plain_float(*im)?]),
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
            Wire::Array(items.iter().map(to_plain).collect::<Result<_>>()?)
        }
        Value::Map(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), to_plain(v)?);
            }
            Wire::Object(out)
        }
        Value::Date(d) => Wire::String(d.to_string()),
        Value::Time(t) => Wire::String(t.to_string()),
        Value::DateTime(dt) => Wire::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::DateTimeTz(dt) => Wire::String(dt.to_rfc3339()),
        Value::Ref(h) => h.to_wire(),
        Value::StreamRef(h) => h.to_wire(),
    })
}

fn plain_float(f: f64) -> Result<Wire> {
    Number::from_f64(f)
        .map(Wire::Number)
        .ok_or_else(|| Error::decode(format!("{} has no plain JSON form", f)))
}
