//! # Value Decoding
//!
//! Lifts a wire value back into a [`Value`].
//!
//! ## Invariants
//! - Known tags with a malformed body are errors, never silently passed through.
//! - Unknown tags decode as plain maps so newer peers can add forms.
//! - Legacy spellings are accepted: top-level `infinity` / `neg_infinity` /
//!   `nan` tags, a `value` key in place of `elements`, and `frozenset`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::NaiveTime;
use serde_json::Map;

use crate::SCHEMA_KEY;
use crate::SCHEMA_VERSION;
use crate::TYPE_KEY;
use crate::Value;
use crate::Wire;
use crate::error::Error;
use crate::error::Result;
use crate::handle::Handle;
use crate::handle::StreamHandle;

/// Decodes a wire value.
pub fn decode(wire: &Wire) -> Result<Value> {
    match wire {
        Wire::Null => Ok(Value::Null),
        Wire::Bool(b) => Ok(Value::Bool(*b)),
        Wire::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if n.is_u64() {
                Err(Error::decode(format!("integer {} does not fit in i64", n)))
            } else {
                n.as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| Error::decode(format!("unrepresentable number {}", n)))
            }
        }
        Wire::String(s) => Ok(Value::Str(s.clone())),
        Wire::Array(items) => decode_all(items).map(Value::List),
        Wire::Object(map) => match map.get(TYPE_KEY) {
            Some(Wire::String(tag)) => decode_tagged(tag, map),
            _ => decode_plain_map(map),
        },
    }
}

/// Decodes a list of wire values.
pub fn decode_all(items: &[Wire]) -> Result<Vec<Value>> {
    items.iter().map(decode).collect()
}

fn decode_plain_map(map: &Map<String, Wire>) -> Result<Value> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), decode(v)?)))
        .collect::<Result<_>>()
        .map(Value::Map)
}

fn decode_tagged(tag: &str, map: &Map<String, Wire>) -> Result<Value> {
    if let Some(schema) = map.get(SCHEMA_KEY) {
        match schema.as_u64() {
            Some(v) if v <= u64::from(SCHEMA_VERSION) => {}
            _ => return Err(Error::decode(format!("'{}' has unsupported schema {}", tag, schema))),
        }
    }

    match tag {
        "tuple" => elements(tag, map).map(Value::Tuple),
        "set" | "frozenset" => elements(tag, map).map(Value::set),
        "special_float" => {
            let special = field_str(tag, map, "value")?;
            special_float(special)
                .map(Value::Float)
                .ok_or_else(|| Error::decode(format!("unknown special_float '{}'", special)))
        }
        "infinity" => Ok(Value::Float(f64::INFINITY)),
        "neg_infinity" => Ok(Value::Float(f64::NEG_INFINITY)),
        "nan" => Ok(Value::Float(f64::NAN)),
        "bytes" => {
            let data = map
                .get("data")
                .or_else(|| map.get("value"))
                .and_then(Wire::as_str)
                .ok_or_else(|| Error::decode("bytes is missing 'data'"))?;
            BASE64
                .decode(data)
                .map(Value::Bytes)
                .map_err(|e| Error::decode(format!("bytes payload is not base64: {}", e)))
        }
        "complex" => Ok(Value::Complex {
            re: float_field(tag, map, "real")?,
            im: float_field(tag, map, "imag")?,
        }),
        "date" => {
            let s = field_str(tag, map, "value")?;
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| Error::decode(format!("bad date '{}': {}", s, e)))
        }
        "time" => {
            let s = field_str(tag, map, "value")?;
            parse_time(s)
                .map(Value::Time)
                .ok_or_else(|| Error::decode(format!("bad time '{}'", s)))
        }
        "datetime" => {
            let s = field_str(tag, map, "value")?;
            parse_datetime(s).ok_or_else(|| Error::decode(format!("bad datetime '{}'", s)))
        }
        "ref" => Handle::from_wire(map).map(Value::Ref),
        "stream_ref" => StreamHandle::from_wire(map).map(Value::StreamRef),
        "dict" => decode_pairs(map),
        // Symbols from the remote side arrive as tagged atoms; the host has no
        // symbol type, so they become strings.
        "atom" => field_str(tag, map, "value").map(|s| Value::Str(s.to_string())),
        _ => decode_plain_map(map),
    }
}

fn elements(tag: &str, map: &Map<String, Wire>) -> Result<Vec<Value>> {
    match map.get("elements").or_else(|| map.get("value")) {
        Some(Wire::Array(items)) => decode_all(items),
        Some(other) => Err(Error::decode(format!("{} elements must be a list, got {}", tag, other))),
        None => Err(Error::decode(format!("{} is missing 'elements'", tag))),
    }
}

fn decode_pairs(map: &Map<String, Wire>) -> Result<Value> {
    let Some(Wire::Array(pairs)) = map.get("pairs") else {
        return Err(Error::decode("dict is missing 'pairs'"));
    };
    let mut out = std::collections::BTreeMap::new();
    for pair in pairs {
        match pair.as_array().map(Vec::as_slice) {
            Some([Wire::String(k), v]) => {
                out.insert(k.clone(), decode(v)?);
            }
            _ => return Err(Error::decode(format!("dict pair must be [string, value], got {}", pair))),
        }
    }
    Ok(Value::Map(out))
}

fn field_str<'a>(tag: &str, map: &'a Map<String, Wire>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(Wire::as_str)
        .ok_or_else(|| Error::decode(format!("{} is missing string field '{}'", tag, key)))
}

fn float_field(tag: &str, map: &Map<String, Wire>, key: &str) -> Result<f64> {
    let wire = map
        .get(key)
        .ok_or_else(|| Error::decode(format!("{} is missing '{}'", tag, key)))?;
    decode(wire)?
        .as_f64()
        .ok_or_else(|| Error::decode(format!("{} field '{}' is not numeric", tag, key)))
}

fn special_float(s: &str) -> Option<f64> {
    match s {
        "infinity" | "inf" => Some(f64::INFINITY),
        "neg_infinity" | "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    }
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

fn parse_datetime(s: &str) -> Option<Value> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Value::DateTimeTz(dt));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(Value::DateTime)
}
