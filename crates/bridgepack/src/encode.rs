//! # Value Encoding
//!
//! Lowers a [`Value`] onto the JSON wire. Plain data maps directly; every
//! other shape becomes a tagged object so it survives the trip back.
//!
//! ## Wire Forms
//! - tuple / set: `{"elements": [..]}`; set elements are emitted in a
//!   canonical order so equal sets encode to identical bytes
//! - special_float: `{"value": "infinity" | "neg_infinity" | "nan"}`
//! - bytes: `{"data": <base64>}`
//! - complex: `{"real": f, "imag": f}`
//! - date / time / datetime: `{"value": <iso-8601>}`
//! - ref / stream_ref: see [`crate::Handle`]
//! - dict: `{"pairs": [[k, v], ..]}`, only for maps that would otherwise be
//!   mistaken for a tagged object because they carry a `__type__` key

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Map;
use serde_json::Number;

use crate::SCHEMA_KEY;
use crate::SCHEMA_VERSION;
use crate::TYPE_KEY;
use crate::Value;
use crate::Wire;
use crate::error::Error;
use crate::error::Result;

const NAIVE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIME_FORMAT: &str = "%H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Encodes a value into its wire representation.
///
/// # Errors
/// Returns [`Error::Encode`] when a set holds an element the remote side
/// cannot hash (a list, map or set, directly or inside a tuple).
pub fn encode(value: &Value) -> Result<Wire> {
    let wire = match value {
        Value::Null => Wire::Null,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::from(*i),
        Value::Float(f) => encode_float(*f),
        Value::Str(s) => Wire::String(s.clone()),
        Value::Bytes(data) => tagged("bytes", [("data", Wire::String(BASE64.encode(data)))]),
        Value::Complex { re, im } => tagged("complex", [("real", encode_float(*re)), ("imag", encode_float(*im))]),
        Value::List(items) => Wire::Array(encode_all(items)?),
        Value::Map(map) => encode_map(map)?,
        Value::Tuple(items) => tagged("tuple", [("elements", Wire::Array(encode_all(items)?))]),
        Value::Set(items) => tagged("set", [("elements", Wire::Array(encode_set(items)?))]),
        Value::Date(d) => tagged("date", [("value", Wire::String(d.format(DATE_FORMAT).to_string()))]),
        Value::Time(t) => tagged("time", [("value", Wire::String(t.format(TIME_FORMAT).to_string()))]),
        Value::DateTime(dt) => {
            tagged("datetime", [("value", Wire::String(dt.format(NAIVE_DATETIME_FORMAT).to_string()))])
        }
        Value::DateTimeTz(dt) => tagged("datetime", [("value", Wire::String(dt.to_rfc3339()))]),
        Value::Ref(handle) => handle.to_wire(),
        Value::StreamRef(handle) => handle.to_wire(),
    };
    Ok(wire)
}

/// Encodes positional arguments.
pub fn encode_all(items: &[Value]) -> Result<Vec<Wire>> {
    items.iter().map(encode).collect()
}

fn encode_float(f: f64) -> Wire {
    let special = if f.is_nan() {
        "nan"
    } else if f == f64::INFINITY {
        "infinity"
    } else if f == f64::NEG_INFINITY {
        "neg_infinity"
    } else {
        // Finite floats always have a JSON number representation.
        return Number::from_f64(f).map_or(Wire::Null, Wire::Number);
    };
    tagged("special_float", [("value", Wire::from(special))])
}

fn encode_map(map: &std::collections::BTreeMap<String, Value>) -> Result<Wire> {
    if map.contains_key(TYPE_KEY) {
        let pairs = map
            .iter()
            .map(|(k, v)| Ok(Wire::Array(vec![Wire::String(k.clone()), encode(v)?])))
            .collect::<Result<Vec<_>>>()?;
        return Ok(tagged("dict", [("pairs", Wire::Array(pairs))]));
    }

    let mut out = Map::with_capacity(map.len());
    for (k, v) in map {
        out.insert(k.clone(), encode(v)?);
    }
    Ok(Wire::Object(out))
}

fn encode_set(items: &[Value]) -> Result<Vec<Wire>> {
    if let Some(bad) = items.iter().find(|v| !v.is_hashable()) {
        return Err(Error::encode(bad.type_name(), "set elements must be hashable"));
    }

    let mut encoded = items
        .iter()
        .map(|v| {
            let wire = encode(v)?;
            Ok((wire.to_string(), wire))
        })
        .collect::<Result<Vec<_>>>()?;
    encoded.sort_by(|a, b| a.0.cmp(&b.0));
    encoded.dedup_by(|a, b| a.0 == b.0);
    Ok(encoded.into_iter().map(|(_, wire)| wire).collect())
}

fn tagged<const N: usize>(tag: &str, fields: [(&str, Wire); N]) -> Wire {
    let mut map = Map::with_capacity(N + 2);
    map.insert(TYPE_KEY.into(), Wire::from(tag));
    map.insert(SCHEMA_KEY.into(), Wire::from(SCHEMA_VERSION));
    for (k, v) in fields {
        map.insert(k.into(), v);
    }
    Wire::Object(map)
}
