//! # Batches
//!
//! Several calls in one round-trip. The remote side runs them in order and
//! answers each one on its own, so a failing call does not abort the rest.
//!
//! ```json
//! request: { "calls": [ <call payload>, ... ] }
//! reply:   [ { "success": true,  "result": <value> },
//!            { "success": false, "error": <failure> } ]
//! ```
//!
//! ## Invariants
//! - The reply holds exactly one entry per call, in request order.

use bridgepack::Wire;
use serde_json::Map;

use crate::error::Error;
use crate::error::Result;
use crate::failure::RemoteFailure;

/// Already-encoded call payloads sent under `bridge.batch`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    pub calls: Vec<Wire>,
}

impl BatchCall {
    pub fn to_wire(&self) -> Wire {
        let mut map = Map::new();
        map.insert("calls".into(), Wire::Array(self.calls.clone()));
        Wire::Object(map)
    }

    pub fn from_wire(wire: &Wire) -> Result<Self> {
        match wire.get("calls") {
            Some(Wire::Array(calls)) => Ok(Self { calls: calls.clone() }),
            Some(other) => Err(Error::ProtocolViolation(format!("batch calls must be an array, got {}", other))),
            None => Err(Error::MissingField("calls")),
        }
    }
}

/// Outcome of one call inside a batch: the encoded result or the failure.
pub type BatchOutcome = std::result::Result<Wire, RemoteFailure>;

/// The remote side's answer to a [`BatchCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReply {
    pub results: Vec<BatchOutcome>,
}

impl BatchReply {
    pub fn to_wire(&self) -> Wire {
        Wire::Array(self.results.iter().map(outcome_to_wire).collect())
    }

    pub fn from_wire(wire: &Wire) -> Result<Self> {
        let items = wire
            .as_array()
            .ok_or_else(|| Error::ProtocolViolation(format!("batch reply must be an array, got {}", wire)))?;
        let results = items.iter().map(outcome_from_wire).collect::<Result<Vec<_>>>()?;
        Ok(Self { results })
    }
}

fn outcome_to_wire(outcome: &BatchOutcome) -> Wire {
    let mut map = Map::new();
    match outcome {
        Ok(result) => {
            map.insert("success".into(), Wire::Bool(true));
            map.insert("result".into(), result.clone());
        }
        Err(failure) => {
            map.insert("success".into(), Wire::Bool(false));
            map.insert("error".into(), failure.to_wire());
        }
    }
    Wire::Object(map)
}

fn outcome_from_wire(item: &Wire) -> Result<BatchOutcome> {
    match item.get("success").and_then(Wire::as_bool) {
        Some(true) => Ok(Ok(item.get("result").cloned().unwrap_or(Wire::Null))),
        // Older remotes put the failure fields next to `success`.
        Some(false) => Ok(Err(RemoteFailure::from_wire(item.get("error").unwrap_or(item)))),
        None => Err(Error::MissingField("success")),
    }
}
