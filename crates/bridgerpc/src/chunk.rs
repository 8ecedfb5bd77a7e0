//! # Stream Chunks
//!
//! One step of a streaming reply.
//!
//! ```json
//! { "chunk": "item", "data": <encoded value> }
//! { "chunk": "keepalive" }
//! { "chunk": "done" }
//! { "chunk": "error", "error": { "error_type": "...", "message": "..." } }
//! ```
//!
//! A stream is a run of `item` and `keepalive` chunks closed by exactly one
//! `done` or `error`. Keep-alives carry no payload and are never shown to
//! the consumer.

use bridgepack::Value;
use bridgepack::Wire;
use serde_json::Map;

use crate::error::Error;
use crate::error::Result;
use crate::failure::RemoteFailure;
use crate::payload::str_field;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Item(Value),
    KeepAlive,
    Done,
    Failed(RemoteFailure),
}

impl StreamChunk {
    /// Whether this chunk closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn to_wire(&self) -> Result<Wire> {
        let mut map = Map::new();
        match self {
            Self::Item(value) => {
                map.insert("chunk".into(), Wire::from("item"));
                map.insert("data".into(), bridgepack::encode(value)?);
            }
            Self::KeepAlive => {
                map.insert("chunk".into(), Wire::from("keepalive"));
            }
            Self::Done => {
                map.insert("chunk".into(), Wire::from("done"));
            }
            Self::Failed(failure) => {
                map.insert("chunk".into(), Wire::from("error"));
                map.insert("error".into(), failure.to_wire());
            }
        }
        Ok(Wire::Object(map))
    }

    pub fn from_wire(wire: &Wire) -> Result<Self> {
        let map = wire
            .as_object()
            .ok_or_else(|| Error::ProtocolViolation(format!("stream chunk must be an object, got {}", wire)))?;

        match str_field(map, "chunk")?.as_deref() {
            Some("item") => {
                let data = map.get("data").ok_or(Error::MissingField("data"))?;
                Ok(Self::Item(bridgepack::decode(data)?))
            }
            Some("keepalive") => Ok(Self::KeepAlive),
            Some("done") => Ok(Self::Done),
            Some("error") => {
                let failure = map.get("error").ok_or(Error::MissingField("error"))?;
                Ok(Self::Failed(RemoteFailure::from_wire(failure)))
            }
            Some(other) => Err(Error::ProtocolViolation(format!("unknown chunk kind '{}'", other))),
            None => Err(Error::MissingField("chunk")),
        }
    }
}
