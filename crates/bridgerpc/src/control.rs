//! # Control Messages
//!
//! Messages that manage the channel itself rather than call into user code:
//! version negotiation and explicit release of remote objects.

use bridgepack::HandleId;
use bridgepack::SessionId;
use bridgepack::Wire;
use serde_json::Map;

use crate::MIN_SUPPORTED_VERSION;
use crate::PROTOCOL_VERSION;
use crate::error::Error;
use crate::error::Result;
use crate::payload::str_field;
use crate::payload::version_field;

/// What one side of the channel can speak.
///
/// Sent as the `bridge.handshake` request and echoed back by the remote
/// with its own values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub min_supported_version: u32,
    pub supports_streaming: bool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_supported_version: MIN_SUPPORTED_VERSION,
            supports_streaming: true,
        }
    }
}

impl Handshake {
    /// Whether this side can parse a message stamped with `version`.
    pub fn accepts(&self, version: u32) -> bool {
        version >= self.min_supported_version && version <= self.protocol_version
    }

    /// Whether `self` may send to `remote`: the remote must parse our
    /// version, and must itself be new enough for us.
    pub fn compatible_with(&self, remote: &Handshake) -> bool {
        remote.accepts(self.protocol_version) && remote.protocol_version >= self.min_supported_version
    }

    pub fn to_wire(&self) -> Wire {
        let mut map = Map::new();
        map.insert("protocol_version".into(), Wire::from(self.protocol_version));
        map.insert("min_supported_version".into(), Wire::from(self.min_supported_version));
        map.insert("supports_streaming".into(), Wire::Bool(self.supports_streaming));
        Wire::Object(map)
    }

    pub fn from_wire(wire: &Wire) -> Result<Self> {
        let map = as_object(wire, "handshake")?;
        let protocol_version = version_field(map, "protocol_version")?.ok_or(Error::MissingField("protocol_version"))?;
        let min_supported_version = version_field(map, "min_supported_version")?.unwrap_or(protocol_version);
        let supports_streaming = map.get("supports_streaming").and_then(Wire::as_bool).unwrap_or(true);
        Ok(Self {
            protocol_version,
            min_supported_version,
            supports_streaming,
        })
    }
}

/// Asks the remote side to drop one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRef {
    pub session_id: SessionId,
    pub handle_id: HandleId,
}

impl ReleaseRef {
    pub fn to_wire(&self) -> Wire {
        let mut map = Map::new();
        map.insert("session_id".into(), Wire::from(self.session_id.as_str()));
        map.insert("ref_id".into(), Wire::from(self.handle_id.as_str()));
        Wire::Object(map)
    }

    pub fn from_wire(wire: &Wire) -> Result<Self> {
        let map = as_object(wire, "release_ref")?;
        Ok(Self {
            session_id: str_field(map, "session_id")?.ok_or(Error::MissingField("session_id"))?.into(),
            handle_id: HandleId::new(str_field(map, "ref_id")?.ok_or(Error::MissingField("ref_id"))?),
        })
    }
}

/// Asks the remote side to drop every object of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSession {
    pub session_id: SessionId,
}

impl ReleaseSession {
    pub fn to_wire(&self) -> Wire {
        let mut map = Map::new();
        map.insert("session_id".into(), Wire::from(self.session_id.as_str()));
        Wire::Object(map)
    }

    pub fn from_wire(wire: &Wire) -> Result<Self> {
        let map = as_object(wire, "release_session")?;
        Ok(Self {
            session_id: str_field(map, "session_id")?.ok_or(Error::MissingField("session_id"))?.into(),
        })
    }
}

fn as_object<'a>(wire: &'a Wire, what: &str) -> Result<&'a Map<String, Wire>> {
    wire.as_object()
        .ok_or_else(|| Error::ProtocolViolation(format!("{} must be an object, got {}", what, wire)))
}
