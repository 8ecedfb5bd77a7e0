//! # Remote Failures
//!
//! The error side of any reply.
//!
//! These are distinct from [`crate::Error`]; these represent the *remote*
//! system failing, whereas `Error` represents the *envelope* being wrong.

use std::fmt;

use bridgepack::Wire;
use serde_json::Map;

use crate::payload::str_field;

/// Structured reason attached to a failure when the remote side knows it.
///
/// The host classifier prefers this over matching on message text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// No object is registered under the handle id.
    RefNotFound,
    /// The handle id exists, but under a different session.
    SessionMismatch,
    /// The remote side has no streaming channel.
    StreamingUnsupported,
    /// The payload's protocol version is outside the accepted window.
    ProtocolVersion,
    /// The remote side refused a helper call.
    HelperDisabled,
    /// Any code this crate does not know yet.
    Other(String),
}

impl FailureCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RefNotFound => "ref_not_found",
            Self::SessionMismatch => "session_mismatch",
            Self::StreamingUnsupported => "streaming_unsupported",
            Self::ProtocolVersion => "protocol_version",
            Self::HelperDisabled => "helper_disabled",
            Self::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ref_not_found" => Self::RefNotFound,
            "session_mismatch" => Self::SessionMismatch,
            "streaming_unsupported" => Self::StreamingUnsupported,
            "protocol_version" => Self::ProtocolVersion,
            "helper_disabled" => Self::HelperDisabled,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A failure reported by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFailure {
    /// Remote exception class name, e.g. `ValueError`.
    pub error_type: String,
    pub message: String,
    pub traceback: Option<String>,
    pub details: Map<String, Wire>,
    pub code: Option<FailureCode>,
}

impl RemoteFailure {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            traceback: None,
            details: Map::new(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: FailureCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Wire>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn to_wire(&self) -> Wire {
        let mut map = Map::new();
        map.insert("error_type".into(), Wire::from(self.error_type.as_str()));
        map.insert("message".into(), Wire::from(self.message.as_str()));
        if let Some(tb) = &self.traceback {
            map.insert("traceback".into(), Wire::from(tb.as_str()));
        }
        if !self.details.is_empty() {
            map.insert("details".into(), Wire::Object(self.details.clone()));
        }
        if let Some(code) = &self.code {
            map.insert("code".into(), Wire::from(code.as_str()));
        }
        Wire::Object(map)
    }

    /// Reads a failure record. Never fails: anything unrecognisable becomes
    /// an untyped failure whose message is the raw JSON.
    pub fn from_wire(wire: &Wire) -> Self {
        let map = match wire {
            Wire::Object(map) => map,
            Wire::String(s) => return Self::new("", s.clone()),
            other => return Self::new("", other.to_string()),
        };

        let text = |key: &str| str_field(map, key).ok().flatten();
        let message = text("message").or_else(|| text("error")).unwrap_or_default();
        let details = match map.get("details") {
            Some(Wire::Object(d)) => d.clone(),
            _ => Map::new(),
        };

        Self {
            error_type: text("error_type").unwrap_or_default(),
            message,
            traceback: text("traceback"),
            details,
            code: text("code").map(|c| FailureCode::parse(&c)),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error_type.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.error_type, self.message)
        }
    }
}
