//! # Error Definitions
//!
//! The single error type every host-facing operation returns. Callers branch
//! on [`ErrorKind`]; humans read the message, the remote traceback and the
//! suggestion.

use std::fmt;

use bridgepack::Wire;
use serde_json::Map;

/// Closed taxonomy of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A host value could not be encoded. Nothing was sent.
    Encoding,
    /// A reply could not be decoded, or the remote side could not decode
    /// what we sent.
    Decoding,
    /// The two sides share no protocol version.
    ProtocolVersion,
    Timeout,
    TransportUnavailable,
    /// The handle id is unknown to the remote registry.
    RefNotFound,
    /// The handle exists under a different session.
    SessionMismatch,
    ValueError,
    TypeError,
    ImportError,
    AttributeError,
    KeyError,
    IndexError,
    RuntimeError,
    /// Helper calls are disabled by configuration.
    HelperDisabled,
    /// The executor cannot stream this call.
    StreamingUnsupported,
    /// A remote iterator is exhausted.
    StopIteration,
    /// Array operands have incompatible shapes.
    ShapeMismatch,
    /// The remote side ran out of memory.
    OutOfMemory,
    /// Array operands have incompatible element types.
    DtypeMismatch,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encoding => "encoding_error",
            Self::Decoding => "decoding_error",
            Self::ProtocolVersion => "protocol_version_error",
            Self::Timeout => "timeout",
            Self::TransportUnavailable => "transport_unavailable",
            Self::RefNotFound => "ref_not_found",
            Self::SessionMismatch => "session_mismatch",
            Self::ValueError => "value_error",
            Self::TypeError => "type_error",
            Self::ImportError => "import_error",
            Self::AttributeError => "attribute_error",
            Self::KeyError => "key_error",
            Self::IndexError => "index_error",
            Self::RuntimeError => "runtime_error",
            Self::HelperDisabled => "helper_disabled",
            Self::StreamingUnsupported => "streaming_unsupported",
            Self::StopIteration => "stop_iteration",
            Self::ShapeMismatch => "shape_mismatch",
            Self::OutOfMemory => "out_of_memory",
            Self::DtypeMismatch => "dtype_mismatch",
            Self::Unknown => "unknown",
        }
    }

    /// Transport failures that an idempotent call may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::TransportUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Raw diagnostic text from the remote side.
    pub remote_traceback: Option<String>,
    pub details: Map<String, Wire>,
    /// A concrete fix, when one can be inferred from `details`.
    pub suggestion: Option<String>,
}

impl BridgeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remote_traceback: None,
            details: Map::new(),
            suggestion: None,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Wire>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.remote_traceback = traceback;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<bridgepack::Error> for BridgeError {
    fn from(e: bridgepack::Error) -> Self {
        match e {
            bridgepack::Error::Encode { type_name, reason } => {
                Self::new(ErrorKind::Encoding, format!("cannot encode {}: {}", type_name, reason))
                    .with_detail("type_name", type_name)
            }
            bridgepack::Error::Decode(msg) => Self::new(ErrorKind::Decoding, msg),
        }
    }
}

impl From<bridgerpc::Error> for BridgeError {
    fn from(e: bridgerpc::Error) -> Self {
        match e {
            bridgerpc::Error::Codec(inner) => inner.into(),
            other => Self::new(ErrorKind::Decoding, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
