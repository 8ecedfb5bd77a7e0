//! # Error Definitions
//!
//! Failures of the envelope itself, as opposed to [`crate::RemoteFailure`],
//! which reports the remote side failing to do the work.

/// Operational failures within the protocol layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The message was not an object, or a field had the wrong JSON type.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A required envelope field was absent.
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    /// The `call_type` tag named no known call shape.
    #[error("unknown call type '{0}'")]
    UnknownCallType(String),
    /// A value inside the envelope failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] bridgepack::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
