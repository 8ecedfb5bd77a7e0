//! Codec failures.

/// Failures raised while converting between [`crate::Value`] and the wire.
///
/// Both variants are local: a value that fails to encode never reaches the
/// remote side, and a reply that fails to decode is reported to the caller
/// without touching the remote registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The value has a shape the wire format cannot carry.
    #[error("cannot encode value of type `{type_name}`: {reason}")]
    Encode { type_name: String, reason: String },
    /// A wire value, usually a tagged form, was malformed.
    #[error("cannot decode wire value: {0}")]
    Decode(String),
}

impl Error {
    pub(crate) fn encode(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encode {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
