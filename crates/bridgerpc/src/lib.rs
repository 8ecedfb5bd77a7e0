//! # bridgerpc
//!
//! The versioned call protocol spoken between a host and a remote
//! interpreter process.
//!
//! ## Architecture
//!
//! Every message is a JSON object handed to an opaque execute/stream channel
//! under a tool name. Values inside a message are already lowered by
//! `bridgepack`; this crate only knows where they sit in the envelope.
//!
//! - [`CallPayload`]: one call, addressed by a [`CallShape`].
//! - [`StreamChunk`]: one step of a streaming reply.
//! - [`RemoteFailure`]: the error side of any reply.
//! - [`control`]: handshake and release messages.
//! - [`batch`]: several calls answered one by one.

pub mod batch;
pub mod chunk;
pub mod control;
pub mod error;
pub mod failure;
pub mod payload;
pub mod shape;

pub use batch::BatchCall;
pub use batch::BatchReply;
pub use chunk::StreamChunk;
pub use error::Error;
pub use error::Result;
pub use failure::FailureCode;
pub use failure::RemoteFailure;
pub use payload::CallPayload;
pub use shape::CallShape;
pub use shape::CallType;

/// Protocol version stamped on every payload this crate produces.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version this crate can still parse.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Tool names understood by the remote side.
pub mod tool {
    pub const CALL: &str = "bridge.call";
    pub const BATCH: &str = "bridge.batch";
    pub const STREAM: &str = "bridge.stream";
    pub const HANDSHAKE: &str = "bridge.handshake";
    pub const RELEASE_REF: &str = "bridge.release_ref";
    pub const RELEASE_SESSION: &str = "bridge.release_session";
}

#[cfg(test)]
mod tests;
