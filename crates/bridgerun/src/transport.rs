//! # Executor Abstraction
//!
//! The narrow interface through which the host reaches a remote interpreter.
//!
//! ## Philosophy
//!
//! - **Tool-Oriented**: An executor moves JSON messages addressed by tool
//!   name. It knows nothing about sessions, handles or call shapes.
//! - **Two Modes**: `execute` is one request and one reply. `execute_stream`
//!   is one request and a run of chunks handed to a callback, one at a time.
//! - **Opaque Pooling**: Whether the remote side is one process or a pool is
//!   the executor's business, not ours.

use std::fmt;
use std::time::Duration;

use bridgepack::SessionId;
use bridgepack::Wire;
use bridgerpc::RemoteFailure;
use serde_json::Map;

/// Errors reported by an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    /// The executor gave up waiting for a reply.
    Timeout,
    /// The remote side could not be reached, or the channel dropped.
    Unavailable(String),
    /// This executor cannot stream the given call.
    StreamingUnsupported(String),
    /// The remote side ran the call and reported a failure.
    Remote(RemoteFailure),
}

impl ExecError {
    /// Failures that say nothing about whether the call ran.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "request timed out"),
            Self::Unavailable(msg) => write!(f, "remote unavailable: {}", msg),
            Self::StreamingUnsupported(msg) => write!(f, "streaming not supported: {}", msg),
            Self::Remote(failure) => write!(f, "remote failure: {}", failure),
        }
    }
}

impl std::error::Error for ExecError {}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Per-request options handed through to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOptions {
    /// Deadline for one reply, or for one chunk when streaming.
    pub timeout: Duration,
    pub session_id: Option<SessionId>,
    pub metadata: Map<String, Wire>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            session_id: None,
            metadata: Map::new(),
        }
    }
}

/// What a chunk consumer wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// A mechanism to run a tool on the remote side.
///
/// This trait is designed to be object-safe (`Arc<dyn Executor>`).
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Runs one call and returns its encoded result.
    ///
    /// # invariants
    /// - Must return `Ok(wire)` with the encoded result on success.
    /// - Must return `Err(ExecError::Remote)` when the remote code failed.
    /// - Should not interpret the payload beyond routing it.
    async fn execute(&self, tool: &str, payload: Wire, opts: &ExecOptions) -> Result<Wire>;

    /// Runs one streaming call, handing every chunk to `on_chunk` before
    /// reading the next one. Returning [`Flow::Stop`] ends the stream early.
    ///
    /// Executors without a streaming channel keep the default, which
    /// reports [`ExecError::StreamingUnsupported`].
    async fn execute_stream(
        &self,
        tool: &str,
        payload: Wire,
        on_chunk: &mut (dyn FnMut(Wire) -> Flow + Send),
        opts: &ExecOptions,
    ) -> Result<()> {
        let _ = (payload, on_chunk, opts);
        Err(ExecError::StreamingUnsupported(format!("executor cannot stream '{}'", tool)))
    }
}
