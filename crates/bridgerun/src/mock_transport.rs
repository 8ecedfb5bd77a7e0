//! Mock executors for testing.
//!
//! These are used by the test suites and are not part of the public API.
//! Most of them wrap another executor, usually a
//! [`LocalRemote`](crate::remote::LocalRemote), and bend one aspect of its
//! behavior.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bridgepack::Value;
use bridgepack::Wire;
use bridgerpc::RemoteFailure;
use bridgerpc::StreamChunk;
use bridgerpc::tool;

use crate::transport;
use crate::transport::ExecError;
use crate::transport::ExecOptions;
use crate::transport::Executor;
use crate::transport::Flow;

/// Fails the first `failures` calls to the call tool with
/// [`ExecError::Unavailable`], then delegates.
///
/// Control tools (handshake, release) always go straight through.
pub struct FlakyExecutor<E> {
    inner: Arc<E>,
    failures: usize,
    attempts: AtomicUsize,
}

impl<E: Executor> FlakyExecutor<E> {
    pub fn new(inner: Arc<E>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Calls seen on the call tool, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl<E: Executor> Executor for FlakyExecutor<E> {
    async fn execute(&self, tool: &str, payload: Wire, opts: &ExecOptions) -> transport::Result<Wire> {
        if tool == tool::CALL {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(ExecError::Unavailable(format!("simulated drop #{}", attempt + 1)));
            }
        }
        self.inner.execute(tool, payload, opts).await
    }
}

/// Records every request before delegating.
pub struct RecordingExecutor<E> {
    inner: Arc<E>,
    requests: Mutex<Vec<(String, Wire)>>,
}

impl<E: Executor> RecordingExecutor<E> {
    pub fn new(inner: Arc<E>) -> Self {
        Self {
            inner,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// `(tool, payload)` pairs in the order they were sent.
    pub fn requests(&self) -> Vec<(String, Wire)> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Payloads sent to `tool`.
    pub fn payloads(&self, tool: &str) -> Vec<Wire> {
        self.requests().into_iter().filter(|(t, _)| t == tool).map(|(_, p)| p).collect()
    }
}

#[async_trait::async_trait]
impl<E: Executor> Executor for RecordingExecutor<E> {
    async fn execute(&self, tool: &str, payload: Wire, opts: &ExecOptions) -> transport::Result<Wire> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push((tool.to_string(), payload.clone()));
        self.inner.execute(tool, payload, opts).await
    }

    async fn execute_stream(
        &self,
        tool: &str,
        payload: Wire,
        on_chunk: &mut (dyn FnMut(Wire) -> Flow + Send),
        opts: &ExecOptions,
    ) -> transport::Result<()> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner()).push((tool.to_string(), payload.clone()));
        self.inner.execute_stream(tool, payload, on_chunk, opts).await
    }
}

/// Delegates plain calls and keeps the default `execute_stream`, so every
/// streaming attempt reports [`ExecError::StreamingUnsupported`].
pub struct NoStreamingExecutor<E> {
    inner: Arc<E>,
}

impl<E: Executor> NoStreamingExecutor<E> {
    pub fn new(inner: Arc<E>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<E: Executor> Executor for NoStreamingExecutor<E> {
    async fn execute(&self, tool: &str, payload: Wire, opts: &ExecOptions) -> transport::Result<Wire> {
        self.inner.execute(tool, payload, opts).await
    }
}

/// Streams `items`, then a failure chunk. Plain calls answer the handshake
/// and fail otherwise.
pub struct FailingStreamExecutor {
    items: Vec<Value>,
    failure: RemoteFailure,
}

impl FailingStreamExecutor {
    pub fn new(items: Vec<Value>, failure: RemoteFailure) -> Self {
        Self { items, failure }
    }
}

#[async_trait::async_trait]
impl Executor for FailingStreamExecutor {
    async fn execute(&self, tool: &str, _payload: Wire, _opts: &ExecOptions) -> transport::Result<Wire> {
        match tool {
            tool::HANDSHAKE => Ok(bridgerpc::control::Handshake::default().to_wire()),
            tool::RELEASE_REF => Ok(Wire::Bool(false)),
            _ => Err(ExecError::Remote(self.failure.clone())),
        }
    }

    async fn execute_stream(
        &self,
        _tool: &str,
        _payload: Wire,
        on_chunk: &mut (dyn FnMut(Wire) -> Flow + Send),
        _opts: &ExecOptions,
    ) -> transport::Result<()> {
        let chunks = self
            .items
            .iter()
            .cloned()
            .map(StreamChunk::Item)
            .chain(std::iter::once(StreamChunk::Failed(self.failure.clone())));
        for chunk in chunks {
            let wire = chunk.to_wire().map_err(|e| ExecError::Unavailable(e.to_string()))?;
            if on_chunk(wire) == Flow::Stop {
                break;
            }
        }
        Ok(())
    }
}

/// Waits `delay` before delegating each call to the call tool.
pub struct SlowExecutor<E> {
    inner: Arc<E>,
    delay: Duration,
}

impl<E: Executor> SlowExecutor<E> {
    pub fn new(inner: Arc<E>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait::async_trait]
impl<E: Executor> Executor for SlowExecutor<E> {
    async fn execute(&self, tool: &str, payload: Wire, opts: &ExecOptions) -> transport::Result<Wire> {
        if tool == tool::CALL {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.execute(tool, payload, opts).await
    }
}

/// Refuses the handshake the way a remote built before negotiation does,
/// and delegates everything else.
pub struct LegacyExecutor<E> {
    inner: Arc<E>,
}

impl<E: Executor> LegacyExecutor<E> {
    pub fn new(inner: Arc<E>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl<E: Executor> Executor for LegacyExecutor<E> {
    async fn execute(&self, tool: &str, payload: Wire, opts: &ExecOptions) -> transport::Result<Wire> {
        if tool == tool::HANDSHAKE {
            return Err(ExecError::Remote(RemoteFailure::new(
                "AttributeError",
                format!("unknown tool '{}'", tool),
            )));
        }
        self.inner.execute(tool, payload, opts).await
    }
}
