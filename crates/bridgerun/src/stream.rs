//! # Streaming Coordinator
//!
//! Delivers the values of a remote generator to a callback, one at a time.
//!
//! ```text
//! Started -> (Item)* -> Done | Failed
//! ```
//!
//! ## Native and legacy paths
//!
//! The native path issues one `bridge.stream` request and hands every item
//! chunk to `on_item` before the executor reads the next one. Keep-alive
//! chunks never reach the callback.
//!
//! When the executor or the remote side cannot stream, the coordinator
//! calls the target normally and walks the returned iterator with
//! `__next__` until `StopIteration`, which ends the stream as `Done`.
//!
//! ## Cancellation
//!
//! Returning [`Flow::Stop`] from `on_item` stops the stream. On the legacy
//! path that simply means no further `__next__` is sent. An iterator this
//! coordinator created itself is released once iteration stops; one passed
//! in by the caller is left alone.

use bridgepack::Handle;
use bridgepack::StreamHandle;
use bridgepack::Value;
use bridgepack::Wire;
use bridgerpc::CallShape;
use bridgerpc::StreamChunk;
use bridgerpc::tool;

use crate::classify::classify_exec;
use crate::classify::classify_failure;
use crate::config::CallOptions;
use crate::dispatch::Dispatcher;
use crate::dispatch::Kwargs;
use crate::error::BridgeError;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::transport::Flow;

/// How a stream that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The producer finished.
    Done,
    /// The consumer returned [`Flow::Stop`].
    Cancelled,
}

/// Summary of a finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub end: StreamEnd,
    /// Items handed to `on_item`.
    pub items: usize,
    /// Whether the legacy `__next__` path was used.
    pub legacy: bool,
}

#[derive(Default)]
struct NativeState {
    items: usize,
    cancelled: bool,
    error: Option<BridgeError>,
}

impl Dispatcher {
    /// Streams the values produced by `module.function(*args, **kwargs)`.
    ///
    /// # Errors
    /// A failure after the stream started is returned with the number of
    /// items already delivered under `details["items_delivered"]`. Those
    /// items stay delivered.
    pub async fn stream<F>(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
        mut on_item: F,
    ) -> Result<StreamReport>
    where
        F: FnMut(Value) -> Flow + Send,
    {
        let shape = CallShape::DynamicStream {
            module: module.to_string(),
            function: function.to_string(),
        };
        let (wire, exec_opts) = self.prepare(shape, args.clone(), kwargs.clone(), opts).await?;

        let native = self.negotiate().await?.is_none_or(|remote| remote.supports_streaming);
        if !native {
            tracing::info!(module, function, "remote cannot stream; iterating with __next__");
            return self.stream_legacy(module, function, args, kwargs, opts, &mut on_item).await;
        }

        let mut state = NativeState::default();
        let mut on_chunk = |chunk: Wire| -> Flow {
            match StreamChunk::from_wire(&chunk) {
                Ok(StreamChunk::KeepAlive) => Flow::Continue,
                Ok(StreamChunk::Item(value)) => {
                    state.items += 1;
                    if on_item(value) == Flow::Stop {
                        state.cancelled = true;
                        return Flow::Stop;
                    }
                    Flow::Continue
                }
                Ok(StreamChunk::Done) => Flow::Stop,
                Ok(StreamChunk::Failed(failure)) => {
                    state.error = Some(classify_failure(&failure));
                    Flow::Stop
                }
                Err(e) => {
                    state.error = Some(e.into());
                    Flow::Stop
                }
            }
        };
        let outcome = self
            .shared
            .executor
            .execute_stream(tool::STREAM, wire, &mut on_chunk, &exec_opts)
            .await;

        let error = match outcome {
            Ok(()) => state.error,
            Err(e) => Some(classify_exec(e)),
        };
        match error {
            None => Ok(StreamReport {
                end: if state.cancelled { StreamEnd::Cancelled } else { StreamEnd::Done },
                items: state.items,
                legacy: false,
            }),
            Some(e) if e.is(ErrorKind::StreamingUnsupported) && state.items == 0 => {
                tracing::info!(module, function, "streaming unsupported; iterating with __next__");
                self.stream_legacy(module, function, args, kwargs, opts, &mut on_item).await
            }
            Some(e) => Err(failed(e, state.items)),
        }
    }

    /// Walks a remote generator or iterator the caller already holds.
    ///
    /// The stream handle is not released afterwards.
    pub async fn stream_ref<F>(&self, stream: &StreamHandle, opts: &CallOptions, mut on_item: F) -> Result<StreamReport>
    where
        F: FnMut(Value) -> Flow + Send,
    {
        self.iterate(&stream.handle, false, opts, &mut on_item).await
    }

    async fn stream_legacy<F>(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
        on_item: &mut F,
    ) -> Result<StreamReport>
    where
        F: FnMut(Value) -> Flow + Send,
    {
        let iterable = self.call_dynamic(module, function, args, kwargs, opts).await?;
        let iterator = match iterable {
            Value::StreamRef(stream) => stream.handle,
            Value::Ref(object) => {
                let iterator = self.call_method(&object, "__iter__", Vec::new(), Kwargs::new(), opts).await?;
                match iterator.into_handle() {
                    Some(handle) => handle,
                    None => {
                        return Err(BridgeError::new(
                            ErrorKind::TypeError,
                            format!("__iter__ of {} did not return an iterator", object.id),
                        ));
                    }
                }
            }
            Value::List(items) | Value::Tuple(items) => return Ok(deliver(items, on_item)),
            other => {
                return Err(BridgeError::new(
                    ErrorKind::TypeError,
                    format!("'{}' object is not iterable", other.type_name()),
                ));
            }
        };
        self.iterate(&iterator, true, opts, on_item).await
    }

    /// Calls `__next__` on `iterator` until it stops, fails, or the consumer
    /// cancels. `owned` iterators are released at the end.
    async fn iterate<F>(&self, iterator: &Handle, owned: bool, opts: &CallOptions, on_item: &mut F) -> Result<StreamReport>
    where
        F: FnMut(Value) -> Flow + Send,
    {
        let mut items = 0;
        let result = loop {
            match self.call_method(iterator, "__next__", Vec::new(), Kwargs::new(), opts).await {
                Ok(value) => {
                    items += 1;
                    if on_item(value) == Flow::Stop {
                        tracing::debug!(ref_id = %iterator.id, items, "legacy stream cancelled by consumer");
                        break Ok(StreamEnd::Cancelled);
                    }
                }
                Err(e) if e.is(ErrorKind::StopIteration) => break Ok(StreamEnd::Done),
                Err(e) => break Err(failed(e, items)),
            }
        };

        if owned {
            if let Err(e) = self.release_ref(iterator).await {
                tracing::warn!(ref_id = %iterator.id, "failed to release iterator: {}", e);
            }
        }
        result.map(|end| StreamReport { end, items, legacy: true })
    }
}

fn deliver<F>(items: Vec<Value>, on_item: &mut F) -> StreamReport
where
    F: FnMut(Value) -> Flow,
{
    let mut delivered = 0;
    for item in items {
        delivered += 1;
        if on_item(item) == Flow::Stop {
            return StreamReport { end: StreamEnd::Cancelled, items: delivered, legacy: true };
        }
    }
    StreamReport { end: StreamEnd::Done, items: delivered, legacy: true }
}

fn failed(error: BridgeError, items: usize) -> BridgeError {
    error.with_detail("items_delivered", items)
}
