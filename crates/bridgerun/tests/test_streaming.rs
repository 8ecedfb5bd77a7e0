//! Streaming, native and legacy.

mod common;

use std::sync::Arc;

use bridgepack::Value;
use bridgerpc::RemoteFailure;
use bridgerpc::tool;
use bridgerun::BridgeConfig;
use bridgerun::CallOptions;
use bridgerun::Dispatcher;
use bridgerun::ErrorKind;
use bridgerun::Flow;
use bridgerun::Kwargs;
use bridgerun::StreamEnd;
use bridgerun::mock_transport::FailingStreamExecutor;
use bridgerun::mock_transport::NoStreamingExecutor;
use bridgerun::mock_transport::RecordingExecutor;

use common::remote;

fn ints(range: std::ops::Range<i64>) -> Vec<Value> {
    range.map(Value::Int).collect()
}

fn count(n: i64) -> (Vec<Value>, Kwargs) {
    (vec![Value::Int(n)], Kwargs::new())
}

// --- Native path ---

#[tokio::test]
async fn test_finite_stream_ends_done() -> anyhow::Result<()> {
    let recorder = Arc::new(RecordingExecutor::new(Arc::new(remote(0, 0))));
    let dispatcher = Dispatcher::new(recorder.clone(), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(5);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert_eq!(report.end, StreamEnd::Done);
    assert_eq!(report.items, 5);
    assert!(!report.legacy);
    assert_eq!(seen, ints(0..5));

    let streamed = recorder.payloads(tool::STREAM);
    assert_eq!(streamed.len(), 1);
    assert_eq!(streamed[0]["call_type"], "dynamic-stream");
    assert!(recorder.payloads(tool::CALL).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_empty_stream() -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(Arc::new(remote(0, 0)), BridgeConfig::default());
    let (args, kwargs) = count(0);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |_| Flow::Continue)
        .await?;
    assert_eq!(report.end, StreamEnd::Done);
    assert_eq!(report.items, 0);
    Ok(())
}

#[tokio::test]
async fn test_keepalives_are_skipped() -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(Arc::new(remote(0, 0).with_keepalives()), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(3);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert_eq!(report.items, 3);
    assert_eq!(seen, ints(0..3));
    Ok(())
}

#[tokio::test]
async fn test_failure_keeps_delivered_items() {
    let dispatcher = Dispatcher::new(Arc::new(remote(0, 0)), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(3);
    let err = dispatcher
        .stream("gen", "broken", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ValueError);
    assert_eq!(err.message, "bad row");
    assert_eq!(err.remote_traceback.as_deref(), Some("Traceback: bad row"));
    assert_eq!(err.details["items_delivered"], 3);
    assert_eq!(seen, ints(0..3));
}

#[tokio::test]
async fn test_failure_chunk_from_executor() {
    let items = vec![Value::from("first"), Value::from("second")];
    let executor = FailingStreamExecutor::new(items.clone(), RemoteFailure::new("RuntimeError", "producer died"));
    let dispatcher = Dispatcher::new(Arc::new(executor), BridgeConfig::default());

    let mut seen = Vec::new();
    let err = dispatcher
        .stream("any", "thing", Vec::new(), Kwargs::new(), &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::RuntimeError);
    assert_eq!(seen, items);
}

#[tokio::test]
async fn test_consumer_can_cancel() -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(Arc::new(remote(0, 0)), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(100);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            if seen.len() == 2 { Flow::Stop } else { Flow::Continue }
        })
        .await?;

    assert_eq!(report.end, StreamEnd::Cancelled);
    assert_eq!(report.items, 2);
    assert_eq!(seen, ints(0..2));
    Ok(())
}

// --- Legacy path ---

#[tokio::test]
async fn test_fallback_when_executor_cannot_stream() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let dispatcher = Dispatcher::new(Arc::new(NoStreamingExecutor::new(remote.clone())), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(4);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert_eq!(report.end, StreamEnd::Done);
    assert!(report.legacy);
    assert_eq!(seen, ints(0..4));
    // The iterator the fallback created is gone once iteration ends.
    assert_eq!(remote.live_refs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_fallback_when_remote_cannot_stream() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0).without_streaming());
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(3);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert!(report.legacy);
    assert_eq!(seen, ints(0..3));
    // One call for the generator, one `__next__` per item, one that stops.
    assert_eq!(remote.calls(), 1 + 3 + 1);
    Ok(())
}

#[tokio::test]
async fn test_legacy_cancel_sends_no_further_next() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0).without_streaming());
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(50);
    let report = dispatcher
        .stream("gen", "count", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            if seen.len() == 2 { Flow::Stop } else { Flow::Continue }
        })
        .await?;

    assert_eq!(report.end, StreamEnd::Cancelled);
    assert_eq!(remote.calls(), 1 + 2);
    assert_eq!(remote.live_refs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_legacy_failure_keeps_delivered_items() {
    let remote = Arc::new(remote(0, 0).without_streaming());
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let mut seen = Vec::new();
    let (args, kwargs) = count(2);
    let err = dispatcher
        .stream("gen", "broken", args, kwargs, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::ValueError);
    assert_eq!(err.details["items_delivered"], 2);
    assert_eq!(seen, ints(0..2));
}

#[tokio::test]
async fn test_legacy_iterates_object_via_iter() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0).without_streaming());
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let mut seen = Vec::new();
    let items = vec![Value::from("x"), Value::from("y")];
    let report = dispatcher
        .stream("bags", "make", items.clone(), Kwargs::new(), &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert_eq!(report.end, StreamEnd::Done);
    assert_eq!(seen, items);
    Ok(())
}

#[tokio::test]
async fn test_legacy_plain_list() -> anyhow::Result<()> {
    let dispatcher = Dispatcher::new(Arc::new(remote(0, 0).without_streaming()), BridgeConfig::default());

    let mut seen = Vec::new();
    let report = dispatcher
        .stream("gen", "rows", Vec::new(), Kwargs::new(), &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert!(report.legacy);
    assert_eq!(seen, vec![Value::from("a"), Value::from("b")]);
    Ok(())
}

// --- Stream refs ---

#[tokio::test]
async fn test_stream_ref_from_plain_call() -> anyhow::Result<()> {
    let remote = Arc::new(remote(0, 0));
    let dispatcher = Dispatcher::new(remote.clone(), BridgeConfig::default());

    let (args, kwargs) = count(3);
    let Value::StreamRef(stream) = dispatcher.call_dynamic("gen", "count", args, kwargs, &CallOptions::new()).await?
    else {
        panic!("expected a stream ref");
    };
    assert_eq!(stream.handle.type_name.as_deref(), Some("generator"));

    let mut seen = Vec::new();
    let report = dispatcher
        .stream_ref(&stream, &CallOptions::new(), |item| {
            seen.push(item);
            Flow::Continue
        })
        .await?;

    assert_eq!(report.end, StreamEnd::Done);
    assert_eq!(seen, ints(0..3));
    // Caller-owned: still registered until released.
    assert!(remote.holds(&stream.handle.id));
    assert!(dispatcher.release_ref(&stream.handle).await?);
    Ok(())
}
