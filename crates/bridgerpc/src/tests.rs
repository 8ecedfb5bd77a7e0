use std::collections::BTreeMap;

use crate::control::Handshake;
use crate::control::ReleaseRef;
use crate::control::ReleaseSession;
use crate::*;
use bridgepack::Handle;
use bridgepack::SessionId;
use bridgepack::Value;
use serde_json::json;

fn handle(id: &str, session: &str) -> Handle {
    Handle::new(id.into(), session.into(), "pkg.models").with_type_name("Model")
}

fn kwargs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// ============================================================================
//  CALL PAYLOADS
// ============================================================================

#[test]
fn test_function_payload_fields() {
    let payload = CallPayload::new(
        CallShape::Function { module: "numpy.linalg".into(), function: "norm".into() },
        vec![Value::list([Value::Int(1), Value::Int(2), Value::Int(3)])],
        kwargs(&[("ord", Value::Int(2))]),
    )
    .with_session(Some(SessionId::from("s1")));

    let wire = payload.to_wire().unwrap();
    assert_eq!(wire["protocol_version"], PROTOCOL_VERSION);
    assert_eq!(wire["min_supported_version"], MIN_SUPPORTED_VERSION);
    assert_eq!(wire["call_type"], "function");
    assert_eq!(wire["library"], "numpy");
    assert_eq!(wire["remote_module"], "numpy.linalg");
    assert_eq!(wire["function_or_method"], "norm");
    assert_eq!(wire["args"], json!([[1, 2, 3]]));
    assert_eq!(wire["kwargs"], json!({ "ord": 2 }));
    assert_eq!(wire["idempotent"], false);
    assert_eq!(wire["session_id"], "s1");
    assert!(wire.get("instance").is_none());
}

#[test]
fn test_method_payload_carries_instance() {
    let payload = CallPayload::new(
        CallShape::Method { target: handle("h1", "s1"), method: "fit".into() },
        vec![],
        BTreeMap::new(),
    );
    let wire = payload.to_wire().unwrap();
    assert_eq!(wire["call_type"], "method");
    assert_eq!(wire["library"], "pkg");
    assert_eq!(wire["remote_module"], "pkg.models");
    assert_eq!(wire["instance"]["__type__"], "ref");
    assert_eq!(wire["instance"]["id"], "h1");
    assert_eq!(wire["session_id"], json!(null));
}

#[test]
fn test_payload_decode_restores_shape() {
    let shapes = vec![
        CallShape::Function { module: "m.a".into(), function: "f".into() },
        CallShape::Method { target: handle("h", "s"), method: "go".into() },
        CallShape::Constructor { module: "m".into(), class: "Thing".into() },
        CallShape::Dynamic { module: "m".into(), function: "g".into() },
        CallShape::DynamicStream { module: "m".into(), function: "gen".into() },
        CallShape::Helper { name: "lib.parse".into() },
        CallShape::GetAttr { target: handle("h", "s"), attr: "shape".into() },
        CallShape::SetAttr { target: handle("h", "s"), attr: "name".into() },
        CallShape::ModuleAttr { module: "math".into(), attr: "pi".into() },
    ];

    for shape in shapes {
        let payload = CallPayload::new(shape.clone(), vec![Value::tuple([Value::Int(1), Value::Int(2)])], BTreeMap::new())
            .with_idempotent(true)
            .with_session(Some("s".into()));
        let decoded = CallPayload::from_wire(&payload.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, payload, "shape {}", shape);
    }
}

#[test]
fn test_unencodable_argument_is_codec_error() {
    let payload = CallPayload::new(
        CallShape::Function { module: "m".into(), function: "f".into() },
        vec![Value::Set(vec![Value::list([Value::Int(1)])])],
        BTreeMap::new(),
    );
    assert!(matches!(payload.to_wire(), Err(Error::Codec(bridgepack::Error::Encode { .. }))));
}

#[test]
fn test_method_without_instance_is_rejected() {
    let wire = json!({
        "protocol_version": 1, "call_type": "method", "function_or_method": "fit"
    });
    assert_eq!(CallPayload::from_wire(&wire), Err(Error::MissingField("instance")));
}

#[test]
fn test_call_type_spellings() {
    assert_eq!(CallType::Constructor.to_string(), "constructor");
    assert_eq!(CallType::DynamicStream.to_string(), "dynamic-stream");
    for older in ["class", "constructor"] {
        assert_eq!(older.parse::<CallType>(), Ok(CallType::Constructor));
    }
    for older in ["dynamic-stream", "dynamic_stream", "stream"] {
        assert_eq!(older.parse::<CallType>(), Ok(CallType::DynamicStream));
    }
}

#[test]
fn test_unknown_call_type_is_rejected() {
    let wire = json!({
        "protocol_version": 1, "call_type": "teleport", "function_or_method": "x"
    });
    assert_eq!(CallPayload::from_wire(&wire), Err(Error::UnknownCallType("teleport".into())));
}

#[test]
fn test_unknown_envelope_fields_are_ignored() {
    let wire = json!({
        "protocol_version": 1, "call_type": "function",
        "remote_module": "m", "function_or_method": "f",
        "trace_id": "abc", "priority": 9
    });
    let payload = CallPayload::from_wire(&wire).unwrap();
    assert_eq!(payload.min_supported_version, 1);
    assert!(payload.args.is_empty());
    assert!(!payload.idempotent);
}

#[test]
fn test_non_object_payload_is_violation() {
    assert!(matches!(CallPayload::from_wire(&json!([1, 2])), Err(Error::ProtocolViolation(_))));
    assert!(matches!(
        CallPayload::from_wire(&json!({ "protocol_version": "one" })),
        Err(Error::ProtocolViolation(_))
    ));
}

#[test]
fn test_helper_shape_derives_module_and_library() {
    let shape = CallShape::Helper { name: "sympy.parsing.parse_expr".into() };
    assert_eq!(shape.library(), "sympy");
    assert_eq!(shape.remote_module(), "sympy.parsing");
    assert_eq!(shape.function_or_method(), "sympy.parsing.parse_expr");
}

// ============================================================================
//  STREAM CHUNKS
// ============================================================================

#[test]
fn test_chunk_kinds() {
    let chunks = vec![
        StreamChunk::Item(Value::Float(f64::NAN)),
        StreamChunk::KeepAlive,
        StreamChunk::Done,
        StreamChunk::Failed(RemoteFailure::new("ValueError", "bad")),
    ];
    for chunk in chunks {
        let back = StreamChunk::from_wire(&chunk.to_wire().unwrap()).unwrap();
        assert_eq!(back, chunk);
    }
}

#[test]
fn test_terminal_chunks() {
    assert!(StreamChunk::Done.is_terminal());
    assert!(StreamChunk::Failed(RemoteFailure::new("E", "m")).is_terminal());
    assert!(!StreamChunk::KeepAlive.is_terminal());
    assert!(!StreamChunk::Item(Value::Null).is_terminal());
}

#[test]
fn test_item_chunk_requires_data() {
    assert_eq!(StreamChunk::from_wire(&json!({ "chunk": "item" })), Err(Error::MissingField("data")));
    assert!(matches!(
        StreamChunk::from_wire(&json!({ "chunk": "bogus" })),
        Err(Error::ProtocolViolation(_))
    ));
}

// ============================================================================
//  FAILURES
// ============================================================================

#[test]
fn test_failure_wire_fields() {
    let failure = RemoteFailure::new("KeyError", "no such ref")
        .with_code(FailureCode::RefNotFound)
        .with_traceback("Traceback...")
        .with_detail("ref_id", "h1");
    let wire = failure.to_wire();
    assert_eq!(wire["error_type"], "KeyError");
    assert_eq!(wire["code"], "ref_not_found");
    assert_eq!(wire["details"]["ref_id"], "h1");
    assert_eq!(RemoteFailure::from_wire(&wire), failure);
}

#[test]
fn test_failure_accepts_error_alias_and_strings() {
    let f = RemoteFailure::from_wire(&json!({ "error": "boom", "error_type": "RuntimeError" }));
    assert_eq!(f.message, "boom");
    assert_eq!(f.to_string(), "RuntimeError: boom");

    let f = RemoteFailure::from_wire(&json!("plain text"));
    assert_eq!(f.error_type, "");
    assert_eq!(f.to_string(), "plain text");
}

#[test]
fn test_unknown_failure_code_is_preserved() {
    let f = RemoteFailure::from_wire(&json!({ "message": "m", "code": "quota" }));
    assert_eq!(f.code, Some(FailureCode::Other("quota".into())));
}

// ============================================================================
//  CONTROL MESSAGES
// ============================================================================

#[test]
fn test_handshake_compatibility() {
    let host = Handshake::default();
    assert!(host.compatible_with(&Handshake::default()));

    let newer = Handshake { protocol_version: 3, min_supported_version: 2, supports_streaming: true };
    assert!(!host.compatible_with(&newer));

    let wide = Handshake { protocol_version: 3, min_supported_version: 1, supports_streaming: false };
    assert!(host.compatible_with(&wide));

    let picky_host = Handshake { protocol_version: 2, min_supported_version: 2, supports_streaming: true };
    assert!(!picky_host.compatible_with(&Handshake::default()));
}

#[test]
fn test_handshake_wire() {
    let hs = Handshake { protocol_version: 2, min_supported_version: 1, supports_streaming: false };
    assert_eq!(Handshake::from_wire(&hs.to_wire()).unwrap(), hs);

    let minimal = Handshake::from_wire(&json!({ "protocol_version": 4 })).unwrap();
    assert_eq!(minimal.min_supported_version, 4);
    assert!(minimal.supports_streaming);
}

#[test]
fn test_release_messages() {
    let rr = ReleaseRef { session_id: "s1".into(), handle_id: "h9".into() };
    assert_eq!(ReleaseRef::from_wire(&rr.to_wire()).unwrap(), rr);

    let rs = ReleaseSession { session_id: "s1".into() };
    assert_eq!(ReleaseSession::from_wire(&rs.to_wire()).unwrap(), rs);

    assert_eq!(ReleaseRef::from_wire(&json!({ "session_id": "s" })), Err(Error::MissingField("ref_id")));
}

// ============================================================================
//  BATCHES
// ============================================================================

#[test]
fn test_batch_reply_keeps_order_and_failures() {
    let reply = BatchReply {
        results: vec![
            Ok(json!(4.0)),
            Err(RemoteFailure::new("ValueError", "math domain error").with_traceback("tb")),
            Ok(json!(6)),
        ],
    };
    let wire = reply.to_wire();
    assert_eq!(wire[0], json!({"success": true, "result": 4.0}));
    assert_eq!(wire[1]["success"], false);
    assert_eq!(wire[1]["error"]["error_type"], "ValueError");
    assert_eq!(BatchReply::from_wire(&wire), Ok(reply));
}

#[test]
fn test_batch_reply_accepts_flat_failures() {
    let wire = json!([
        {"success": false, "error": "No module named 'nope'", "error_type": "ModuleNotFoundError"},
    ]);
    let reply = BatchReply::from_wire(&wire).unwrap();
    let failure = reply.results[0].clone().unwrap_err();
    assert_eq!(failure.error_type, "ModuleNotFoundError");
    assert_eq!(failure.message, "No module named 'nope'");
}

#[test]
fn test_malformed_batches_are_rejected() {
    assert_eq!(BatchCall::from_wire(&json!({})), Err(Error::MissingField("calls")));
    assert!(matches!(BatchCall::from_wire(&json!({"calls": 3})), Err(Error::ProtocolViolation(_))));
    assert!(matches!(BatchReply::from_wire(&json!({"results": []})), Err(Error::ProtocolViolation(_))));
    assert_eq!(BatchReply::from_wire(&json!([{"result": 1}])), Err(Error::MissingField("success")));
}
