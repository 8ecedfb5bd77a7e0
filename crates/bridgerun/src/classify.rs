//! # Error Classifier
//!
//! Labels raw remote and transport failures with an [`ErrorKind`].
//!
//! Resolution order, first match wins:
//! 1. the structured `code` on a [`RemoteFailure`];
//! 2. array-domain patterns (shape, memory, dtype), which also yield a
//!    suggestion, tried only for classes an array library raises
//!    (`ValueError`, `RuntimeError`, `TypeError` or an unmapped class);
//! 3. the remote exception class name;
//! 4. message substrings, for remotes too old to send a code.
//!
//! The classifier never retries. It only labels.

use bridgepack::Wire;
use bridgerpc::FailureCode;
use bridgerpc::RemoteFailure;

use crate::error::BridgeError;
use crate::error::ErrorKind;
use crate::transport::ExecError;

/// Classifies an executor failure.
pub fn classify_exec(err: ExecError) -> BridgeError {
    match err {
        ExecError::Timeout => BridgeError::new(ErrorKind::Timeout, "call timed out"),
        ExecError::Unavailable(msg) => BridgeError::new(ErrorKind::TransportUnavailable, msg),
        ExecError::StreamingUnsupported(msg) => BridgeError::new(ErrorKind::StreamingUnsupported, msg),
        ExecError::Remote(failure) => classify_failure(&failure),
    }
}

/// Classifies a failure reported by the remote side.
pub fn classify_failure(failure: &RemoteFailure) -> BridgeError {
    let class = failure.error_type.rsplit('.').next().unwrap_or("");
    let mut error = match failure.code.as_ref().and_then(kind_of_code) {
        Some(kind) => BridgeError::new(kind, failure.message.clone()),
        None => {
            let by_class = kind_of_class(class);
            let refinable = matches!(
                by_class,
                None | Some(ErrorKind::ValueError | ErrorKind::RuntimeError | ErrorKind::TypeError)
            );
            match refinable.then(|| domain_error(class, &failure.message)).flatten() {
                Some(error) => error,
                None => {
                    let kind = by_class
                        .or_else(|| kind_of_message(&failure.message))
                        .unwrap_or(ErrorKind::Unknown);
                    if kind == ErrorKind::Unknown {
                        tracing::warn!(error_type = %failure.error_type, "unclassified remote failure: {}", failure.message);
                    }
                    BridgeError::new(kind, failure.message.clone())
                }
            }
        }
    };

    for (k, v) in &failure.details {
        error.details.entry(k.clone()).or_insert_with(|| v.clone());
    }
    if !failure.error_type.is_empty() {
        error.details.insert("error_type".into(), Wire::from(failure.error_type.as_str()));
    }
    error.with_traceback(failure.traceback.clone())
}

fn kind_of_code(code: &FailureCode) -> Option<ErrorKind> {
    match code {
        FailureCode::RefNotFound => Some(ErrorKind::RefNotFound),
        FailureCode::SessionMismatch => Some(ErrorKind::SessionMismatch),
        FailureCode::StreamingUnsupported => Some(ErrorKind::StreamingUnsupported),
        FailureCode::ProtocolVersion => Some(ErrorKind::ProtocolVersion),
        FailureCode::HelperDisabled => Some(ErrorKind::HelperDisabled),
        FailureCode::Other(_) => None,
    }
}

fn kind_of_class(class: &str) -> Option<ErrorKind> {
    Some(match class {
        "ValueError" | "UnicodeError" => ErrorKind::ValueError,
        "TypeError" => ErrorKind::TypeError,
        "ImportError" | "ModuleNotFoundError" => ErrorKind::ImportError,
        "AttributeError" => ErrorKind::AttributeError,
        "KeyError" => ErrorKind::KeyError,
        "IndexError" => ErrorKind::IndexError,
        "RuntimeError" | "NotImplementedError" | "RecursionError" => ErrorKind::RuntimeError,
        "DecodeError" | "JSONDecodeError" | "UnicodeDecodeError" | "SerializationError" => ErrorKind::Decoding,
        "StopIteration" | "StopAsyncIteration" => ErrorKind::StopIteration,
        "TimeoutError" => ErrorKind::Timeout,
        "ConnectionError" | "BrokenPipeError" => ErrorKind::TransportUnavailable,
        "RefNotFoundError" | "RefNotFound" => ErrorKind::RefNotFound,
        "SessionMismatchError" | "SessionMismatch" => ErrorKind::SessionMismatch,
        "ProtocolVersionError" => ErrorKind::ProtocolVersion,
        _ => return None,
    })
}

fn kind_of_message(message: &str) -> Option<ErrorKind> {
    let msg = message.to_ascii_lowercase();
    let has = |needle: &str| msg.contains(needle);
    if has("streaming not supported") || has("does not support streaming") || has("streaming is not supported") {
        Some(ErrorKind::StreamingUnsupported)
    } else if has("session mismatch") || has("belongs to session") {
        Some(ErrorKind::SessionMismatch)
    } else if has("ref not found") || has("unknown ref") || has("ref has been released") {
        Some(ErrorKind::RefNotFound)
    } else if has("protocol version") {
        Some(ErrorKind::ProtocolVersion)
    } else {
        None
    }
}

// ============================================================================
//  DOMAIN SUBTYPES
// ============================================================================

fn domain_error(class: &str, message: &str) -> Option<BridgeError> {
    let msg = message.to_ascii_lowercase();
    if class == "MemoryError" || class == "OutOfMemoryError" || msg.contains("out of memory") {
        return Some(memory_error(message, &msg));
    }
    if is_shape_message(&msg) {
        return Some(shape_error(message, &msg));
    }
    if msg.contains("dtype") || msg.contains("expected scalar type") {
        return Some(dtype_error(message));
    }
    None
}

fn is_shape_message(msg: &str) -> bool {
    (msg.contains("shapes") && (msg.contains("not aligned") || msg.contains("broadcast") || msg.contains("cannot be multiplied")))
        || msg.contains("shape mismatch")
        || msg.contains("size mismatch")
}

fn shape_error(message: &str, msg: &str) -> BridgeError {
    let shapes = parse_shapes(message);
    let mut error = BridgeError::new(ErrorKind::ShapeMismatch, message);
    if let [a, b, ..] = shapes.as_slice() {
        error = error
            .with_detail("shape_a", shape_wire(a))
            .with_detail("shape_b", shape_wire(b));
        let matmul = msg.contains("not aligned") || msg.contains("cannot be multiplied");
        if let Some(hint) = shape_suggestion(a, b, matmul) {
            error = error.with_suggestion(hint);
        }
    }
    error
}

fn shape_suggestion(a: &[u64], b: &[u64], matmul: bool) -> Option<String> {
    if let (true, [m, k1], [k2, n]) = (matmul, a, b) {
        if k1 == n {
            return Some(format!(
                "transpose the second operand: {} -> {}",
                fmt_shape(b),
                fmt_shape(&[*n, *k2])
            ));
        }
        if m == k2 {
            return Some(format!(
                "transpose the first operand: {} -> {}",
                fmt_shape(a),
                fmt_shape(&[*k1, *m])
            ));
        }
        return Some(format!(
            "the inner dimensions differ ({} vs {}); reshape the second operand to ({}, -1)",
            k1, k2, k1
        ));
    }
    let (size_a, size_b) = (element_count(a), element_count(b));
    if size_a.is_some() && size_a == size_b && a != b {
        return Some(format!("reshape the second operand to {}", fmt_shape(a)));
    }
    if !matmul {
        return Some(format!(
            "operands {} and {} do not broadcast; trailing dimensions must match or be 1",
            fmt_shape(a),
            fmt_shape(b)
        ));
    }
    None
}

/// Total element count, or `None` when it does not fit in a `u64`.
fn element_count(dims: &[u64]) -> Option<u64> {
    dims.iter().try_fold(1u64, |acc, d| acc.checked_mul(*d))
}

/// Pulls every shape out of a message: `(3, 4)`, `(3,)` and torch's
/// `(2x3 and 4x5)` forms.
fn parse_shapes(message: &str) -> Vec<Vec<u64>> {
    let mut shapes = Vec::new();
    let mut rest = message;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(')') else { break };
        let group = &after[..close];
        if group.contains(" and ") {
            shapes.extend(group.split(" and ").filter_map(|part| parse_dims(part, 'x')));
        } else if let Some(dims) = parse_dims(group, ',') {
            shapes.push(dims);
        }
        rest = &after[close + 1..];
    }
    shapes
}

fn parse_dims(group: &str, sep: char) -> Option<Vec<u64>> {
    let dims = group
        .split(sep)
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if dims.is_empty() { None } else { Some(dims) }
}

fn fmt_shape(dims: &[u64]) -> String {
    match dims {
        [only] => format!("({},)", only),
        _ => format!("({})", dims.iter().map(u64::to_string).collect::<Vec<_>>().join(", ")),
    }
}

fn shape_wire(dims: &[u64]) -> Wire {
    Wire::Array(dims.iter().map(|d| Wire::from(*d)).collect())
}

fn memory_error(message: &str, msg: &str) -> BridgeError {
    let mut error = BridgeError::new(ErrorKind::OutOfMemory, message);
    let requested = amount_after(message, "allocate ");
    let total = amount_before(message, " total capacity");
    let free = amount_before(message, " free");
    let on_gpu = msg.contains("cuda") || msg.contains("gpu");

    if let Some(r) = &requested {
        error = error.with_detail("requested", r.as_str());
    }
    if let Some(t) = &total {
        error = error.with_detail("total_capacity", t.as_str());
    }
    if let Some(f) = &free {
        error = error.with_detail("available", f.as_str());
    }
    error = error.with_detail("device", if on_gpu { "gpu" } else { "cpu" });

    let mut hint = match (&requested, &free) {
        (Some(r), Some(f)) => format!("the call needed {} but only {} was free; reduce the batch size", r, f),
        (Some(r), None) => format!("the call needed {}; reduce the batch size", r),
        _ => "reduce the batch size or the size of the inputs".to_string(),
    };
    if on_gpu {
        hint.push_str(", or move the computation to CPU");
    }
    error.with_suggestion(hint)
}

/// The `<number> <unit>` pair right after `phrase`.
fn amount_after(message: &str, phrase: &str) -> Option<String> {
    let start = message.find(phrase)? + phrase.len();
    let mut tokens = message[start..].split_whitespace();
    amount(tokens.next()?, tokens.next()?)
}

/// The `<number> <unit>` pair right before `phrase`.
fn amount_before(message: &str, phrase: &str) -> Option<String> {
    let end = message.find(phrase)?;
    let mut tokens = message[..end].split_whitespace().rev();
    let unit = tokens.next()?;
    let number = tokens.next()?;
    amount(number, unit)
}

fn amount(number: &str, unit: &str) -> Option<String> {
    let number = number.trim_matches(|c: char| c == '(' || c == ';' || c == ',');
    let unit = unit.trim_matches(|c: char| c == ')' || c == ';' || c == ',' || c == '.');
    number.parse::<f64>().ok()?;
    Some(format!("{} {}", number, unit))
}

fn dtype_error(message: &str) -> BridgeError {
    let mut error = BridgeError::new(ErrorKind::DtypeMismatch, message);

    // torch: "expected scalar type Float but found Double"
    if let (Some(expected), Some(actual)) =
        (word_after(message, "expected scalar type "), word_after(message, "but found "))
    {
        error = error.with_detail("expected", expected.as_str()).with_detail("actual", actual.as_str());
        if let Some(torch) = torch_dtype(&expected) {
            error = error.with_suggestion(format!("convert the input with .to(torch.{})", torch));
        }
        return error;
    }

    // numpy: "Cannot cast array data from dtype('float64') to dtype('int64')"
    let quoted = quoted_dtypes(message);
    if let [actual, expected, ..] = quoted.as_slice() {
        error = error
            .with_detail("expected", expected.as_str())
            .with_detail("actual", actual.as_str())
            .with_suggestion(format!("cast the input with .astype('{}')", expected));
    }
    error
}

fn word_after(message: &str, phrase: &str) -> Option<String> {
    let start = message.find(phrase)? + phrase.len();
    let word: String = message[start..].chars().take_while(|c| c.is_alphanumeric() || *c == '_').collect();
    if word.is_empty() { None } else { Some(word) }
}

fn quoted_dtypes(message: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = message;
    while let Some(i) = rest.find("dtype('") {
        let after = &rest[i + "dtype('".len()..];
        let Some(end) = after.find('\'') else { break };
        out.push(after[..end].to_string());
        rest = &after[end..];
    }
    out
}

fn torch_dtype(name: &str) -> Option<&'static str> {
    Some(match name {
        "Float" => "float32",
        "Double" => "float64",
        "Half" => "float16",
        "BFloat16" => "bfloat16",
        "Long" => "int64",
        "Int" => "int32",
        "Short" => "int16",
        "Bool" => "bool",
        _ => return None,
    })
}
