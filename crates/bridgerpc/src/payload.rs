//! # Call Payloads
//!
//! The envelope handed to the remote side for every non-control call.
//!
//! ```json
//! {
//!   "protocol_version": 1, "min_supported_version": 1,
//!   "call_type": "method",
//!   "library": "numpy", "remote_module": "numpy.linalg",
//!   "function_or_method": "norm",
//!   "instance": { "__type__": "ref", ... },
//!   "args": [], "kwargs": {},
//!   "idempotent": false, "session_id": "s1"
//! }
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: [`CallPayload::from_wire`] returns `Result` for any input.
//! - **Forward Compatibility**: Unknown envelope fields are ignored.
//! - `library`, `remote_module` and `function_or_method` are derived from the
//!   shape on encode and re-checked against it on decode.

use std::collections::BTreeMap;

use bridgepack::Handle;
use bridgepack::SessionId;
use bridgepack::Value;
use bridgepack::Wire;
use serde_json::Map;

use crate::MIN_SUPPORTED_VERSION;
use crate::PROTOCOL_VERSION;
use crate::error::Error;
use crate::error::Result;
use crate::shape::CallShape;
use crate::shape::CallType;

/// One outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPayload {
    pub protocol_version: u32,
    pub min_supported_version: u32,
    pub shape: CallShape,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    /// The caller promises the call may be repeated without harm.
    pub idempotent: bool,
    pub session_id: Option<SessionId>,
}

impl CallPayload {
    pub fn new(shape: CallShape, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_supported_version: MIN_SUPPORTED_VERSION,
            shape,
            args,
            kwargs,
            idempotent: false,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn call_type(&self) -> CallType {
        self.shape.call_type()
    }

    /// Encodes the payload, lowering every argument through `bridgepack`.
    ///
    /// # Errors
    /// Returns [`Error::Codec`] when an argument cannot be encoded. Nothing
    /// has been sent at that point.
    pub fn to_wire(&self) -> Result<Wire> {
        let mut map = Map::new();
        map.insert("protocol_version".into(), Wire::from(self.protocol_version));
        map.insert("min_supported_version".into(), Wire::from(self.min_supported_version));
        map.insert("call_type".into(), Wire::from(self.call_type().as_str()));
        map.insert("library".into(), Wire::from(self.shape.library()));
        map.insert("remote_module".into(), Wire::from(self.shape.remote_module()));
        map.insert("function_or_method".into(), Wire::from(self.shape.function_or_method()));
        if let Some(target) = self.shape.target() {
            map.insert("instance".into(), target.to_wire());
        }

        map.insert("args".into(), Wire::Array(bridgepack::encode_all(&self.args)?));
        let mut kwargs = Map::with_capacity(self.kwargs.len());
        for (k, v) in &self.kwargs {
            kwargs.insert(k.clone(), bridgepack::encode(v)?);
        }
        map.insert("kwargs".into(), Wire::Object(kwargs));

        map.insert("idempotent".into(), Wire::Bool(self.idempotent));
        map.insert(
            "session_id".into(),
            self.session_id.as_ref().map(|s| Wire::from(s.as_str())).unwrap_or(Wire::Null),
        );
        Ok(Wire::Object(map))
    }

    /// Decodes a payload received by the remote side.
    ///
    /// Version fields are read but not judged; whether a version is
    /// acceptable is the receiver's decision.
    pub fn from_wire(wire: &Wire) -> Result<Self> {
        let map = wire
            .as_object()
            .ok_or_else(|| Error::ProtocolViolation(format!("call payload must be an object, got {}", wire)))?;

        let protocol_version = version_field(map, "protocol_version")?.ok_or(Error::MissingField("protocol_version"))?;
        let min_supported_version = version_field(map, "min_supported_version")?.unwrap_or(protocol_version);

        let call_type: CallType = str_field(map, "call_type")?.ok_or(Error::MissingField("call_type"))?.parse()?;
        let module = str_field(map, "remote_module")?.unwrap_or_default();
        let name = str_field(map, "function_or_method")?.ok_or(Error::MissingField("function_or_method"))?;

        let shape = match call_type {
            CallType::Function => CallShape::Function { module, function: name },
            CallType::Constructor => CallShape::Constructor { module, class: name },
            CallType::Dynamic => CallShape::Dynamic { module, function: name },
            CallType::DynamicStream => CallShape::DynamicStream { module, function: name },
            CallType::ModuleAttr => CallShape::ModuleAttr { module, attr: name },
            CallType::Helper => CallShape::Helper { name },
            CallType::Method => CallShape::Method { target: instance(map)?, method: name },
            CallType::GetAttr => CallShape::GetAttr { target: instance(map)?, attr: name },
            CallType::SetAttr => CallShape::SetAttr { target: instance(map)?, attr: name },
        };

        let args = match map.get("args") {
            None | Some(Wire::Null) => Vec::new(),
            Some(Wire::Array(items)) => bridgepack::decode_all(items)?,
            Some(other) => return Err(Error::ProtocolViolation(format!("args must be a list, got {}", other))),
        };
        let kwargs = match map.get("kwargs") {
            None | Some(Wire::Null) => BTreeMap::new(),
            Some(Wire::Object(kw)) => kw
                .iter()
                .map(|(k, v)| Ok((k.clone(), bridgepack::decode(v)?)))
                .collect::<Result<_>>()?,
            Some(other) => return Err(Error::ProtocolViolation(format!("kwargs must be a map, got {}", other))),
        };

        let idempotent = match map.get("idempotent") {
            None | Some(Wire::Null) => false,
            Some(Wire::Bool(b)) => *b,
            Some(other) => return Err(Error::ProtocolViolation(format!("idempotent must be a bool, got {}", other))),
        };
        let session_id = str_field(map, "session_id")?.map(SessionId::from);

        Ok(Self {
            protocol_version,
            min_supported_version,
            shape,
            args,
            kwargs,
            idempotent,
            session_id,
        })
    }
}

fn instance(map: &Map<String, Wire>) -> Result<Handle> {
    match map.get("instance") {
        Some(Wire::Object(obj)) => Ok(Handle::from_wire(obj)?),
        None | Some(Wire::Null) => Err(Error::MissingField("instance")),
        Some(other) => Err(Error::ProtocolViolation(format!("instance must be a ref, got {}", other))),
    }
}

pub(crate) fn str_field(map: &Map<String, Wire>, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Wire::Null) => Ok(None),
        Some(Wire::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::ProtocolViolation(format!("{} must be a string, got {}", key, other))),
    }
}

pub(crate) fn version_field(map: &Map<String, Wire>, key: &str) -> Result<Option<u32>> {
    match map.get(key) {
        None | Some(Wire::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| Error::ProtocolViolation(format!("{} must be a small unsigned integer, got {}", key, v))),
    }
}
