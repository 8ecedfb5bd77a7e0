//! Opaque references to objects that live on the remote side.
//!
//! A [`Handle`] is only meaningful together with its [`SessionId`]: two
//! handles with the same id but different sessions name different objects.
//! The host never owns the object behind a handle, it only carries the token.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;

use crate::SCHEMA_KEY;
use crate::SCHEMA_VERSION;
use crate::TYPE_KEY;
use crate::Wire;
use crate::error::Error;
use crate::error::Result;

/// Strong type for session identifiers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Strong type for the process-unique token naming a remote object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(String);

impl HandleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifies one non-copyable remote object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub id: HandleId,
    pub session_id: SessionId,
    /// Dotted module path of the object's type on the remote side.
    pub remote_module: String,
    /// First segment of `remote_module`.
    pub library: String,
    /// Remote type name, for diagnostics only.
    pub type_name: Option<String>,
    pub schema_version: u32,
}

impl Handle {
    pub fn new(id: HandleId, session_id: SessionId, remote_module: impl Into<String>) -> Self {
        let remote_module = remote_module.into();
        let library = library_of(&remote_module).to_string();
        Self {
            id,
            session_id,
            remote_module,
            library,
            type_name: None,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Encodes this handle as a tagged `ref` object.
    pub fn to_wire(&self) -> Wire {
        Wire::Object(self.wire_fields("ref"))
    }

    /// Decodes a tagged `ref` object. The `__type__` tag itself is not checked.
    pub fn from_wire(map: &Map<String, Wire>) -> Result<Self> {
        let schema_version = match map.get(SCHEMA_KEY) {
            None => SCHEMA_VERSION,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Error::decode("ref has a non-integer __schema__"))?,
        };
        if schema_version > SCHEMA_VERSION {
            return Err(Error::decode(format!(
                "ref schema {} is newer than supported schema {}",
                schema_version, SCHEMA_VERSION
            )));
        }

        let id = required_str(map, "id")?;
        let session_id = required_str(map, "session_id")?;
        let remote_module = optional_str(map, "remote_module")?.unwrap_or_default();
        let library = match optional_str(map, "library")? {
            Some(lib) if !lib.is_empty() => lib,
            _ => library_of(&remote_module).to_string(),
        };
        let type_name = optional_str(map, "type_name")?;

        Ok(Self {
            id: HandleId(id),
            session_id: SessionId(session_id),
            remote_module,
            library,
            type_name,
            schema_version,
        })
    }

    fn wire_fields(&self, tag: &str) -> Map<String, Wire> {
        let mut map = Map::new();
        map.insert(TYPE_KEY.into(), Wire::from(tag));
        map.insert(SCHEMA_KEY.into(), Wire::from(self.schema_version));
        map.insert("id".into(), Wire::from(self.id.as_str()));
        map.insert("session_id".into(), Wire::from(self.session_id.as_str()));
        map.insert("remote_module".into(), Wire::from(self.remote_module.as_str()));
        map.insert("library".into(), Wire::from(self.library.as_str()));
        if let Some(type_name) = &self.type_name {
            map.insert("type_name".into(), Wire::from(type_name.as_str()));
        }
        map
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.type_name {
            Some(ty) => write!(f, "<ref {}.{} {}@{}>", self.remote_module, ty, self.id, self.session_id),
            None => write!(f, "<ref {} {}@{}>", self.remote_module, self.id, self.session_id),
        }
    }
}

/// What kind of remote iterable a [`StreamHandle`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Generator,
    Iterator,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Iterator => "iterator",
        }
    }
}

/// A handle to a remote generator or iterator.
///
/// Addressed exactly like a [`Handle`]; the extra kind tells a consumer the
/// object supports the `__next__` protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub handle: Handle,
    pub kind: StreamKind,
}

impl StreamHandle {
    pub fn new(handle: Handle, kind: StreamKind) -> Self {
        Self { handle, kind }
    }

    /// Encodes this handle as a tagged `stream_ref` object.
    pub fn to_wire(&self) -> Wire {
        let mut map = self.handle.wire_fields("stream_ref");
        map.insert("stream_type".into(), Wire::from(self.kind.as_str()));
        Wire::Object(map)
    }

    pub fn from_wire(map: &Map<String, Wire>) -> Result<Self> {
        let handle = Handle::from_wire(map)?;
        let kind = match optional_str(map, "stream_type")?.as_deref() {
            Some("generator") => StreamKind::Generator,
            Some("iterator") | None => StreamKind::Iterator,
            Some(other) => return Err(Error::decode(format!("unknown stream_type '{}'", other))),
        };
        Ok(Self { handle, kind })
    }
}

/// Top-level library name of a dotted module path.
fn library_of(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

fn required_str(map: &Map<String, Wire>, key: &str) -> Result<String> {
    optional_str(map, key)?.ok_or_else(|| Error::decode(format!("ref is missing '{}'", key)))
}

fn optional_str(map: &Map<String, Wire>, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Wire::Null) => Ok(None),
        Some(Wire::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Error::decode(format!("ref field '{}' must be a string, got {}", key, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_derived_from_module() {
        let h = Handle::new("h1".into(), "s1".into(), "numpy.linalg");
        assert_eq!(h.library, "numpy");
        assert_eq!(h.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_wire_shape_matches_ref_contract() {
        let h = Handle::new("abc".into(), "s1".into(), "pkg.mod").with_type_name("Thing");
        let wire = h.to_wire();
        assert_eq!(wire["__type__"], "ref");
        assert_eq!(wire["__schema__"], 1);
        assert_eq!(wire["id"], "abc");
        assert_eq!(wire["session_id"], "s1");
        assert_eq!(wire["remote_module"], "pkg.mod");
        assert_eq!(wire["library"], "pkg");
        assert_eq!(wire["type_name"], "Thing");
    }

    #[test]
    fn test_missing_library_is_derived() {
        let wire = serde_json::json!({
            "__type__": "ref", "id": "x", "session_id": "s", "remote_module": "a.b.c"
        });
        let h = Handle::from_wire(wire.as_object().unwrap()).unwrap();
        assert_eq!(h.library, "a");
        assert_eq!(h.type_name, None);
    }

    #[test]
    fn test_missing_session_is_rejected() {
        let wire = serde_json::json!({ "__type__": "ref", "id": "x" });
        let err = Handle::from_wire(wire.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Decode(msg) if msg.contains("session_id")));
    }

    #[test]
    fn test_future_schema_is_rejected() {
        let wire = serde_json::json!({
            "__type__": "ref", "__schema__": 7, "id": "x", "session_id": "s"
        });
        assert!(Handle::from_wire(wire.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_stream_kind_defaults_to_iterator() {
        let wire = serde_json::json!({
            "__type__": "stream_ref", "id": "x", "session_id": "s", "remote_module": "m"
        });
        let sh = StreamHandle::from_wire(wire.as_object().unwrap()).unwrap();
        assert_eq!(sh.kind, StreamKind::Iterator);
    }
}
