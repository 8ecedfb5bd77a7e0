//! # bridgepack
//!
//! A small, opinionated codec for values crossing an interpreter boundary.
//!
//! The wire format is plain JSON. Anything JSON cannot say natively (tuples,
//! sets, non-finite floats, bytes, complex numbers, calendar types and
//! references to remote objects) travels as a tagged object:
//!
//! ```json
//! { "__type__": "tuple", "__schema__": 1, "elements": [1, 2] }
//! ```
//!
//! ## Invariants
//!
//! - **Round-trip**: `decode(&encode(&v)?)? == v` for every constructible `v`,
//!   under arbitrary nesting.
//! - **Panic Safety**: decoding never panics on untrusted input.
//! - **Forward Compatibility**: unknown `__type__` tags decode as plain maps.
//! - **Refs are opaque**: a [`Handle`] is decoded and later re-emitted
//!   verbatim. Only the side holding the live object assigns handle ids.

mod decode;
mod encode;
mod error;
mod handle;
mod serde_bridge;
mod value;

pub use decode::decode;
pub use decode::decode_all;
pub use encode::encode;
pub use encode::encode_all;
pub use error::Error;
pub use error::Result;
pub use handle::Handle;
pub use handle::HandleId;
pub use handle::SessionId;
pub use handle::StreamHandle;
pub use handle::StreamKind;
pub use serde_bridge::from_value;
pub use serde_bridge::to_value;
pub use value::Value;

/// Version of the tagged wire format produced by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Key carrying the tag of a tagged wire object.
pub const TYPE_KEY: &str = "__type__";

/// Key carrying the schema version of a tagged wire object.
pub const SCHEMA_KEY: &str = "__schema__";

/// The JSON representation everything is encoded into.
pub type Wire = serde_json::Value;
