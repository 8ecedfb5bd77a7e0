//! The remote side of the bridge, in process.
//!
//! [`ObjectRegistry`] is the contract every remote implementation keeps for
//! live objects. [`LocalRemote`] is an [`Executor`](crate::transport::Executor)
//! that runs Rust closures in place of an interpreter, which is enough to
//! drive the whole host stack end to end.

pub mod local;
pub mod registry;

pub use local::LocalRemote;
pub use local::RemoteObject;
pub use local::RemoteResult;
pub use local::RemoteValue;
pub use registry::ObjectRegistry;
pub use registry::RegistryError;
