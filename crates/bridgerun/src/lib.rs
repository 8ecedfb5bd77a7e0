//! # bridgerun
//!
//! Host runtime for calling into a remote interpreter: sessions, dispatch,
//! streaming and error classification on top of an [`Executor`].
//!
//! ## Architecture
//!
//! - [`Dispatcher`]: one method per call shape, plus streaming.
//! - [`SessionRegistry`]: which session each [`Owner`] uses, and cleanup
//!   when an owner exits.
//! - [`classify`]: turns remote and transport failures into a [`BridgeError`].
//! - [`remote`]: the remote side's object registry contract and an
//!   in-process remote.

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod owner;
pub mod remote;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod mock_transport;

pub use config::BridgeConfig;
pub use config::CallOptions;
pub use dispatch::BatchEntry;
pub use dispatch::Dispatcher;
pub use dispatch::Kwargs;
pub use error::BridgeError;
pub use error::ErrorKind;
pub use error::Result;
pub use owner::Owner;
pub use owner::OwnerId;
pub use session::Session;
pub use session::SessionRegistry;
pub use session::SessionSpec;
pub use stream::StreamEnd;
pub use stream::StreamReport;
pub use transport::ExecError;
pub use transport::ExecOptions;
pub use transport::Executor;
pub use transport::Flow;
