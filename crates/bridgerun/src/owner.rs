//! Execution-context identity and exit observation.
//!
//! An [`Owner`] stands for one caller context: a task, a worker, a request.
//! Clones share the identity; the owner has exited once every clone has
//! been dropped. An [`OwnerWatch`] resolves at that moment, which is how the
//! session registry learns that a session's remote objects can go.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::watch;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Strong type for owner identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

struct Inner {
    id: OwnerId,
    identity: String,
    // Never sent on; dropping it is the exit signal.
    exit: watch::Sender<()>,
}

/// A live execution context.
#[derive(Clone)]
pub struct Owner {
    inner: Arc<Inner>,
}

impl Owner {
    /// Creates a new owner. `identity` is a human-readable label that also
    /// seeds generated session ids.
    pub fn new(identity: impl Into<String>) -> Self {
        let (exit, _) = watch::channel(());
        Self {
            inner: Arc::new(Inner {
                id: OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed)),
                identity: identity.into(),
                exit,
            }),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.inner.id
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Returns a watch that resolves once this owner has exited.
    pub fn watch(&self) -> OwnerWatch {
        OwnerWatch {
            id: self.inner.id,
            rx: self.inner.exit.subscribe(),
        }
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .finish()
    }
}

/// Observes the exit of one [`Owner`] without keeping it alive.
pub struct OwnerWatch {
    id: OwnerId,
    rx: watch::Receiver<()>,
}

impl OwnerWatch {
    pub fn owner_id(&self) -> OwnerId {
        self.id
    }

    /// Resolves when the last clone of the owner is dropped.
    pub async fn exited(mut self) {
        while self.rx.changed().await.is_ok() {}
    }
}
