//! # Object Registry
//!
//! The remote side's arena of live objects, keyed by handle id and scoped by
//! session.
//!
//! ## Invariants
//! - Membership is exactly the set of outstanding handles.
//! - Every successful `resolve` refreshes the entry's access time.
//! - A handle presented under the wrong session is a [`RegistryError::SessionMismatch`],
//!   never a [`RegistryError::RefNotFound`].
//! - All operations run inside one critical section. None of them await.
//!
//! ## Eviction
//! `prune` first drops entries idle for longer than the TTL (skipped when
//! the TTL is zero), then drops least-recently-used entries until at most
//! `max_size` remain (skipped when `max_size` is zero).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use bridgepack::HandleId;
use bridgepack::SessionId;
use bridgerpc::FailureCode;
use bridgerpc::RemoteFailure;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("ref not found: {handle_id}")]
    RefNotFound { handle_id: HandleId },
    #[error("session mismatch: ref {handle_id} belongs to session {owner}, not {presented}")]
    SessionMismatch {
        handle_id: HandleId,
        owner: SessionId,
        presented: SessionId,
    },
}

impl From<RegistryError> for RemoteFailure {
    fn from(e: RegistryError) -> Self {
        let message = e.to_string();
        match e {
            RegistryError::RefNotFound { handle_id } => RemoteFailure::new("RefNotFoundError", message)
                .with_code(FailureCode::RefNotFound)
                .with_detail("ref_id", handle_id.as_str()),
            RegistryError::SessionMismatch { handle_id, owner, presented } => {
                RemoteFailure::new("SessionMismatchError", message)
                    .with_code(FailureCode::SessionMismatch)
                    .with_detail("ref_id", handle_id.as_str())
                    .with_detail("ref_session_id", owner.as_str())
                    .with_detail("session_id", presented.as_str())
            }
        }
    }
}

struct Entry<T> {
    session_id: SessionId,
    object: T,
    last_access: Instant,
    // Monotonic access order; ties in `last_access` are common under a
    // paused clock.
    tick: u64,
}

struct Inner<T> {
    entries: HashMap<HandleId, Entry<T>>,
    tick: u64,
}

impl<T> Inner<T> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Session-scoped store of remote objects.
pub struct ObjectRegistry<T> {
    inner: Mutex<Inner<T>>,
    ttl: Duration,
    max_size: usize,
}

impl<T: Clone> ObjectRegistry<T> {
    /// `ttl_seconds = 0` disables time-based eviction; `max_size = 0`
    /// disables capacity-based eviction.
    pub fn new(ttl_seconds: u64, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: HashMap::new(), tick: 0 }),
            ttl: Duration::from_secs(ttl_seconds),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `object` under `session_id` and returns its fresh handle id.
    pub fn store(&self, session_id: &SessionId, object: T) -> HandleId {
        let handle_id = HandleId::new(uuid::Uuid::new_v4().to_string());
        let mut inner = self.lock();
        let tick = inner.next_tick();
        inner.entries.insert(
            handle_id.clone(),
            Entry {
                session_id: session_id.clone(),
                object,
                last_access: Instant::now(),
                tick,
            },
        );
        self.prune_locked(&mut inner);
        tracing::debug!(session_id = %session_id, ref_id = %handle_id, "stored ref");
        handle_id
    }

    /// Looks an object up and marks it as used.
    pub fn resolve(&self, session_id: &SessionId, handle_id: &HandleId) -> Result<T, RegistryError> {
        let mut inner = self.lock();
        self.prune_locked(&mut inner);
        let tick = inner.next_tick();
        let entry = inner
            .entries
            .get_mut(handle_id)
            .ok_or_else(|| RegistryError::RefNotFound { handle_id: handle_id.clone() })?;
        if &entry.session_id != session_id {
            return Err(RegistryError::SessionMismatch {
                handle_id: handle_id.clone(),
                owner: entry.session_id.clone(),
                presented: session_id.clone(),
            });
        }
        entry.last_access = Instant::now();
        entry.tick = tick;
        Ok(entry.object.clone())
    }

    /// Drops one object. Returns `false` when nothing was registered under
    /// that id for that session.
    pub fn release(&self, session_id: &SessionId, handle_id: &HandleId) -> bool {
        let mut inner = self.lock();
        let owned = inner.entries.get(handle_id).is_some_and(|e| &e.session_id == session_id);
        if owned {
            inner.entries.remove(handle_id);
            tracing::debug!(session_id = %session_id, ref_id = %handle_id, "released ref");
        }
        owned
    }

    /// Drops every object of a session and returns how many went.
    pub fn release_session(&self, session_id: &SessionId) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| &e.session_id != session_id);
        let removed = before - inner.entries.len();
        tracing::debug!(session_id = %session_id, removed, "released session refs");
        removed
    }

    /// Runs TTL then LRU eviction and returns how many entries went.
    pub fn prune(&self) -> usize {
        let mut inner = self.lock();
        self.prune_locked(&mut inner)
    }

    fn prune_locked(&self, inner: &mut Inner<T>) -> usize {
        let before = inner.entries.len();

        if !self.ttl.is_zero() {
            let now = Instant::now();
            let ttl = self.ttl;
            inner.entries.retain(|_, e| now.duration_since(e.last_access) <= ttl);
        }

        if self.max_size > 0 && inner.entries.len() > self.max_size {
            let mut by_age: Vec<(u64, HandleId)> =
                inner.entries.iter().map(|(id, e)| (e.tick, id.clone())).collect();
            by_age.sort_unstable();
            let excess = inner.entries.len() - self.max_size;
            for (_, id) in by_age.into_iter().take(excess) {
                inner.entries.remove(&id);
            }
        }

        let evicted = before - inner.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = inner.entries.len(), "pruned refs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live objects held for one session.
    pub fn session_len(&self, session_id: &SessionId) -> usize {
        self.lock().entries.values().filter(|e| &e.session_id == session_id).count()
    }

    pub fn contains(&self, handle_id: &HandleId) -> bool {
        self.lock().entries.contains_key(handle_id)
    }
}
