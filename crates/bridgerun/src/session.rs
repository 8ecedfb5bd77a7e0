//! # Session Registry
//!
//! Host-side bookkeeping of which session each execution context uses.
//!
//! ## Philosophy
//!
//! - **Implicit by Default**: the first call from an [`Owner`] without a
//!   session creates one, named after the owner and a timestamp.
//! - **Cleanup Follows the Owner**: every owner with a session is watched.
//!   When it exits, its sessions are released on the remote side, so remote
//!   state does not outlive its user even with TTL eviction disabled.
//! - **Idempotent Lifecycle**: registering an existing id or releasing an
//!   unknown one succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bridgepack::SessionId;
use bridgerpc::control::ReleaseSession;
use bridgerpc::tool;
use chrono::DateTime;
use chrono::Utc;
use dashmap::DashMap;

use crate::classify::classify_exec;
use crate::error::Result;
use crate::owner::Owner;
use crate::owner::OwnerId;
use crate::transport::ExecError;
use crate::transport::ExecOptions;
use crate::transport::Executor;

/// Picks the session a call belongs to.
///
/// An explicit override wins, then the session embedded in the handle being
/// operated on, then the caller's current session.
pub fn resolve_session_id(
    explicit: Option<&SessionId>,
    handle: Option<&SessionId>,
    current: Option<&SessionId>,
) -> Option<SessionId> {
    explicit.or(handle).or(current).cloned()
}

/// Optional settings for an explicitly created session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSpec {
    /// Use this id instead of generating one.
    pub session_id: Option<SessionId>,
    pub max_handles: Option<usize>,
    pub ttl_seconds: Option<u64>,
    pub tags: BTreeMap<String, String>,
}

/// One registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub owner: OwnerId,
    pub created_at: DateTime<Utc>,
    pub max_handles: Option<usize>,
    pub ttl_seconds: Option<u64>,
    pub tags: BTreeMap<String, String>,
}

/// Concurrent map from sessions to their owners.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    current: DashMap<OwnerId, SessionId>,
    watched: DashMap<OwnerId, ()>,
    executor: Arc<dyn Executor>,
    release_timeout: Duration,
    last_stamp: AtomicI64,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(executor: Arc<dyn Executor>, release_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            sessions: DashMap::new(),
            current: DashMap::new(),
            watched: DashMap::new(),
            executor,
            release_timeout,
            last_stamp: AtomicI64::new(0),
            this: this.clone(),
        })
    }

    /// The session bound to `owner`, created and registered on first use.
    pub fn current_session(&self, owner: &Owner) -> SessionId {
        let mut created = false;
        let id = self
            .current
            .entry(owner.id())
            .or_insert_with(|| {
                created = true;
                self.generate_id(owner)
            })
            .clone();
        if created {
            self.insert(owner, id.clone(), SessionSpec::default());
            tracing::debug!(session_id = %id, owner = %owner.id(), "created implicit session");
        }
        id
    }

    /// The session bound to `owner`, if any, without creating one.
    pub fn bound_session(&self, owner: &Owner) -> Option<SessionId> {
        self.current.get(&owner.id()).map(|id| id.clone())
    }

    /// Resolves the session for a call, creating the owner's session only
    /// when neither an override nor a handle names one.
    pub fn resolve(&self, owner: &Owner, explicit: Option<&SessionId>, handle: Option<&SessionId>) -> SessionId {
        let bound = self.bound_session(owner);
        match resolve_session_id(explicit, handle, bound.as_ref()) {
            Some(id) => id,
            None => self.current_session(owner),
        }
    }

    /// Registers a session for `owner` and makes it the owner's current one.
    ///
    /// Registering an id that already exists returns it unchanged. A session
    /// keeps its first owner: another owner registering the same id is not
    /// bound to it, since the session goes away when its owner exits.
    pub fn create_session(&self, owner: &Owner, spec: SessionSpec) -> SessionId {
        let id = spec.session_id.clone().unwrap_or_else(|| self.generate_id(owner));
        let existing = self.sessions.get(&id).map(|e| e.value().owner);
        match existing {
            None => {
                self.insert(owner, id.clone(), spec);
                tracing::info!(session_id = %id, owner = %owner.id(), "created session");
            }
            Some(first) if first == owner.id() => {
                tracing::debug!(session_id = %id, "session already registered");
            }
            Some(first) => {
                tracing::warn!(
                    session_id = %id,
                    owner = %first,
                    requested_by = %owner.id(),
                    "session belongs to another owner; not rebinding"
                );
                return id;
            }
        }
        self.current.insert(owner.id(), id.clone());
        id
    }

    fn insert(&self, owner: &Owner, id: SessionId, spec: SessionSpec) {
        self.sessions.entry(id.clone()).or_insert_with(|| Session {
            id,
            owner: owner.id(),
            created_at: Utc::now(),
            max_handles: spec.max_handles,
            ttl_seconds: spec.ttl_seconds,
            tags: spec.tags,
        });
        self.watch(owner);
    }

    /// Drops every remote object of the session and forgets it locally.
    ///
    /// Releasing an unknown session succeeds.
    pub async fn release_session(&self, id: &SessionId) -> Result<()> {
        self.forget(id);
        let request = ReleaseSession { session_id: id.clone() };
        let opts = ExecOptions {
            timeout: self.release_timeout,
            session_id: Some(id.clone()),
            ..Default::default()
        };
        let released = tokio::time::timeout(
            self.release_timeout,
            self.executor.execute(tool::RELEASE_SESSION, request.to_wire(), &opts),
        )
        .await
        .unwrap_or(Err(ExecError::Timeout))
        .map_err(classify_exec)?;
        tracing::info!(session_id = %id, released = %released, "released session");
        Ok(())
    }

    /// Releases every registered session, whoever owns it.
    ///
    /// Every session is attempted; the first failure is returned.
    pub async fn release_all(&self) -> Result<()> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.release_session(&id).await {
                tracing::warn!(session_id = %id, "failed to release session: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn forget(&self, id: &SessionId) {
        self.sessions.remove(id);
        self.current.retain(|_, bound| *bound != *id);
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// `<identity>-<owner>-<micros>`, with micros strictly increasing across
    /// the registry so two ids never collide.
    fn generate_id(&self, owner: &Owner) -> SessionId {
        let now = Utc::now().timestamp_micros();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        let stamp = now.max(prev + 1);
        SessionId::new(format!("{}-{}-{}", owner.identity(), owner.id().0, stamp))
    }

    /// Spawns one exit monitor per owner.
    fn watch(&self, owner: &Owner) {
        if self.watched.insert(owner.id(), ()).is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(owner = %owner.id(), "no async runtime; owner exit will not release sessions");
            return;
        };
        let watch = owner.watch();
        let registry = self.this.clone();
        runtime.spawn(async move {
            let owner_id = watch.owner_id();
            watch.exited().await;
            if let Some(registry) = registry.upgrade() {
                registry.release_owner(owner_id).await;
            }
        });
    }

    async fn release_owner(&self, owner_id: OwnerId) {
        self.watched.remove(&owner_id);
        self.current.remove(&owner_id);
        let orphans: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.value().owner == owner_id)
            .map(|e| e.key().clone())
            .collect();
        for id in orphans {
            tracing::info!(session_id = %id, owner = %owner_id, "owner exited; releasing session");
            if let Err(e) = self.release_session(&id).await {
                tracing::warn!(session_id = %id, "failed to release session of exited owner: {}", e);
            }
        }
    }
}
