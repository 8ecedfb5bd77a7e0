//! # Call Dispatcher
//!
//! Turns a call shape plus arguments into one round-trip through an
//! [`Executor`].
//!
//! ## Philosophy
//!
//! - **One Path**: every call shape goes through [`Dispatcher::dispatch`]:
//!   version check, session resolution, encoding, execution, decoding. The
//!   public methods only build the shape.
//! - **Fail Before Sending**: version mismatches, disabled helpers and
//!   unencodable arguments are reported without touching the executor.
//! - **Retries Are Opt-In**: only calls marked idempotent are repeated, and
//!   only after a transient transport failure. A remote exception is never
//!   retried.
//!
//! ## Invariants
//! - The version check runs before any argument is encoded.
//! - A call on a handle is routed with the handle's own module and library.
//! - `call_constructor` yields a [`Handle`] or an error, never plain data.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bridgepack::Handle;
use bridgepack::SessionId;
use bridgepack::Value;
use bridgepack::Wire;
use bridgerpc::BatchCall;
use bridgerpc::BatchReply;
use bridgerpc::CallPayload;
use bridgerpc::CallShape;
use bridgerpc::FailureCode;
use bridgerpc::control::Handshake;
use bridgerpc::control::ReleaseRef;
use bridgerpc::tool;
use tokio::sync::OnceCell;

use crate::classify::classify_exec;
use crate::classify::classify_failure;
use crate::config::BridgeConfig;
use crate::config::CallOptions;
use crate::error::BridgeError;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::owner::Owner;
use crate::session::Session;
use crate::session::SessionRegistry;
use crate::session::SessionSpec;
use crate::transport::ExecError;
use crate::transport::ExecOptions;
use crate::transport::Executor;

/// Keyword arguments of a call.
pub type Kwargs = BTreeMap<String, Value>;

/// One `module.function(*args, **kwargs)` call inside a batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub module: String,
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
}

impl BatchEntry {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: Kwargs::new(),
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }
}

pub(crate) struct Shared {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) config: BridgeConfig,
    // `None` once negotiated means the remote predates the handshake.
    remote: OnceCell<Option<Handshake>>,
}

/// Host entry point for remote calls.
///
/// Cheap to clone. Every clone made with [`Dispatcher::with_owner`] calls on
/// behalf of a different [`Owner`] while sharing the executor, the session
/// registry and the negotiated protocol window.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) shared: Arc<Shared>,
    pub(crate) owner: Owner,
}

impl Dispatcher {
    /// A dispatcher calling on behalf of a fresh `root` owner.
    ///
    /// Sessions of owners made with [`Dispatcher::with_owner`] are released
    /// when those owners exit. The root owner only exits together with the
    /// registry, so its sessions are not released that way: call
    /// [`Dispatcher::shutdown`] before dropping the last clone.
    pub fn new(executor: Arc<dyn Executor>, config: BridgeConfig) -> Self {
        let sessions = SessionRegistry::new(executor.clone(), config.call_timeout);
        Self {
            shared: Arc::new(Shared {
                executor,
                sessions,
                config,
                remote: OnceCell::new(),
            }),
            owner: Owner::new("root"),
        }
    }

    /// A dispatcher that calls on behalf of `owner`.
    pub fn with_owner(&self, owner: Owner) -> Self {
        Self {
            shared: self.shared.clone(),
            owner,
        }
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.shared.sessions
    }

    /// Calls `module.function(*args, **kwargs)`.
    pub async fn call(
        &self,
        module: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
    ) -> Result<Value> {
        let shape = CallShape::Function {
            module: module.to_string(),
            function: function.to_string(),
        };
        self.dispatch(shape, args, kwargs, opts).await
    }

    /// Calls a method on the remote object behind `handle`.
    pub async fn call_method(
        &self,
        handle: &Handle,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
    ) -> Result<Value> {
        let shape = CallShape::Method {
            target: handle.clone(),
            method: method.to_string(),
        };
        self.dispatch(shape, args, kwargs, opts).await
    }

    /// Instantiates `module.class` on the remote side and returns a handle
    /// to the new object.
    pub async fn call_constructor(
        &self,
        module: &str,
        class: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
    ) -> Result<Handle> {
        let shape = CallShape::Constructor {
            module: module.to_string(),
            class: class.to_string(),
        };
        match self.dispatch(shape, args, kwargs, opts).await? {
            Value::Ref(handle) => Ok(handle),
            other => Err(BridgeError::new(
                ErrorKind::Decoding,
                format!("constructor {}.{} returned {} instead of a ref", module, class, other.type_name()),
            )
            .with_detail("type_name", other.type_name())),
        }
    }

    /// Like [`Dispatcher::call`], for targets only known at runtime.
    pub async fn call_dynamic(
        &self,
        module_path: &str,
        function: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
    ) -> Result<Value> {
        let shape = CallShape::Dynamic {
            module: module_path.to_string(),
            function: function.to_string(),
        };
        self.dispatch(shape, args, kwargs, opts).await
    }

    /// Calls a helper registered on the remote side by name.
    ///
    /// # Errors
    /// [`ErrorKind::HelperDisabled`] unless [`BridgeConfig::allow_helpers`]
    /// is set. Nothing is sent in that case.
    pub async fn call_helper(&self, name: &str, args: Vec<Value>, kwargs: Kwargs, opts: &CallOptions) -> Result<Value> {
        let shape = CallShape::Helper { name: name.to_string() };
        self.dispatch(shape, args, kwargs, opts).await
    }

    pub async fn get_attr(&self, handle: &Handle, attr: &str, opts: &CallOptions) -> Result<Value> {
        let shape = CallShape::GetAttr {
            target: handle.clone(),
            attr: attr.to_string(),
        };
        self.dispatch(shape, Vec::new(), Kwargs::new(), opts).await
    }

    pub async fn set_attr(&self, handle: &Handle, attr: &str, value: Value, opts: &CallOptions) -> Result<()> {
        let shape = CallShape::SetAttr {
            target: handle.clone(),
            attr: attr.to_string(),
        };
        self.dispatch(shape, vec![value], Kwargs::new(), opts).await?;
        Ok(())
    }

    /// Reads a module-level attribute such as a constant.
    pub async fn get_module_attr(&self, module: &str, attr: &str, opts: &CallOptions) -> Result<Value> {
        let shape = CallShape::ModuleAttr {
            module: module.to_string(),
            attr: attr.to_string(),
        };
        self.dispatch(shape, Vec::new(), Kwargs::new(), opts).await
    }

    /// Runs several function calls in one round-trip.
    ///
    /// Each entry gets its own result, in order. An entry that cannot be
    /// encoded or that fails remotely yields an error in its slot and the
    /// others still run.
    ///
    /// # Errors
    /// The outer result fails only when the batch as a whole cannot be
    /// sent: an incompatible protocol version, a transport failure or a
    /// malformed reply.
    pub async fn call_batch(&self, entries: Vec<BatchEntry>, opts: &CallOptions) -> Result<Vec<Result<Value>>> {
        self.check_version().await?;

        let mut slots: Vec<Option<Result<Value>>> = Vec::with_capacity(entries.len());
        let mut calls = Vec::new();
        let mut exec_opts = None;
        for entry in entries {
            let shape = CallShape::Function {
                module: entry.module,
                function: entry.function,
            };
            match self.prepare(shape, entry.args, entry.kwargs, opts).await {
                Ok((wire, prepared)) => {
                    calls.push(wire);
                    exec_opts.get_or_insert(prepared);
                    slots.push(None);
                }
                Err(e) => slots.push(Some(Err(e))),
            }
        }
        let Some(exec_opts) = exec_opts else {
            return Ok(slots.into_iter().flatten().collect());
        };

        let sent = calls.len();
        tracing::debug!(calls = sent, entries = slots.len(), "dispatching batch");
        let request = BatchCall { calls }.to_wire();
        let reply = if opts.idempotent {
            self.execute_idempotent(tool::BATCH, &request, &exec_opts).await?
        } else {
            self.execute_once(tool::BATCH, request, &exec_opts).await?
        };
        let reply = BatchReply::from_wire(&reply)?;
        if reply.results.len() != sent {
            return Err(BridgeError::new(
                ErrorKind::Decoding,
                format!("batch of {} calls answered with {} results", sent, reply.results.len()),
            ));
        }

        let mut outcomes = reply.results.into_iter();
        Ok(slots
            .into_iter()
            .map(|slot| match slot {
                Some(local) => local,
                None => match outcomes.next() {
                    Some(Ok(wire)) => bridgepack::decode(&wire).map_err(BridgeError::from),
                    Some(Err(failure)) => Err(classify_failure(&failure)),
                    None => Err(BridgeError::new(ErrorKind::Decoding, "batch reply ended early")),
                },
            })
            .collect())
    }

    /// Drops the remote object behind `handle`. Returns `false` when the
    /// remote side no longer had it.
    pub async fn release_ref(&self, handle: &Handle) -> Result<bool> {
        let request = ReleaseRef {
            session_id: handle.session_id.clone(),
            handle_id: handle.id.clone(),
        };
        let opts = ExecOptions {
            timeout: self.shared.config.call_timeout,
            session_id: Some(handle.session_id.clone()),
            ..Default::default()
        };
        let reply = self.execute_once(tool::RELEASE_REF, request.to_wire(), &opts).await?;
        let released = reply.as_bool().ok_or_else(|| {
            BridgeError::new(ErrorKind::Decoding, format!("release_ref replied with {} instead of a boolean", reply))
        })?;
        tracing::debug!(ref_id = %handle.id, session_id = %handle.session_id, released, "released ref");
        Ok(released)
    }

    /// The caller's session, created on first use.
    pub fn current_session(&self) -> SessionId {
        self.shared.sessions.current_session(&self.owner)
    }

    /// Registers a session for this owner and makes it current.
    pub fn create_session(&self, spec: SessionSpec) -> SessionId {
        self.shared.sessions.create_session(&self.owner, spec)
    }

    pub async fn release_session(&self, session_id: &SessionId) -> Result<()> {
        self.shared.sessions.release_session(session_id).await
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        self.shared.sessions.sessions()
    }

    /// Releases every session still registered, including the root owner's.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(sessions = self.shared.sessions.len(), "shutting down dispatcher");
        self.shared.sessions.release_all().await
    }

    /// The remote side's protocol window, asked for once and cached.
    ///
    /// Returns `None` when negotiation is disabled, or when the remote side
    /// predates the handshake. Transport failures are not cached.
    pub async fn negotiate(&self) -> Result<Option<Handshake>> {
        if !self.shared.config.negotiate_protocol {
            return Ok(None);
        }
        self.shared
            .remote
            .get_or_try_init(|| self.handshake())
            .await
            .copied()
    }

    async fn handshake(&self) -> Result<Option<Handshake>> {
        let local = self.shared.config.handshake();
        let opts = ExecOptions {
            timeout: self.shared.config.call_timeout,
            ..Default::default()
        };
        match self.execute_raw(tool::HANDSHAKE, local.to_wire(), &opts).await {
            Ok(reply) => {
                let remote = Handshake::from_wire(&reply)?;
                tracing::info!(
                    protocol_version = remote.protocol_version,
                    min_supported_version = remote.min_supported_version,
                    supports_streaming = remote.supports_streaming,
                    "negotiated protocol"
                );
                Ok(Some(remote))
            }
            Err(ExecError::Remote(failure)) if failure.code == Some(FailureCode::ProtocolVersion) => {
                Err(classify_failure(&failure))
            }
            Err(ExecError::Remote(failure)) => {
                tracing::warn!("remote does not answer the handshake, assuming a compatible legacy remote: {}", failure);
                Ok(None)
            }
            Err(e) => Err(classify_exec(e)),
        }
    }

    /// Fails with [`ErrorKind::ProtocolVersion`] when the remote window
    /// excludes ours.
    pub(crate) async fn check_version(&self) -> Result<Option<Handshake>> {
        let local = self.shared.config.handshake();
        if local.protocol_version < local.min_supported_version {
            return Err(BridgeError::new(
                ErrorKind::ProtocolVersion,
                format!(
                    "protocol_version {} is below min_supported_version {}",
                    local.protocol_version, local.min_supported_version
                ),
            ));
        }
        let remote = self.negotiate().await?;
        if let Some(remote) = &remote {
            if !local.compatible_with(remote) {
                return Err(BridgeError::new(
                    ErrorKind::ProtocolVersion,
                    format!(
                        "remote speaks protocol {}..={}, this host speaks {}..={}",
                        remote.min_supported_version,
                        remote.protocol_version,
                        local.min_supported_version,
                        local.protocol_version
                    ),
                )
                .with_detail("protocol_version", local.protocol_version)
                .with_detail("remote_protocol_version", remote.protocol_version)
                .with_detail("remote_min_supported_version", remote.min_supported_version));
            }
        }
        Ok(remote)
    }

    /// Checks, resolves the session and encodes. Nothing is sent.
    pub(crate) async fn prepare(
        &self,
        shape: CallShape,
        args: Vec<Value>,
        kwargs: Kwargs,
        opts: &CallOptions,
    ) -> Result<(Wire, ExecOptions)> {
        if let CallShape::Helper { name } = &shape {
            if !self.shared.config.allow_helpers {
                return Err(BridgeError::new(
                    ErrorKind::HelperDisabled,
                    format!("helper '{}' refused: helper calls are disabled", name),
                )
                .with_detail("helper", name.as_str()));
            }
        }

        self.check_version().await?;

        let session_id = self.shared.sessions.resolve(
            &self.owner,
            opts.session_id.as_ref(),
            shape.target().map(|h| &h.session_id),
        );
        tracing::debug!(call = %shape, session_id = %session_id, idempotent = opts.idempotent, "dispatching");

        let mut payload = CallPayload::new(shape, args, kwargs)
            .with_session(Some(session_id.clone()))
            .with_idempotent(opts.idempotent);
        payload.protocol_version = self.shared.config.protocol_version;
        payload.min_supported_version = self.shared.config.min_supported_version;
        let wire = payload.to_wire()?;

        let exec_opts = ExecOptions {
            timeout: opts.timeout.unwrap_or(self.shared.config.call_timeout),
            session_id: Some(session_id),
            metadata: opts.metadata.clone(),
        };
        Ok((wire, exec_opts))
    }

    /// Runs one call shape end to end.
    pub async fn dispatch(&self, shape: CallShape, args: Vec<Value>, kwargs: Kwargs, opts: &CallOptions) -> Result<Value> {
        let (wire, exec_opts) = self.prepare(shape, args, kwargs, opts).await?;
        let reply = if opts.idempotent {
            self.execute_idempotent(&self.shared.config.tool_name, &wire, &exec_opts).await?
        } else {
            self.execute_once(&self.shared.config.tool_name, wire, &exec_opts).await?
        };
        Ok(bridgepack::decode(&reply)?)
    }

    async fn execute_idempotent(&self, tool: &str, wire: &Wire, opts: &ExecOptions) -> Result<Wire> {
        let attempts = self.shared.config.max_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.execute_raw(tool, wire.clone(), opts).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.shared.config.retry_backoff * attempt;
                    tracing::warn!(attempt, max_attempts = attempts, ?backoff, "retrying idempotent call: {}", e);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(classify_exec(e)),
            }
        }
    }

    async fn execute_once(&self, tool: &str, wire: Wire, opts: &ExecOptions) -> Result<Wire> {
        self.execute_raw(tool, wire, opts).await.map_err(classify_exec)
    }

    async fn execute_raw(&self, tool: &str, wire: Wire, opts: &ExecOptions) -> std::result::Result<Wire, ExecError> {
        run_with_timeout(opts.timeout, self.shared.executor.execute(tool, wire, opts)).await
    }
}

async fn run_with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = std::result::Result<T, ExecError>>,
) -> std::result::Result<T, ExecError> {
    tokio::time::timeout(timeout, fut).await.unwrap_or(Err(ExecError::Timeout))
}
