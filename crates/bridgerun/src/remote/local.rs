//! # Local Remote
//!
//! An executor that plays the remote interpreter inside this process.
//!
//! Modules are flat maps of Rust closures. Anything a closure returns that
//! is not plain data (an object or an iterator) goes into the
//! [`ObjectRegistry`] and leaves as a handle, exactly as a real remote would
//! do it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use bridgepack::Handle;
use bridgepack::HandleId;
use bridgepack::SessionId;
use bridgepack::StreamHandle;
use bridgepack::StreamKind;
use bridgepack::Value;
use bridgepack::Wire;
use bridgerpc::BatchCall;
use bridgerpc::BatchReply;
use bridgerpc::CallPayload;
use bridgerpc::CallShape;
use bridgerpc::FailureCode;
use bridgerpc::RemoteFailure;
use bridgerpc::StreamChunk;
use bridgerpc::control::Handshake;
use bridgerpc::control::ReleaseRef;
use bridgerpc::control::ReleaseSession;
use bridgerpc::tool;

use crate::config::BridgeConfig;
use crate::remote::registry::ObjectRegistry;
use crate::transport;
use crate::transport::ExecError;
use crate::transport::ExecOptions;
use crate::transport::Executor;
use crate::transport::Flow;

pub type RemoteResult = std::result::Result<RemoteValue, RemoteFailure>;

type NativeFn = Arc<dyn Fn(Vec<Value>, BTreeMap<String, Value>) -> RemoteResult + Send + Sync>;
type ValueIter = Box<dyn Iterator<Item = RemoteResult> + Send>;

/// What a remote callable hands back.
pub enum RemoteValue {
    /// Data that crosses the boundary by value.
    Plain(Value),
    /// A live object; leaves as a `ref`.
    Object(Arc<dyn RemoteObject>),
    /// A generator; leaves as a `stream_ref`, or is drained when streamed.
    Iter(ValueIter),
    List(Vec<RemoteValue>),
    Map(BTreeMap<String, RemoteValue>),
}

impl RemoteValue {
    pub fn object(object: impl RemoteObject) -> Self {
        Self::Object(Arc::new(object))
    }

    pub fn iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = RemoteResult>,
        I::IntoIter: Send + 'static,
    {
        Self::Iter(Box::new(items.into_iter()))
    }

    /// A generator over plain values.
    pub fn values<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self::iter(items.into_iter().map(|v| Ok(RemoteValue::Plain(v))))
    }
}

impl From<Value> for RemoteValue {
    fn from(v: Value) -> Self {
        Self::Plain(v)
    }
}

/// A live object held by the remote side.
pub trait RemoteObject: Send + Sync + 'static {
    fn type_name(&self) -> &str;

    /// Dotted module path of the object's type.
    fn module(&self) -> &str;

    fn call(&self, method: &str, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> RemoteResult {
        let _ = (args, kwargs);
        Err(no_attribute(self.type_name(), method))
    }

    fn get_attr(&self, attr: &str) -> RemoteResult {
        Err(no_attribute(self.type_name(), attr))
    }

    fn set_attr(&self, attr: &str, value: Value) -> Result<(), RemoteFailure> {
        let _ = value;
        Err(no_attribute(self.type_name(), attr))
    }
}

fn no_attribute(owner: &str, name: &str) -> RemoteFailure {
    RemoteFailure::new("AttributeError", format!("'{}' object has no attribute '{}'", owner, name))
}

fn stop_iteration() -> RemoteFailure {
    RemoteFailure::new("StopIteration", "iterator exhausted")
}

#[derive(Clone)]
enum Stored {
    Object(Arc<dyn RemoteObject>),
    Iter(Arc<Mutex<ValueIter>>),
}

/// In-process stand-in for a remote interpreter.
pub struct LocalRemote {
    registry: ObjectRegistry<Stored>,
    functions: HashMap<String, NativeFn>,
    classes: HashMap<String, NativeFn>,
    constants: HashMap<String, Value>,
    helpers: HashMap<String, NativeFn>,
    handshake: Handshake,
    keepalive: bool,
    calls: AtomicUsize,
}

impl LocalRemote {
    pub fn new(ttl_seconds: u64, max_size: usize) -> Self {
        Self {
            registry: ObjectRegistry::new(ttl_seconds, max_size),
            functions: HashMap::new(),
            classes: HashMap::new(),
            constants: HashMap::new(),
            helpers: HashMap::new(),
            handshake: Handshake::default(),
            keepalive: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// A remote whose registry uses the eviction settings of `config`.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.ref_ttl_seconds, config.ref_max_size)
    }

    pub fn function<F>(mut self, module: &str, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>, BTreeMap<String, Value>) -> RemoteResult + Send + Sync + 'static,
    {
        self.functions.insert(qualified(module, name), Arc::new(f));
        self
    }

    /// Registers a class. The constructor's result always leaves as a ref.
    pub fn class<F, O>(mut self, module: &str, name: &str, ctor: F) -> Self
    where
        F: Fn(Vec<Value>, BTreeMap<String, Value>) -> Result<O, RemoteFailure> + Send + Sync + 'static,
        O: RemoteObject,
    {
        let wrapped: NativeFn = Arc::new(move |args: Vec<Value>, kwargs: BTreeMap<String, Value>| -> RemoteResult {
            Ok(RemoteValue::object(ctor(args, kwargs)?))
        });
        self.classes.insert(qualified(module, name), wrapped);
        self
    }

    pub fn constant(mut self, module: &str, name: &str, value: impl Into<Value>) -> Self {
        self.constants.insert(qualified(module, name), value.into());
        self
    }

    pub fn helper<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>, BTreeMap<String, Value>) -> RemoteResult + Send + Sync + 'static,
    {
        self.helpers.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Makes `execute_stream` report that streaming is unsupported.
    pub fn without_streaming(mut self) -> Self {
        self.handshake.supports_streaming = false;
        self
    }

    /// Emits a keep-alive chunk ahead of every streamed item.
    pub fn with_keepalives(mut self) -> Self {
        self.keepalive = true;
        self
    }

    pub fn with_versions(mut self, protocol_version: u32, min_supported_version: u32) -> Self {
        self.handshake.protocol_version = protocol_version;
        self.handshake.min_supported_version = min_supported_version;
        self
    }

    /// Number of call payloads that reached a handler.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn live_refs(&self) -> usize {
        self.registry.len()
    }

    pub fn session_refs(&self, session_id: &SessionId) -> usize {
        self.registry.session_len(session_id)
    }

    pub fn holds(&self, handle_id: &HandleId) -> bool {
        self.registry.contains(handle_id)
    }

    pub fn prune(&self) -> usize {
        self.registry.prune()
    }

    fn parse(&self, payload: &Wire) -> Result<CallPayload, RemoteFailure> {
        let payload = CallPayload::from_wire(payload)
            .map_err(|e| RemoteFailure::new("DecodeError", format!("malformed call payload: {}", e)))?;
        let acceptable = self.handshake.accepts(payload.protocol_version)
            && payload.min_supported_version <= self.handshake.protocol_version;
        if !acceptable {
            return Err(RemoteFailure::new(
                "ProtocolVersionError",
                format!(
                    "protocol version {} is outside the supported range {}..={}",
                    payload.protocol_version, self.handshake.min_supported_version, self.handshake.protocol_version
                ),
            )
            .with_code(FailureCode::ProtocolVersion)
            .with_detail("protocol_version", payload.protocol_version)
            .with_detail("min_supported_version", self.handshake.min_supported_version));
        }
        Ok(payload)
    }

    fn dispatch(&self, payload: CallPayload) -> RemoteResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let session_id = session_of(&payload);
        let CallPayload { shape, args, kwargs, .. } = payload;
        tracing::debug!(call = %shape, session_id = %session_id, "local remote call");

        match shape {
            CallShape::Function { module, function }
            | CallShape::Dynamic { module, function }
            | CallShape::DynamicStream { module, function } => {
                let f = lookup(&self.functions, &module, &function)?;
                f(args, kwargs)
            }
            CallShape::Constructor { module, class } => {
                let ctor = lookup(&self.classes, &module, &class)?;
                ctor(args, kwargs)
            }
            CallShape::Helper { name } => {
                let f = self.helpers.get(&name).ok_or_else(|| {
                    RemoteFailure::new("KeyError", format!("helper '{}' is not registered", name))
                })?;
                f(args, kwargs)
            }
            CallShape::ModuleAttr { module, attr } => match self.constants.get(&qualified(&module, &attr)) {
                Some(value) => Ok(RemoteValue::Plain(value.clone())),
                None => Err(no_attribute(&format!("module {}", module), &attr)),
            },
            CallShape::Method { target, method } => match self.resolve(&session_id, &target)? {
                Stored::Object(object) => object.call(&method, args, kwargs),
                Stored::Iter(iter) => match method.as_str() {
                    "__next__" => {
                        let mut iter = iter.lock().unwrap_or_else(|p| p.into_inner());
                        iter.next().unwrap_or_else(|| Err(stop_iteration()))
                    }
                    "__iter__" => Ok(RemoteValue::Plain(Value::StreamRef(StreamHandle::new(
                        target,
                        StreamKind::Iterator,
                    )))),
                    other => Err(no_attribute("generator", other)),
                },
            },
            CallShape::GetAttr { target, attr } => match self.resolve(&session_id, &target)? {
                Stored::Object(object) => object.get_attr(&attr),
                Stored::Iter(_) => Err(no_attribute("generator", &attr)),
            },
            CallShape::SetAttr { target, attr } => {
                let value = args.into_iter().next().unwrap_or(Value::Null);
                match self.resolve(&session_id, &target)? {
                    Stored::Object(object) => object.set_attr(&attr, value).map(|_| RemoteValue::Plain(Value::Null)),
                    Stored::Iter(_) => Err(no_attribute("generator", &attr)),
                }
            }
        }
    }

    fn resolve(&self, session_id: &SessionId, target: &Handle) -> Result<Stored, RemoteFailure> {
        Ok(self.registry.resolve(session_id, &target.id)?)
    }

    /// Replaces objects and iterators with handles. The same object seen
    /// twice in one reply gets the same handle.
    fn lower(
        &self,
        value: RemoteValue,
        session_id: &SessionId,
        module: &str,
        memo: &mut HashMap<usize, HandleId>,
    ) -> Value {
        match value {
            RemoteValue::Plain(v) => v,
            RemoteValue::Object(object) => {
                let key = Arc::as_ptr(&object) as *const () as usize;
                let id = match memo.get(&key) {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.registry.store(session_id, Stored::Object(object.clone()));
                        memo.insert(key, id.clone());
                        id
                    }
                };
                Value::Ref(
                    Handle::new(id, session_id.clone(), object.module()).with_type_name(object.type_name()),
                )
            }
            RemoteValue::Iter(iter) => {
                let id = self.registry.store(session_id, Stored::Iter(Arc::new(Mutex::new(iter))));
                let handle = Handle::new(id, session_id.clone(), module).with_type_name("generator");
                Value::StreamRef(StreamHandle::new(handle, StreamKind::Generator))
            }
            RemoteValue::List(items) => {
                Value::List(items.into_iter().map(|v| self.lower(v, session_id, module, memo)).collect())
            }
            RemoteValue::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, self.lower(v, session_id, module, memo)))
                    .collect(),
            ),
        }
    }

    fn encode(&self, value: &Value) -> Result<Wire, RemoteFailure> {
        bridgepack::encode(value).map_err(|e| RemoteFailure::new("SerializationError", e.to_string()))
    }

    fn run_call(&self, payload: &Wire) -> Result<Wire, RemoteFailure> {
        let payload = self.parse(payload)?;
        let session_id = session_of(&payload);
        let module = payload.shape.remote_module().to_string();
        let value = self.dispatch(payload)?;
        let value = self.lower(value, &session_id, &module, &mut HashMap::new());
        self.encode(&value)
    }

    fn send(&self, chunk: StreamChunk, on_chunk: &mut (dyn FnMut(Wire) -> Flow + Send)) -> transport::Result<Flow> {
        let wire = chunk
            .to_wire()
            .map_err(|e| ExecError::Remote(RemoteFailure::new("SerializationError", e.to_string())))?;
        Ok(on_chunk(wire))
    }

    fn send_item(
        &self,
        item: RemoteValue,
        session_id: &SessionId,
        module: &str,
        on_chunk: &mut (dyn FnMut(Wire) -> Flow + Send),
    ) -> transport::Result<Flow> {
        if self.keepalive && self.send(StreamChunk::KeepAlive, on_chunk)? == Flow::Stop {
            return Ok(Flow::Stop);
        }
        let value = self.lower(item, session_id, module, &mut HashMap::new());
        self.send(StreamChunk::Item(value), on_chunk)
    }
}

#[async_trait::async_trait]
impl Executor for LocalRemote {
    async fn execute(&self, tool: &str, payload: Wire, _opts: &ExecOptions) -> transport::Result<Wire> {
        match tool {
            tool::HANDSHAKE => Ok(self.handshake.to_wire()),
            tool::RELEASE_REF => {
                let req = ReleaseRef::from_wire(&payload).map_err(malformed)?;
                Ok(Wire::Bool(self.registry.release(&req.session_id, &req.handle_id)))
            }
            tool::RELEASE_SESSION => {
                let req = ReleaseSession::from_wire(&payload).map_err(malformed)?;
                Ok(Wire::from(self.registry.release_session(&req.session_id)))
            }
            tool::CALL => self.run_call(&payload).map_err(ExecError::Remote),
            tool::BATCH => {
                let batch = BatchCall::from_wire(&payload).map_err(malformed)?;
                let results = batch.calls.iter().map(|call| self.run_call(call)).collect();
                Ok(BatchReply { results }.to_wire())
            }
            other => Err(ExecError::Remote(RemoteFailure::new(
                "AttributeError",
                format!("unknown tool '{}'", other),
            ))),
        }
    }

    async fn execute_stream(
        &self,
        tool: &str,
        payload: Wire,
        on_chunk: &mut (dyn FnMut(Wire) -> Flow + Send),
        _opts: &ExecOptions,
    ) -> transport::Result<()> {
        if !self.handshake.supports_streaming || tool != tool::STREAM {
            return Err(ExecError::StreamingUnsupported(format!("streaming not supported for '{}'", tool)));
        }

        let payload = self.parse(&payload).map_err(ExecError::Remote)?;
        let session_id = session_of(&payload);
        let module = payload.shape.remote_module().to_string();

        let items: ValueIter = match self.dispatch(payload) {
            Ok(RemoteValue::Iter(iter)) => iter,
            Ok(RemoteValue::List(items)) => Box::new(items.into_iter().map(Ok::<_, RemoteFailure>)),
            Ok(single) => Box::new(std::iter::once(Ok::<_, RemoteFailure>(single))),
            Err(failure) => {
                self.send(StreamChunk::Failed(failure), on_chunk)?;
                return Ok(());
            }
        };

        for item in items {
            match item {
                Ok(value) => {
                    if self.send_item(value, &session_id, &module, on_chunk)? == Flow::Stop {
                        tracing::debug!(session_id = %session_id, "stream abandoned by consumer");
                        return Ok(());
                    }
                }
                Err(failure) => {
                    self.send(StreamChunk::Failed(failure), on_chunk)?;
                    return Ok(());
                }
            }
        }
        self.send(StreamChunk::Done, on_chunk)?;
        Ok(())
    }
}

fn qualified(module: &str, name: &str) -> String {
    format!("{}.{}", module, name)
}

fn lookup<'a>(table: &'a HashMap<String, NativeFn>, module: &str, name: &str) -> Result<&'a NativeFn, RemoteFailure> {
    table.get(&qualified(module, name)).ok_or_else(|| {
        let known_module = table.keys().any(|k| k.rsplit_once('.').is_some_and(|(m, _)| m == module));
        if known_module {
            no_attribute(&format!("module {}", module), name)
        } else {
            RemoteFailure::new("ModuleNotFoundError", format!("No module named '{}'", module))
        }
    })
}

fn session_of(payload: &CallPayload) -> SessionId {
    payload.session_id.clone().unwrap_or_else(|| SessionId::from("default"))
}

fn malformed(e: bridgerpc::Error) -> ExecError {
    ExecError::Remote(RemoteFailure::new("DecodeError", e.to_string()))
}
