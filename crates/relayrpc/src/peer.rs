//! # RPC Peer
//!
//! A `Peer` is one end of a bidirectional RPC connection. It exports services,
//! calls the other side's functions, and keeps the bookkeeping that ties
//! asynchronous replies and callbacks back to their call sites.
//!
//! ## Architecture
//!
//! - **Pump task**: One background task drains `Transport::recv` and spawns a
//!   task per inbound message, so a slow handler never blocks the stream.
//! - **Correlation**: Every call expecting a reply opens a session. Its
//!   resolve/reject handles live in the reference store and settle a
//!   `oneshot` the caller is parked on.
//! - **Deadlines**: A per-call watchdog is armed after the send succeeds and
//!   renewed by the callee's heartbeats. Expiry rejects with
//!   [`RpcError::Timeout`] and tears the session subtree down.
//!
//! ## Invariants
//!
//! - Inbound failures never stop the pump; they become rejections or logs.
//! - The pump and every proxy hold the engine weakly. Dropping the last
//!   `Peer` handle stops the pump.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use relaypack::Packed;
use tokio::task::JoinHandle;

use crate::builtin::BUILTIN_SERVICE_ID;
use crate::chunk;
use crate::chunk::MessageCache;
use crate::codec::Codec;
use crate::codec::CodecRegistry;
use crate::config::PeerConfig;
use crate::config::split_wire_id;
use crate::decode::DecodeContext;
use crate::encode::EncodeContext;
use crate::envelope::CallbackRef;
use crate::envelope::MethodRef;
use crate::error::Result;
use crate::error::RpcError;
use crate::events::EventBus;
use crate::events::HandlerId;
use crate::message::Frame;
use crate::message::Header;
use crate::message::TYPE_CALLBACK;
use crate::message::TYPE_METHOD;
use crate::refstore::RefStore;
use crate::refstore::StoreEvent;
use crate::remote::RemoteService;
use crate::service::SERVICES_PREFIX;
use crate::service::Service;
use crate::service::ServiceApi;
use crate::service::ServiceRegistry;
use crate::service::ServiceUri;
use crate::service::is_service_path;
use crate::session::HEARTBEAT;
use crate::session::SessionNode;
use crate::session::SessionStore;
use crate::session::Settler;
use crate::session::Timer;
use crate::transport::Transport;
use crate::value::Callable;
use crate::value::KWARGS_MARKER;
use crate::value::Value;

/// Fresh random id for sessions and cached messages. Never contains a dot.
pub(crate) fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Everything needed to address one outbound call.
#[derive(Debug, Clone)]
pub(crate) struct CallSpec {
    pub to: String,
    pub method: String,
    /// Whether a reply is expected.
    pub promise: bool,
    /// The remote session the call was made under, sent as `parent`.
    pub remote_parent: Option<String>,
    /// Local session the call's own session nests under.
    pub local_parent: Option<String>,
    pub timeout: Option<Duration>,
    /// Whether an oversized message may take the chunked path.
    pub chunkable: bool,
}

impl CallSpec {
    pub fn new(to: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            method: method.into(),
            promise: true,
            remote_parent: None,
            local_parent: None,
            timeout: None,
            chunkable: true,
        }
    }

    pub fn without_reply(mut self) -> Self {
        self.promise = false;
        self
    }
}

/// Resolve/reject (and optional heartbeat) handed to a callee.
struct Promise {
    resolve: Callable,
    reject: Callable,
    heartbeat: Option<(Callable, Duration)>,
}

pub(crate) struct Inner {
    pub(crate) config: PeerConfig,
    pub(crate) wire_id: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) refs: Mutex<RefStore<Callable>>,
    pub(crate) sessions: SessionStore,
    pub(crate) services: ServiceRegistry,
    pub(crate) codecs: CodecRegistry,
    pub(crate) events: EventBus,
    pub(crate) cache: MessageCache,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A connected RPC endpoint. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    /// Validates the configuration, registers the `built-in` service and
    /// starts the inbound pump. Must be called inside a tokio runtime.
    pub fn new(config: PeerConfig, transport: Box<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(Inner {
            wire_id: config.wire_id(),
            config,
            transport: Arc::from(transport),
            refs: Mutex::new(RefStore::new()),
            sessions: SessionStore::new(),
            services: ServiceRegistry::new(),
            codecs: CodecRegistry::new(),
            events: EventBus::new(),
            cache: MessageCache::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        inner.register(inner.builtin_service(), true, false)?;
        let pump = Inner::spawn_pump(&inner);
        inner.tasks.lock().push(pump);
        if let Some(manager) = inner.config.manager_id.clone() {
            let bootstrap = tokio::spawn(Inner::connection_info_loop(Arc::downgrade(&inner), manager));
            inner.tasks.lock().push(bootstrap);
        }

        tracing::debug!(client_id = %inner.wire_id, "peer started");
        Ok(Self { inner })
    }

    /// The identity other peers address this one by.
    pub fn wire_id(&self) -> &str {
        &self.inner.wire_id
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    //  Services
    // ------------------------------------------------------------------------

    /// Registers a service and returns its descriptor. Emits one
    /// `service-updated` event and notifies the manager when configured.
    pub fn register_service(&self, api: ServiceApi, overwrite: bool) -> Result<Value> {
        let service = Service::from_api(api)?;
        self.inner.register(service, overwrite, true)
    }

    pub fn unregister_service(&self, service_id: &str, notify: bool) -> Result<()> {
        self.inner.unregister(service_id, notify)
    }

    /// Descriptors of every local service, sorted by id.
    pub fn list_services(&self) -> Vec<Value> {
        self.inner
            .services
            .list()
            .iter()
            .map(|s| s.descriptor(&self.inner.full_service_id(&s.id)))
            .collect()
    }

    pub fn register_codec(&self, codec: Codec) -> Result<()> {
        self.inner.codecs.register(codec)
    }

    /// Fetches a service by `"[workspace/]client:service"`.
    pub async fn get_remote_service(&self, uri: &str) -> Result<RemoteService> {
        self.inner.get_remote_service(uri, None).await
    }

    pub async fn get_remote_service_with_timeout(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<RemoteService> {
        self.inner.get_remote_service(uri, Some(timeout)).await
    }

    // ------------------------------------------------------------------------
    //  Calls
    // ------------------------------------------------------------------------

    /// Calls `method` (a dotted path such as `services.calc.square`) on the
    /// peer `target` and waits for its reply.
    pub async fn call(&self, target: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.call_remote(CallSpec::new(target, method), args).await
    }

    /// Like [`Peer::call`] with a per-call deadline.
    pub async fn call_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut spec = CallSpec::new(target, method);
        spec.timeout = Some(timeout);
        self.inner.call_remote(spec, args).await
    }

    /// Sends a call without waiting for, or asking for, a reply.
    pub async fn notify(&self, target: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let spec = CallSpec::new(target, method).without_reply();
        self.inner.call_remote(spec, args).await.map(|_| ())
    }

    pub async fn ping(&self, target: &str) -> Result<Value> {
        let method = format!("{SERVICES_PREFIX}.{BUILTIN_SERVICE_ID}.ping");
        self.call(target, &method, vec![Value::str("ping")]).await
    }

    // ------------------------------------------------------------------------
    //  Encoding
    // ------------------------------------------------------------------------

    /// Encodes a value for `target`; functions are minted under `session_id`.
    pub fn encode(&self, value: &Value, session_id: &str, target: &str) -> Result<Packed> {
        self.inner.encode(value, &EncodeContext { session: session_id, target })
    }

    pub fn decode(&self, packed: &Packed, ctx: &DecodeContext) -> Result<Value> {
        self.inner.decode(packed, ctx)
    }

    // ------------------------------------------------------------------------
    //  Events & lifecycle
    // ------------------------------------------------------------------------

    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.on(event, handler)
    }

    pub fn off(&self, event: &str, handler: Option<HandlerId>) {
        self.inner.events.off(event, handler)
    }

    pub fn emit(&self, event: &str, value: &Value) {
        self.inner.events.emit(event, value)
    }

    /// Number of live sessions (pending calls and callback holders).
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of reference store handles still outstanding.
    pub fn pending_refs(&self) -> usize {
        self.inner.refs.lock().len()
    }

    /// Closes a session and its descendants, e.g. once the remote side is
    /// done with the callbacks minted for it.
    pub fn close_session(&self, session_id: &str) {
        let nodes = self.inner.sessions.close(session_id);
        self.inner.drop_sessions(nodes, |id, _| RpcError::ParentSessionClosed(id.to_string()));
    }

    /// Clears event handlers and services. The `built-in` service is
    /// registered again.
    pub fn reset(&self) -> Result<()> {
        self.inner.events.clear();
        self.inner.services.clear();
        self.inner.register(self.inner.builtin_service(), true, false)?;
        Ok(())
    }

    /// Stops background tasks, fails pending calls with
    /// [`RpcError::Disconnected`], fires `disconnect` and closes the transport.
    pub async fn disconnect(&self, reason: Option<&str>) {
        self.inner.shutdown(reason);
        self.inner.transport.disconnect(reason).await;
    }
}

impl Inner {
    // ------------------------------------------------------------------------
    //  Registry
    // ------------------------------------------------------------------------

    pub(crate) fn full_service_id(&self, service_id: &str) -> String {
        format!("{}:{}", self.wire_id, service_id)
    }

    pub(crate) fn register(self: &Arc<Self>, service: Service, overwrite: bool, notify: bool) -> Result<Value> {
        let id = service.id.clone();
        let descriptor = service.descriptor(&self.full_service_id(&id));
        self.services.insert(service, overwrite)?;
        tracing::debug!(client_id = %self.wire_id, service = %id, "service registered");

        self.events.emit(
            "service-updated",
            &Value::map([("type", Value::str("add")), ("service", descriptor.clone())]),
        );
        if notify {
            self.notify_manager("register_service", descriptor.clone());
        }
        Ok(descriptor)
    }

    pub(crate) fn unregister(self: &Arc<Self>, service_id: &str, notify: bool) -> Result<()> {
        let service = self
            .services
            .remove(service_id)
            .ok_or_else(|| RpcError::NotFound(format!("service {service_id}")))?;
        let full_id = self.full_service_id(service_id);
        tracing::debug!(client_id = %self.wire_id, service = %service_id, "service unregistered");

        self.events.emit(
            "service-updated",
            &Value::map([("type", Value::str("remove")), ("service", service.descriptor(&full_id))]),
        );
        if notify {
            self.notify_manager("unregister_service", Value::str(full_id));
        }
        Ok(())
    }

    /// Best-effort call to the manager's `default` service.
    fn notify_manager(self: &Arc<Self>, method: &str, arg: Value) {
        let Some(manager) = self.config.manager_id.clone() else {
            return;
        };
        let inner = self.clone();
        let method = format!("{SERVICES_PREFIX}.default.{method}");
        tokio::spawn(async move {
            if let Err(e) = inner.call_remote(CallSpec::new(&manager, &method), vec![arg]).await {
                tracing::warn!(client_id = %inner.wire_id, %method, error = %e, "manager notification failed");
            }
        });
    }

    async fn get_remote_service(
        self: &Arc<Self>,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<RemoteService> {
        let parsed = ServiceUri::parse(uri)?;
        let workspace = parsed.workspace.or_else(|| self.config.workspace.clone());
        let client = parsed
            .client_id
            .or_else(|| self.config.manager_id.clone())
            .unwrap_or_else(|| self.config.client_id.clone());
        let target = match workspace {
            Some(ws) => format!("{ws}/{client}"),
            None => client,
        };
        let full_id = format!("{target}:{}", parsed.service_id);

        if target == self.wire_id {
            let service = self
                .services
                .get(&parsed.service_id)
                .ok_or_else(|| RpcError::NotFound(format!("service {}", parsed.service_id)))?;
            let Value::Interface(entries) = service.interface(&full_id) else {
                return Err(RpcError::Protocol("service interface is not a map".into()));
            };
            return Ok(RemoteService::new(full_id, Value::Map(entries)));
        }

        let mut spec = CallSpec::new(
            &target,
            format!("{SERVICES_PREFIX}.{BUILTIN_SERVICE_ID}.get_service"),
        );
        spec.timeout = timeout;
        match self.call_remote(spec, vec![Value::str(&parsed.service_id)]).await {
            Ok(mut value) => {
                value.set("id", Value::str(&full_id));
                Ok(RemoteService::new(full_id, value))
            }
            Err(e) => {
                tracing::error!(client_id = %self.wire_id, uri, error = %e, "failed to get remote service");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    //  Outbound
    // ------------------------------------------------------------------------

    /// Boxed so the chunked path may re-enter it.
    pub(crate) fn call_remote(
        self: &Arc<Self>,
        spec: CallSpec,
        args: Vec<Value>,
    ) -> BoxFuture<'static, Result<Value>> {
        let inner = self.clone();
        async move { inner.call_remote_inner(spec, args).await }.boxed()
    }

    async fn call_remote_inner(self: &Arc<Self>, spec: CallSpec, mut args: Vec<Value>) -> Result<Value> {
        let session_id = match &spec.local_parent {
            Some(parent) if !self.sessions.contains(parent) => {
                return Err(RpcError::ParentSessionClosed(parent.clone()));
            }
            Some(parent) => format!("{parent}.{}", new_id()),
            None => new_id(),
        };

        let with_kwargs = match args.last_mut() {
            Some(last) if last.is_kwargs() => {
                last.remove(KWARGS_MARKER);
                true
            }
            _ => false,
        };

        let ctx = EncodeContext { session: &session_id, target: &spec.to };
        let encoded = match args.iter().map(|a| self.encode(a, &ctx)).collect::<Result<Vec<_>>>() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.drop_sessions(self.sessions.close(&session_id), |id, _| {
                    RpcError::ParentSessionClosed(id.to_string())
                });
                return Err(e);
            }
        };

        let mut header = Header::method(&self.wire_id, &spec.to, &spec.method);
        header.parent = spec.remote_parent.clone();
        let mut extra = Packed::map([("args", Packed::List(encoded))]);
        if with_kwargs {
            extra.set("with_kwargs", Packed::Bool(true));
        }

        if !spec.promise {
            if self.sessions.contains(&session_id) {
                header.session = Some(session_id.clone());
            }
            if let Err(e) = self.send_frame(Frame::new(header, extra), spec.chunkable).await {
                self.drop_sessions(self.sessions.close(&session_id), |id, _| {
                    RpcError::ParentSessionClosed(id.to_string())
                });
                return Err(e);
            }
            return Ok(Value::Null);
        }

        header.session = Some(session_id.clone());
        let timeout = spec.timeout.unwrap_or(self.config.method_timeout);
        let (settler, reply) = Settler::new();
        extra.set("promise", self.open_call(&session_id, &spec.to, &spec.method, settler, timeout));

        tracing::debug!(client_id = %self.wire_id, to = %spec.to, method = %spec.method, session = %session_id, "call");
        if let Err(e) = self.send_frame(Frame::new(header, extra), spec.chunkable).await {
            self.drop_sessions(self.sessions.close(&session_id), |_, _| e.clone());
            return Err(e);
        }

        let weak = Arc::downgrade(self);
        let (sid, method) = (session_id.clone(), spec.method.clone());
        let timer = Timer::start(timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&sid, &method);
            }
        });
        drop(self.sessions.attach_timer(&session_id, timer));

        let result = reply.await.unwrap_or(Err(RpcError::Disconnected));
        let nodes = self.sessions.close(&session_id);
        self.drop_sessions(nodes, |_, _| RpcError::ParentSessionClosed(session_id.clone()));
        result
    }

    /// Stores resolve/reject, opens the session and builds the promise map.
    fn open_call(
        self: &Arc<Self>,
        session_id: &str,
        to: &str,
        method: &str,
        settler: Settler,
        timeout: Duration,
    ) -> Packed {
        let on_resolve = settler.clone();
        let resolve = Callable::sync(move |args| {
            on_resolve.settle(Ok(args.into_iter().next().unwrap_or(Value::Null)));
            Ok(Value::Null)
        });
        let on_reject = settler.clone();
        let reject = Callable::sync(move |args| {
            let message = args.first().map(error_message).unwrap_or_else(|| "unknown error".into());
            on_reject.settle(Err(RpcError::Remote(message)));
            Ok(Value::Null)
        });

        let ((resolve_idx, reject_idx), event) =
            self.refs.lock().put_pair(resolve, reject, Some(session_id));
        self.emit_store_event(event);
        self.sessions.open(session_id, to, method, settler, vec![resolve_idx, reject_idx]);

        let weak = Arc::downgrade(self);
        let sid = session_id.to_string();
        let heartbeat = Callable::sync(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.sessions.reset_timer(&sid);
            }
            Ok(Value::Null)
        });
        if let Err(e) = self.sessions.insert_callback(session_id, HEARTBEAT, heartbeat) {
            tracing::warn!(session = %session_id, error = %e, "heartbeat not installed");
        }

        Packed::map([
            ("resolve", CallbackRef { target: &self.wire_id, index: resolve_idx, pair: Some(reject_idx) }.to_packed()),
            ("reject", CallbackRef { target: &self.wire_id, index: reject_idx, pair: Some(resolve_idx) }.to_packed()),
            ("heartbeat", MethodRef::new(&self.wire_id, format!("{session_id}.{HEARTBEAT}"), false).to_packed()),
            ("interval", Packed::Float(timeout.as_secs_f64() / 2.0)),
        ])
    }

    /// Watchdog expiry: reject with a timeout and drop the subtree.
    fn expire(&self, session_id: &str, method: &str) {
        tracing::warn!(client_id = %self.wire_id, session = %session_id, %method, "method call timed out");
        let nodes = self.sessions.close(session_id);
        self.drop_sessions(nodes, |_, node| RpcError::Timeout { method: node.method.clone() });
    }

    /// Settles whatever is still pending in `nodes` and frees their handles.
    fn drop_sessions<F>(&self, nodes: Vec<(String, SessionNode)>, error: F)
    where
        F: Fn(&str, &SessionNode) -> RpcError,
    {
        let mut last_event = None;
        for (id, node) in nodes {
            if let Some(settle) = &node.settle {
                settle.settle(Err(error(&id, &node)));
            }
            let mut refs = self.refs.lock();
            for handle in &node.refs {
                if let Some(event) = refs.release(*handle, Some(&id)) {
                    last_event = Some(event);
                }
            }
        }
        self.emit_store_event(last_event);
    }

    /// Sends a reply (or any value) to a one-shot handle on `to`.
    pub(crate) async fn send_callback(self: &Arc<Self>, to: &str, index: u32, args: Vec<Value>) -> Result<()> {
        let session_id = new_id();
        let ctx = EncodeContext { session: &session_id, target: to };
        let encoded = args.iter().map(|a| self.encode(a, &ctx)).collect::<Result<Vec<_>>>();
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                self.sessions.close(&session_id);
                return Err(e);
            }
        };

        let mut header = Header::callback(&self.wire_id, to, index);
        if self.sessions.contains(&session_id) {
            header.session = Some(session_id);
        }
        let extra = Packed::map([("args", Packed::List(encoded))]);
        self.send_frame(Frame::new(header, extra), true).await
    }

    async fn send_frame(self: &Arc<Self>, frame: Frame, chunkable: bool) -> Result<()> {
        let bytes = frame.encode()?;
        if chunkable && chunk::should_chunk(bytes.len(), self.config.max_message_buffer_size) {
            return self.send_chunked(&frame.header.to, &bytes).await;
        }
        self.transport.send(&bytes).await?;
        Ok(())
    }

    /// Streams `bytes` into the receiver's message cache and has it
    /// dispatch the reassembled message.
    async fn send_chunked(self: &Arc<Self>, to: &str, bytes: &[u8]) -> Result<()> {
        let message_id = new_id();
        let cache = |op: &str| {
            let mut spec = CallSpec::new(
                to,
                format!("{SERVICES_PREFIX}.{BUILTIN_SERVICE_ID}.message_cache.{op}"),
            );
            spec.chunkable = false;
            spec
        };
        tracing::debug!(client_id = %self.wire_id, %to, message_id = %message_id, size = bytes.len(), "sending chunked message");

        let id = Value::str(&message_id);
        self.call_remote(cache("create"), vec![id.clone(), Value::Bool(true)]).await?;
        for piece in chunk::chunks(bytes, self.config.max_message_buffer_size) {
            let appended = self
                .call_remote(cache("append"), vec![id.clone(), Value::Bytes(piece.to_vec())])
                .await;
            if let Err(e) = appended {
                if let Err(cleanup) = self.call_remote(cache("remove"), vec![id.clone()]).await {
                    tracing::debug!(client_id = %self.wire_id, %to, message_id = %message_id, error = %cleanup, "failed to remove partial message");
                }
                return Err(e);
            }
        }
        self.call_remote(cache("process"), vec![id]).await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    //  Inbound
    // ------------------------------------------------------------------------

    fn spawn_pump(inner: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let transport = inner.transport.clone();
        let client_id = inner.wire_id.clone();
        tokio::spawn(async move {
            let reason = loop {
                match transport.recv().await {
                    Ok(Some(bytes)) => match weak.upgrade() {
                        Some(inner) => inner.dispatch(bytes),
                        None => return,
                    },
                    Ok(None) => break "transport closed".to_string(),
                    Err(e) => {
                        tracing::warn!(%client_id, error = %e, "transport error in pump");
                        break e.to_string();
                    }
                }
            };
            if let Some(inner) = weak.upgrade() {
                inner.shutdown(Some(&reason));
            }
        })
    }

    /// Handles one inbound payload on its own task.
    pub(crate) fn dispatch(self: &Arc<Self>, bytes: Vec<u8>) {
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.handle_payload(&bytes).await {
                Ok(()) => {}
                Err(e @ RpcError::CallbackUsed(_)) => {
                    tracing::error!(client_id = %inner.wire_id, error = %e, "stale callback");
                }
                Err(e) => {
                    tracing::warn!(client_id = %inner.wire_id, error = %e, "failed to handle message");
                }
            }
        });
    }

    async fn handle_payload(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        let frame = Frame::decode(bytes)?;
        match frame.header.kind.as_str() {
            TYPE_METHOD => self.handle_method(frame).await,
            TYPE_CALLBACK => self.handle_callback(frame).await,
            other => {
                let mut merged = frame.main.clone();
                if let Packed::Map(entries) = &frame.extra {
                    for (key, value) in entries {
                        merged.set(key, value.clone());
                    }
                }
                let value = self.decode(&merged, &self.decode_context(&frame.header))?;
                self.events.emit(other, &value);
                Ok(())
            }
        }
    }

    fn decode_context(&self, header: &Header) -> DecodeContext {
        let (workspace, _) = split_wire_id(&header.from);
        DecodeContext {
            remote_parent: header.session.clone(),
            local_parent: header.parent.clone(),
            remote_workspace: workspace.map(str::to_string),
        }
    }

    async fn handle_method(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let method = frame
            .header
            .method
            .clone()
            .ok_or_else(|| RpcError::Protocol("method message without method".into()))?;
        let ctx = self.decode_context(&frame.header);
        let promise = match frame.promise() {
            Some(p) => Some(self.decode_promise(p, &ctx)?),
            None => None,
        };

        let outcome = self.invoke(&frame, &method, &ctx, promise.as_ref()).await;
        match (outcome, promise) {
            (Ok(value), Some(promise)) => {
                if let Err(e) = promise.resolve.call(vec![value]).await {
                    tracing::warn!(client_id = %self.wire_id, %method, error = %e, "failed to send result");
                    if let Err(e) = promise.reject.call(vec![Value::str(e.to_string())]).await {
                        tracing::warn!(client_id = %self.wire_id, %method, error = %e, "failed to send rejection");
                    }
                }
            }
            (Err(e), Some(promise)) => {
                tracing::debug!(client_id = %self.wire_id, %method, error = %e, "rejecting call");
                if let Err(e) = promise.reject.call(vec![Value::str(e.to_string())]).await {
                    tracing::warn!(client_id = %self.wire_id, %method, error = %e, "failed to send rejection");
                }
            }
            (Err(e), None) => {
                tracing::warn!(client_id = %self.wire_id, %method, from = %frame.header.from, error = %e, "method failed");
            }
            (Ok(_), None) => {}
        }
        Ok(())
    }

    async fn invoke(
        self: &Arc<Self>,
        frame: &Frame,
        method: &str,
        ctx: &DecodeContext,
        promise: Option<&Promise>,
    ) -> Result<Value> {
        let header = &frame.header;
        if let Some(parent) = &header.parent {
            if !self.sessions.contains(parent) {
                return Err(RpcError::ParentSessionClosed(parent.clone()));
            }
        }

        let (callable, require_context, run_in_executor) = if is_service_path(method) {
            let resolved = self.services.resolve(
                method,
                ctx.remote_workspace.as_deref(),
                self.config.workspace.as_deref(),
            )?;
            let a = resolved.annotation;
            (resolved.callable, a.require_context, a.run_in_executor)
        } else {
            (self.sessions.lookup(method, &header.from)?, false, false)
        };

        let mut args = frame
            .args()
            .iter()
            .map(|a| self.decode(a, ctx))
            .collect::<Result<Vec<_>>>()?;
        if frame.with_kwargs() && !matches!(args.last(), Some(Value::Map(_))) {
            return Err(RpcError::InvalidArgument(format!("{method}: keyword arguments must be a map")));
        }
        if require_context {
            args.push(self.caller_context(header));
        }

        let beat = promise
            .and_then(|p| p.heartbeat.clone())
            .map(|(heartbeat, every)| tokio::spawn(heartbeat_loop(heartbeat, every)));

        let result = if run_in_executor {
            match tokio::spawn(callable.call(args)).await {
                Ok(result) => result,
                Err(e) => Err(RpcError::Remote(format!("method task failed: {e}"))),
            }
        } else {
            callable.call(args).await
        };

        if let Some(beat) = beat {
            beat.abort();
        }
        result
    }

    fn caller_context(&self, header: &Header) -> Value {
        let (workspace, _) = split_wire_id(&header.from);
        let mut context = Value::map([
            ("from", Value::str(&header.from)),
            ("to", Value::str(&header.to)),
            ("ws", workspace.map(Value::str).unwrap_or(Value::Null)),
        ]);
        for (key, value) in &self.config.default_context {
            context.set(key, value.clone());
        }
        context
    }

    fn decode_promise(self: &Arc<Self>, packed: &Packed, ctx: &DecodeContext) -> Result<Promise> {
        let value = self.decode(packed, ctx)?;
        let function = |key: &str| value.get(key).and_then(Value::as_function).cloned();
        let resolve = function("resolve").ok_or_else(|| RpcError::Protocol("promise without resolve".into()))?;
        let reject = function("reject").ok_or_else(|| RpcError::Protocol("promise without reject".into()))?;
        let interval = value
            .get("interval")
            .and_then(Value::as_float)
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        let heartbeat = function("heartbeat").zip(interval);
        Ok(Promise { resolve, reject, heartbeat })
    }

    async fn handle_callback(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let index = frame
            .header
            .index
            .ok_or_else(|| RpcError::Protocol("callback message without index".into()))?;
        let (callable, event) = self.refs.lock().fetch(index);
        self.emit_store_event(event);
        let callable = callable.ok_or_else(|| {
            RpcError::CallbackUsed(format!("handle {index} from {}", frame.header.from))
        })?;

        let ctx = self.decode_context(&frame.header);
        let args = frame
            .args()
            .iter()
            .map(|a| self.decode(a, &ctx))
            .collect::<Result<Vec<_>>>()?;
        callable.call(args).await?;
        Ok(())
    }

    pub(crate) fn emit_store_event(&self, event: Option<StoreEvent>) {
        if let Some(event) = event {
            self.events.emit(event.name(), &Value::Null);
        }
    }

    // ------------------------------------------------------------------------
    //  Lifecycle
    // ------------------------------------------------------------------------

    /// Asks the manager for connection info and keeps the transport's
    /// reconnection token fresh, refreshing at 80% of its lifetime.
    async fn connection_info_loop(weak: Weak<Self>, manager: String) {
        let method = format!("{SERVICES_PREFIX}.default.get_connection_info");
        loop {
            let Some(inner) = weak.upgrade() else { return };
            let info = match inner.call_remote(CallSpec::new(&manager, &method), Vec::new()).await {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!(client_id = %inner.wire_id, error = %e, "failed to fetch connection info");
                    return;
                }
            };
            tracing::debug!(client_id = %inner.wire_id, "connection info received");

            let token = info.get("reconnection_token").and_then(Value::as_str);
            match token {
                Some(token) if inner.transport.supports_reconnection_token() => {
                    inner.transport.set_reconnection_token(token);
                }
                _ => return,
            }
            let Some(lifetime) = info
                .get("reconnection_token_life_time")
                .and_then(Value::as_float)
                .filter(|secs| secs.is_finite() && *secs > 0.0)
            else {
                return;
            };
            drop(inner);
            tokio::time::sleep(Duration::from_secs_f64(lifetime * 0.8)).await;
        }
    }

    fn shutdown(&self, reason: Option<&str>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(client_id = %self.wire_id, reason = reason.unwrap_or(""), "peer disconnecting");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.drop_sessions(self.sessions.close_all(), |_, _| RpcError::Disconnected);
        let event = self.refs.lock().clear();
        self.emit_store_event(event);
        self.events.emit(
            "disconnect",
            &Value::map([("reason", reason.map(Value::str).unwrap_or(Value::Null))]),
        );
    }
}

async fn heartbeat_loop(heartbeat: Callable, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = heartbeat.call(Vec::new()).await {
            tracing::debug!(error = %e, "heartbeat stopped");
            return;
        }
    }
}

/// Message carried by a rejection value.
fn error_message(value: &Value) -> String {
    match value {
        Value::Str(s) | Value::Error(s) => s.clone(),
        other => format!("{other:?}"),
    }
}
