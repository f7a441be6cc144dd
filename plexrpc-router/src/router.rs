//! Method routing, lifecycle and per-request dispatch.

use crate::capability::{CapabilityConfig, CapabilityGate, CapabilityReject};
use crate::context::RequestContext;
use crate::error::{AggregateError, RouterError};
use crate::metrics::RouterStats;
use crate::middleware::{Chain, Middleware};
use bytes::Bytes;
use futures::future::BoxFuture;
use plexrpc_protocol::{codec, Codec, RawCodec, Value};
use plexrpc_transport::{Connection, MethodHandler, Responder, ResponderOptions, WireError};
use prometheus::Registry;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Capacity of the capability-error event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// A method handler.
///
/// Implemented for any `Fn(Value, RequestContext) -> Future` closure, so
/// handlers are written as plain async closures. The context is a cheap
/// handle; clone out whatever the future needs before going async.
pub trait Handler: Send + Sync + 'static {
    fn call(
        &self,
        request: Value,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<Value, RouterError>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RouterError>> + Send + 'static,
{
    fn call(
        &self,
        request: Value,
        ctx: RequestContext,
    ) -> BoxFuture<'static, Result<Value, RouterError>> {
        Box::pin(self(request, ctx))
    }
}

/// Per-method registration options.
#[derive(Clone, Default)]
pub struct MethodOptions {
    /// Request codec; defaults to the raw pass-through.
    pub request_encoding: Option<Arc<dyn Codec>>,
    /// Response codec; defaults to the raw pass-through.
    pub response_encoding: Option<Arc<dyn Codec>>,
}

impl MethodOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_encoding(mut self, codec: impl Codec + 'static) -> Self {
        self.request_encoding = Some(Arc::new(codec));
        self
    }

    pub fn with_response_encoding(mut self, codec: impl Codec + 'static) -> Self {
        self.response_encoding = Some(Arc::new(codec));
        self
    }
}

/// A registered method.
pub struct MethodRegistration {
    name: String,
    middleware: Chain,
    request_encoding: Arc<dyn Codec>,
    response_encoding: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
}

impl std::fmt::Debug for MethodRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MethodRegistration {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends method-level middleware, layered inside the router's
    /// global chain.
    pub fn layer(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middleware.layer(middleware);
        self
    }
}

/// Router lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    New,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Binds registered methods to peer connections and runs every request
/// through the composed middleware chain.
pub struct Router {
    capability: Option<CapabilityConfig>,
    global: Chain,
    registrations: Vec<MethodRegistration>,
    state: RouterState,
    stats: Arc<RouterStats>,
    responders: Mutex<Vec<Responder>>,
    capability_events: broadcast::Sender<CapabilityReject>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a router that accepts every peer.
    pub fn new() -> Self {
        let (capability_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            capability: None,
            global: Chain::new(),
            registrations: Vec::new(),
            state: RouterState::New,
            stats: Arc::new(RouterStats::new()),
            responders: Mutex::new(Vec::new()),
            capability_events,
        }
    }

    /// Creates a router that requires peers to prove the capability on
    /// session open.
    pub fn with_capability(namespace: impl Into<String>, capability: impl Into<Bytes>) -> Self {
        let mut router = Self::new();
        router.capability = Some(CapabilityConfig {
            namespace: namespace.into(),
            capability: capability.into(),
        });
        router
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Aggregate counters for this router.
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Number of registered methods.
    pub fn method_count(&self) -> usize {
        self.registrations.len()
    }

    /// Subscribes to capability rejection events.
    pub fn capability_errors(&self) -> broadcast::Receiver<CapabilityReject> {
        self.capability_events.subscribe()
    }

    fn check_mutable(&self) -> Result<(), RouterError> {
        match self.state {
            RouterState::New => Ok(()),
            RouterState::Closing | RouterState::Closed => Err(RouterError::Closed),
            _ => Err(RouterError::NotReady),
        }
    }

    /// Appends global middleware, wrapping every method.
    ///
    /// Legal only before [`open`](Self::open): attached connections see
    /// the chain composed at attach time, so later mutation would never
    /// apply.
    pub fn layer(&mut self, middleware: impl Middleware + 'static) -> Result<&mut Self, RouterError> {
        self.check_mutable()?;
        self.global.layer(middleware);
        Ok(self)
    }

    /// Registers a method. Names are unique; registration is legal only
    /// before [`open`](Self::open).
    pub fn method<H: Handler>(
        &mut self,
        name: &str,
        options: MethodOptions,
        handler: H,
    ) -> Result<&mut MethodRegistration, RouterError> {
        self.check_mutable()?;
        if self.registrations.iter().any(|reg| reg.name == name) {
            return Err(RouterError::DuplicateMethod(name.to_string()));
        }
        self.registrations.push(MethodRegistration {
            name: name.to_string(),
            middleware: Chain::new(),
            request_encoding: options
                .request_encoding
                .unwrap_or_else(|| Arc::new(RawCodec)),
            response_encoding: options
                .response_encoding
                .unwrap_or_else(|| Arc::new(RawCodec)),
            handler: Arc::new(handler),
        });
        let index = self.registrations.len() - 1;
        Ok(&mut self.registrations[index])
    }

    /// Opens the router: global middleware first, then each method's, in
    /// registration order.
    ///
    /// On failure the opened prefix is closed in reverse (failures
    /// logged and swallowed), the router lands in `Closed`, and the
    /// original failure propagates.
    pub async fn open(&mut self) -> Result<(), RouterError> {
        self.check_mutable()?;
        self.state = RouterState::Opening;
        tracing::info!("router opening");

        if let Err(err) = self.global.open().await {
            self.state = RouterState::Closed;
            return Err(err);
        }
        for index in 0..self.registrations.len() {
            if let Err(err) = self.registrations[index].middleware.open().await {
                for opened in self.registrations[..index].iter().rev() {
                    if let Err(close_err) = opened.middleware.close().await {
                        tracing::warn!(
                            method = opened.name.as_str(),
                            error = %close_err,
                            "close failed during open rollback"
                        );
                    }
                }
                if let Err(close_err) = self.global.close().await {
                    tracing::warn!(error = %close_err, "global close failed during open rollback");
                }
                self.state = RouterState::Closed;
                return Err(err);
            }
        }

        self.state = RouterState::Open;
        tracing::info!(methods = self.registrations.len(), "router open");
        Ok(())
    }

    /// Closes the router: responders released first, then each method's
    /// middleware in registration order, then the global chain.
    ///
    /// Every close hook runs; failures surface as one aggregate. The
    /// registration set empties afterwards.
    pub async fn close(&mut self) -> Result<(), RouterError> {
        match self.state {
            RouterState::Open => {}
            RouterState::Closing | RouterState::Closed => return Err(RouterError::Closed),
            _ => return Err(RouterError::NotReady),
        }
        self.state = RouterState::Closing;
        tracing::info!("router closing");

        for responder in self.responders.lock().unwrap().drain(..) {
            responder.close();
        }

        let mut aggregate = AggregateError::new();
        for registration in &self.registrations {
            if let Err(err) = registration.middleware.close().await {
                aggregate.push(err);
            }
        }
        if let Err(err) = self.global.close().await {
            aggregate.push(err);
        }

        self.registrations.clear();
        self.state = RouterState::Closed;

        let result = aggregate.into_result();
        match &result {
            Ok(()) => tracing::info!("router closed"),
            Err(err) => tracing::warn!(error = %err, "router closed with errors"),
        }
        result
    }

    /// Registers the router's counters and fans out to all middleware.
    pub fn register_metrics(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        self.stats.register(registry)?;
        self.global.register_metrics(registry);
        for registration in &self.registrations {
            registration.middleware.register_metrics(registry);
        }
        Ok(())
    }

    /// Attaches every registered method to a connection, using the
    /// peer's public key as the responder id.
    pub fn attach(&self, connection: &Connection) -> Result<Responder, RouterError> {
        let id = Bytes::copy_from_slice(&connection.remote_public_key());
        self.attach_as(connection, id)
    }

    /// Attaches every registered method to a connection under an
    /// explicit responder id.
    ///
    /// The composed middleware chain for each method is built here, once
    /// per attach; it is not rebuilt per request.
    pub fn attach_as(
        &self,
        connection: &Connection,
        responder_id: impl Into<Bytes>,
    ) -> Result<Responder, RouterError> {
        match self.state {
            RouterState::Open => {}
            RouterState::Closing | RouterState::Closed => return Err(RouterError::Closed),
            _ => return Err(RouterError::NotReady),
        }

        let gate = self
            .capability
            .clone()
            .map(|config| Arc::new(CapabilityGate::new(config)));

        let mut options = ResponderOptions::new(responder_id.into());
        if let Some(gate) = &gate {
            options = options.with_handshake(gate.local_handshake(connection));
        }
        let responder = connection.attach_responder(options)?;

        if let Some(gate) = gate {
            let conn = connection.clone();
            let events = self.capability_events.clone();
            responder.set_open_hook(Arc::new(move |session, handshake| {
                if gate.already_verified() {
                    return;
                }
                if let Err(err) = gate.verify(&conn, handshake) {
                    tracing::warn!(remote = %conn.remote_host(), "capability verification failed");
                    session.destroy(err.to_wire(None));
                    let _ = events.send(CapabilityReject {
                        connection: conn.clone(),
                    });
                }
            }));
        }

        for registration in &self.registrations {
            let compiled = Arc::new(CompiledMethod {
                name: registration.name.clone(),
                chain: self.global.compose(&registration.middleware),
                request_encoding: registration.request_encoding.clone(),
                response_encoding: registration.response_encoding.clone(),
                handler: registration.handler.clone(),
                stats: self.stats.clone(),
            });
            let conn = connection.clone();
            let bound: MethodHandler = Arc::new(
                move |payload: Bytes| -> BoxFuture<'static, Result<Bytes, WireError>> {
                    let compiled = compiled.clone();
                    let conn = conn.clone();
                    Box::pin(async move { dispatch(compiled, conn, payload).await })
                },
            );
            responder.respond(&registration.name, bound);
        }

        self.stats.record_connection();
        self.responders.lock().unwrap().push(responder.clone());
        tracing::info!(
            remote = %connection.remote_host(),
            methods = self.registrations.len(),
            "connection attached"
        );
        Ok(responder)
    }
}

/// One method's dispatch state, composed at attach time.
struct CompiledMethod {
    name: String,
    chain: Chain,
    request_encoding: Arc<dyn Codec>,
    response_encoding: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    stats: Arc<RouterStats>,
}

/// Runs one request through the composed chain.
///
/// The terminal decodes the request, invokes the handler and encodes the
/// response; handler failures alone bump the handler-error counter. Any
/// error leaving the chain bumps the error counter and goes to the peer
/// stamped with the request id.
async fn dispatch(
    method: Arc<CompiledMethod>,
    connection: Connection,
    payload: Bytes,
) -> Result<Bytes, WireError> {
    method.stats.record_request();
    let ctx = RequestContext::new(method.name.clone(), Value::Raw(payload), connection);
    let request_id = ctx.request_id();
    tracing::debug!(method = method.name.as_str(), %request_id, "request");

    let terminal_method = method.clone();
    let terminal = move |ctx: RequestContext| -> BoxFuture<'static, Result<Value, RouterError>> {
        let method = terminal_method.clone();
        Box::pin(async move {
            let request = codec::decode_value(method.request_encoding.as_ref(), ctx.value())
                .map_err(RouterError::Decode)?;
            let response = match method.handler.call(request, ctx.clone()).await {
                Ok(value) => value,
                Err(err) => {
                    method.stats.record_handler_error();
                    return Err(err);
                }
            };
            if method.response_encoding.is_passthrough() {
                Ok(response)
            } else {
                let bytes = codec::encode(method.response_encoding.as_ref(), &response)
                    .map_err(RouterError::Encode)?;
                Ok(Value::Raw(bytes))
            }
        })
    };

    let result = match method.chain.run(&ctx, &terminal).await {
        Ok(value) => value.into_bytes().map_err(RouterError::Encode),
        Err(err) => Err(err),
    };

    match result {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            method.stats.record_error();
            tracing::debug!(
                method = method.name.as_str(),
                %request_id,
                code = %err.code(),
                "request failed"
            );
            Err(err.to_wire(Some(request_id)))
        }
    }
}
