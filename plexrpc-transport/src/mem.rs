//! In-memory loopback transport.
//!
//! [`pair`] yields two linked connections with distinct identity keys and
//! a shared session key (the handshake transcript a capability proof
//! binds to). One side attaches responders; the other opens sessions
//! against them and issues requests. All state lives in a shared
//! registry, so the loopback preserves the ordering and error semantics
//! of the real multiplexed transport without any I/O.

use crate::error::{codes, TransportError, WireError};
use crate::{MethodHandler, OpenHook, ResponderOptions};
use bytes::Bytes;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct Endpoint {
    host: String,
    public_key: [u8; 32],
    responders: Mutex<HashMap<Bytes, Arc<ResponderInner>>>,
}

struct PairInner {
    session_key: [u8; 32],
    sides: [Endpoint; 2],
}

/// One side of a loopback connection pair.
#[derive(Clone)]
pub struct Connection {
    side: usize,
    pair: Arc<PairInner>,
}

/// Creates a linked connection pair.
pub fn pair() -> (Connection, Connection) {
    let mut rng = rand::thread_rng();
    let mut session_key = [0u8; 32];
    rng.fill_bytes(&mut session_key);

    let mut key_a = [0u8; 32];
    let mut key_b = [0u8; 32];
    rng.fill_bytes(&mut key_a);
    rng.fill_bytes(&mut key_b);

    let inner = Arc::new(PairInner {
        session_key,
        sides: [
            Endpoint {
                host: "10.0.0.1:49001".to_string(),
                public_key: key_a,
                responders: Mutex::new(HashMap::new()),
            },
            Endpoint {
                host: "10.0.0.2:49002".to_string(),
                public_key: key_b,
                responders: Mutex::new(HashMap::new()),
            },
        ],
    });

    (
        Connection {
            side: 0,
            pair: inner.clone(),
        },
        Connection {
            side: 1,
            pair: inner,
        },
    )
}

impl Connection {
    fn local(&self) -> &Endpoint {
        &self.pair.sides[self.side]
    }

    fn peer(&self) -> &Endpoint {
        &self.pair.sides[self.side ^ 1]
    }

    /// The peer's host string.
    pub fn remote_host(&self) -> String {
        self.peer().host.clone()
    }

    /// The peer's 32-byte identity key.
    pub fn remote_public_key(&self) -> [u8; 32] {
        self.peer().public_key
    }

    /// This side's 32-byte identity key.
    pub fn local_public_key(&self) -> [u8; 32] {
        self.local().public_key
    }

    /// The handshake transcript key both sides share.
    pub fn session_key(&self) -> [u8; 32] {
        self.pair.session_key
    }

    /// Attaches a responder on this side of the connection.
    pub fn attach_responder(
        &self,
        options: ResponderOptions,
    ) -> Result<Responder, TransportError> {
        let mut responders = self.local().responders.lock().unwrap();
        if responders.contains_key(&options.id) {
            return Err(TransportError::DuplicateResponder);
        }
        let inner = Arc::new(ResponderInner {
            id: options.id.clone(),
            handshake: options.handshake,
            methods: Mutex::new(HashMap::new()),
            open_hook: Mutex::new(None),
            closed: AtomicBool::new(false),
            session: Mutex::new(None),
        });
        responders.insert(options.id, inner.clone());
        tracing::debug!(host = %self.local().host, "responder attached");
        Ok(Responder { inner })
    }

    /// Opens a session against a responder the peer attached.
    ///
    /// The responder's open hook fires exactly once, on the first open;
    /// later opens return the existing session, destroyed or not.
    pub fn open_session(
        &self,
        responder_id: &[u8],
        handshake: Option<Bytes>,
    ) -> Result<Session, TransportError> {
        let responder_id = Bytes::copy_from_slice(responder_id);
        let responder = self
            .peer()
            .responders
            .lock()
            .unwrap()
            .get(&responder_id)
            .cloned()
            .ok_or(TransportError::UnknownResponder)?;
        if responder.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResponderClosed);
        }

        let session = {
            let mut slot = responder.session.lock().unwrap();
            if let Some(existing) = &*slot {
                return Ok(existing.clone());
            }
            let session = Session {
                inner: Arc::new(SessionInner {
                    responder: responder.clone(),
                    destroyed: Mutex::new(None),
                }),
            };
            *slot = Some(session.clone());
            session
        };

        let hook = responder.open_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(&session, handshake.as_deref());
        }
        Ok(session)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.local().host)
            .field("remote", &self.peer().host)
            .finish()
    }
}

struct ResponderInner {
    id: Bytes,
    handshake: Option<Bytes>,
    methods: Mutex<HashMap<String, MethodHandler>>,
    open_hook: Mutex<Option<OpenHook>>,
    closed: AtomicBool,
    session: Mutex<Option<Session>>,
}

/// A set of method bindings one side exposes to its peer.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl Responder {
    /// The responder id peers address.
    pub fn id(&self) -> &Bytes {
        &self.inner.id
    }

    /// Binds a handler to a method name, replacing any previous binding.
    pub fn respond(&self, method: &str, handler: MethodHandler) {
        self.inner
            .methods
            .lock()
            .unwrap()
            .insert(method.to_string(), handler);
    }

    /// Installs the session open hook.
    pub fn set_open_hook(&self, hook: OpenHook) {
        *self.inner.open_hook.lock().unwrap() = Some(hook);
    }

    /// The handshake payload this responder emits on session open.
    pub fn handshake(&self) -> Option<Bytes> {
        self.inner.handshake.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the responder: drops all bindings and destroys the live
    /// session, so in-flight peers observe the close.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.methods.lock().unwrap().clear();
        let session = self.inner.session.lock().unwrap().clone();
        if let Some(session) = session {
            session.destroy(WireError::new(codes::CHANNEL_CLOSED, "responder closed"));
        }
        tracing::debug!("responder closed");
    }
}

struct SessionInner {
    responder: Arc<ResponderInner>,
    destroyed: Mutex<Option<WireError>>,
}

/// A peer's view of an open responder session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Destroys the session; the first reason sticks.
    pub fn destroy(&self, err: WireError) {
        let mut destroyed = self.inner.destroyed.lock().unwrap();
        if destroyed.is_none() {
            tracing::debug!(code = %err.code, "session destroyed");
            *destroyed = Some(err);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.lock().unwrap().is_some()
    }

    /// The reason the session was destroyed, if it was.
    pub fn destroy_reason(&self) -> Option<WireError> {
        self.inner.destroyed.lock().unwrap().clone()
    }

    /// The responder's handshake payload.
    pub fn handshake(&self) -> Option<Bytes> {
        self.inner.responder.handshake.clone()
    }

    /// Calls a method on the responder.
    ///
    /// Handler failures come back wrapped in the transport's
    /// request-error envelope with the original failure as the cause.
    pub async fn request(
        &self,
        method: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, WireError> {
        if let Some(err) = self.destroy_reason() {
            return Err(err);
        }
        if self.inner.responder.closed.load(Ordering::SeqCst) {
            return Err(WireError::new(codes::CHANNEL_CLOSED, "responder closed"));
        }
        let handler = self
            .inner
            .responder
            .methods
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .ok_or_else(|| {
                WireError::new(codes::UNKNOWN_METHOD, format!("unknown method: {method}"))
            })?;

        match handler(payload.into()).await {
            Ok(bytes) => Ok(bytes),
            Err(err) => Err(WireError::request_error(err)),
        }
    }
}
