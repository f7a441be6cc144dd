//! # plexrpc-transport
//!
//! The transport contract the plexrpc router consumes, together with an
//! in-memory loopback implementation.
//!
//! The real transport owns framing, stream multiplexing and connection
//! establishment; this crate pins down only the seam the router talks to:
//! - attaching a responder (with an optional handshake payload) to a
//!   connection
//! - binding method names to async byte handlers on that responder
//! - the session open hook, where handshake verification happens
//! - the [`WireError`] shape signaled back to a calling peer
//!
//! The [`mem`] module provides a loopback transport used by every test in
//! the workspace.

pub mod error;
pub mod mem;

pub use error::{codes, TransportError, WireError};
pub use mem::{pair, Connection, Responder, Session};

use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Handler bound to one method name on a responder.
///
/// Takes the raw request payload and yields the raw response payload, or
/// a wire error the transport signals back to the caller.
pub type MethodHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, WireError>> + Send + Sync>;

/// Hook invoked once when a peer opens a session against a responder.
///
/// Receives the session handle (so the hook may destroy it) and the
/// peer's handshake payload, if the peer sent one.
pub type OpenHook = Arc<dyn Fn(&Session, Option<&[u8]>) + Send + Sync>;

/// Options for attaching a responder to a connection.
#[derive(Debug, Clone)]
pub struct ResponderOptions {
    /// Responder id; peers address the responder by this value.
    pub id: Bytes,
    /// Handshake payload emitted to the peer on session open.
    pub handshake: Option<Bytes>,
}

impl ResponderOptions {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            handshake: None,
        }
    }

    /// Sets the handshake payload.
    pub fn with_handshake(mut self, handshake: Bytes) -> Self {
        self.handshake = Some(handshake);
        self
    }
}
