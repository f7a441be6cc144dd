//! Per-request context.

use plexrpc_protocol::Value;
use plexrpc_transport::Connection;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// The per-invocation carrier passed to every middleware and the handler.
///
/// A cheap handle: clones share the same underlying state, so a mutation
/// made by one middleware is observed by everything downstream, including
/// the handler. Lives for exactly one invocation.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    request_id: Uuid,
    method: String,
    connection: Connection,
    value: Mutex<Value>,
    extensions: Mutex<Extensions>,
}

impl RequestContext {
    pub(crate) fn new(method: impl Into<String>, value: Value, connection: Connection) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id: Uuid::new_v4(),
                method: method.into(),
                connection,
                value: Mutex::new(value),
                extensions: Mutex::new(Extensions::default()),
            }),
        }
    }

    /// The fresh id allocated for this request.
    pub fn request_id(&self) -> Uuid {
        self.inner.request_id
    }

    /// The method being invoked.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// The connection the request arrived on.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// A snapshot of the current payload value.
    pub fn value(&self) -> Value {
        self.inner.value.lock().unwrap().clone()
    }

    /// Replaces the payload value.
    ///
    /// The encoding adapter uses this to swap the raw inbound bytes for
    /// their decoded form.
    pub fn set_value(&self, value: Value) {
        *self.inner.value.lock().unwrap() = value;
    }

    /// Stores a typed extension, replacing any previous value of the
    /// same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.inner.extensions.lock().unwrap().insert(value);
    }

    /// Reads a typed extension.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.extensions.lock().unwrap().get::<T>()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.inner.request_id)
            .field("method", &self.inner.method)
            .finish()
    }
}

/// A `TypeId`-keyed side table for middleware-added context fields.
#[derive(Default)]
struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        let (server, _client) = plexrpc_transport::pair();
        RequestContext::new("echo", Value::raw(&b"payload"[..]), server)
    }

    #[test]
    fn test_fresh_request_ids() {
        assert_ne!(ctx().request_id(), ctx().request_id());
    }

    #[test]
    fn test_value_mutation_is_shared() {
        let a = ctx();
        let b = a.clone();
        b.set_value(Value::text("decoded"));
        assert_eq!(a.value(), Value::text("decoded"));
    }

    #[test]
    fn test_extensions_are_shared_and_typed() {
        #[derive(Clone, PartialEq, Debug)]
        struct PeerTag(String);

        let a = ctx();
        let b = a.clone();
        a.insert(PeerTag("alice".into()));

        assert_eq!(b.get::<PeerTag>(), Some(PeerTag("alice".into())));
        assert_eq!(b.get::<u64>(), None);
    }
}
