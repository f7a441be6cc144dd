//! Router error types and stable error codes.

use plexrpc_protocol::ProtocolError;
use plexrpc_transport::{TransportError, WireError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Stable error codes surfaced to peers.
///
/// These codes are part of the wire contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Lifecycle errors
    RouterNotReady,
    RouterClosed,

    // Limiter errors
    RateLimitExceeded,
    RateLimitMiddlewareDestroyed,
    ConcurrentLimitExceeded,
    ConcurrentLimitMiddlewareDestroyed,

    // Codec errors
    DecodeError,
    EncodeError,

    // Handshake errors
    CapabilityInvalid,

    // Dispatch errors
    HandlerError,
    AggregateError,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::RouterNotReady => write!(f, "ROUTER_NOT_READY"),
            ErrorCode::RouterClosed => write!(f, "ROUTER_CLOSED"),
            ErrorCode::RateLimitExceeded => write!(f, "RATE_LIMIT_EXCEEDED"),
            ErrorCode::RateLimitMiddlewareDestroyed => {
                write!(f, "RATE_LIMIT_MIDDLEWARE_DESTROYED")
            }
            ErrorCode::ConcurrentLimitExceeded => write!(f, "CONCURRENT_LIMIT_EXCEEDED"),
            ErrorCode::ConcurrentLimitMiddlewareDestroyed => {
                write!(f, "CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED")
            }
            ErrorCode::DecodeError => write!(f, "DECODE_ERROR"),
            ErrorCode::EncodeError => write!(f, "ENCODE_ERROR"),
            ErrorCode::CapabilityInvalid => write!(f, "CAPABILITY_INVALID"),
            ErrorCode::HandlerError => write!(f, "HANDLER_ERROR"),
            ErrorCode::AggregateError => write!(f, "AGGREGATE_ERROR"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router is not open")]
    NotReady,

    #[error("router is closed")]
    Closed,

    #[error("method already registered: {0}")]
    DuplicateMethod(String),

    #[error("rate limit exceeded for key {key}")]
    RateLimitExceeded { key: String },

    #[error("rate limit middleware destroyed")]
    RateLimitDestroyed,

    #[error("concurrent request limit exceeded for key {key}")]
    ConcurrentLimitExceeded { key: String },

    #[error("concurrent limit middleware destroyed")]
    ConcurrentLimitDestroyed,

    #[error("request decode failed")]
    Decode(#[source] ProtocolError),

    #[error("response encode failed")]
    Encode(#[source] ProtocolError),

    #[error("capability verification failed")]
    CapabilityInvalid,

    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl RouterError {
    /// Wraps an arbitrary handler failure.
    pub fn handler(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        RouterError::Handler(err.into())
    }

    /// A handler failure built from a plain message.
    pub fn handler_msg(message: impl fmt::Display) -> Self {
        RouterError::Handler(message.to_string().into())
    }

    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::NotReady => ErrorCode::RouterNotReady,
            RouterError::Closed => ErrorCode::RouterClosed,
            RouterError::DuplicateMethod(_) => ErrorCode::InternalError,
            RouterError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            RouterError::RateLimitDestroyed => ErrorCode::RateLimitMiddlewareDestroyed,
            RouterError::ConcurrentLimitExceeded { .. } => ErrorCode::ConcurrentLimitExceeded,
            RouterError::ConcurrentLimitDestroyed => {
                ErrorCode::ConcurrentLimitMiddlewareDestroyed
            }
            RouterError::Decode(_) => ErrorCode::DecodeError,
            RouterError::Encode(_) => ErrorCode::EncodeError,
            RouterError::CapabilityInvalid => ErrorCode::CapabilityInvalid,
            RouterError::Handler(_) => ErrorCode::HandlerError,
            RouterError::Transport(_) => ErrorCode::InternalError,
            RouterError::Aggregate(_) => ErrorCode::AggregateError,
        }
    }

    /// Converts to the wire shape, stamping the request id when known.
    pub fn to_wire(&self, request_id: Option<Uuid>) -> WireError {
        let mut wire = WireError::new(self.code().to_string(), self.to_string());
        if let Some(source) = std::error::Error::source(self) {
            wire = wire.with_cause(WireError::new("CAUSE", source.to_string()));
        }
        if let Some(id) = request_id {
            wire = wire.with_context(id.to_string());
        }
        wire
    }
}

/// An ordered collection of errors from a multi-step cleanup path.
///
/// Nested aggregates are spliced flat; order of occurrence is preserved.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<RouterError>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds an error in, splicing nested aggregates.
    pub fn push(&mut self, err: RouterError) {
        match err {
            RouterError::Aggregate(nested) => self.errors.extend(nested.errors),
            other => self.errors.push(other),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[RouterError] {
        &self.errors
    }

    /// Resolves the aggregate: empty is success, a singleton collapses to
    /// the error itself, anything more stays an aggregate.
    pub fn into_result(mut self) -> Result<(), RouterError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(RouterError::Aggregate(self)),
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::RouterNotReady.to_string(), "ROUTER_NOT_READY");
        assert_eq!(ErrorCode::RouterClosed.to_string(), "ROUTER_CLOSED");
        assert_eq!(
            ErrorCode::RateLimitExceeded.to_string(),
            "RATE_LIMIT_EXCEEDED"
        );
        assert_eq!(
            ErrorCode::RateLimitMiddlewareDestroyed.to_string(),
            "RATE_LIMIT_MIDDLEWARE_DESTROYED"
        );
        assert_eq!(
            ErrorCode::ConcurrentLimitExceeded.to_string(),
            "CONCURRENT_LIMIT_EXCEEDED"
        );
        assert_eq!(
            ErrorCode::ConcurrentLimitMiddlewareDestroyed.to_string(),
            "CONCURRENT_LIMIT_MIDDLEWARE_DESTROYED"
        );
        assert_eq!(ErrorCode::DecodeError.to_string(), "DECODE_ERROR");
        assert_eq!(ErrorCode::EncodeError.to_string(), "ENCODE_ERROR");
        assert_eq!(
            ErrorCode::CapabilityInvalid.to_string(),
            "CAPABILITY_INVALID"
        );
    }

    #[test]
    fn test_error_code_serialization_matches_display() {
        let json = serde_json::to_string(&ErrorCode::CapabilityInvalid).unwrap();
        assert_eq!(json, "\"CAPABILITY_INVALID\"");
        let parsed: ErrorCode = serde_json::from_str("\"RATE_LIMIT_EXCEEDED\"").unwrap();
        assert_eq!(parsed, ErrorCode::RateLimitExceeded);
    }

    #[test]
    fn test_to_wire_attaches_cause_and_context() {
        let id = Uuid::new_v4();
        let err = RouterError::Decode(ProtocolError::InvalidUtf8);
        let wire = err.to_wire(Some(id));

        assert_eq!(wire.code, "DECODE_ERROR");
        assert_eq!(wire.context.as_deref(), Some(id.to_string().as_str()));
        assert!(wire.cause.unwrap().message.contains("UTF-8"));
    }

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(AggregateError::new().into_result().is_ok());
    }

    #[test]
    fn test_aggregate_singleton_collapses() {
        let mut agg = AggregateError::new();
        agg.push(RouterError::NotReady);
        let err = agg.into_result().unwrap_err();
        assert!(matches!(err, RouterError::NotReady));
    }

    #[test]
    fn test_aggregate_flattens_nested() {
        let mut inner = AggregateError::new();
        inner.push(RouterError::NotReady);
        inner.push(RouterError::Closed);

        let mut outer = AggregateError::new();
        outer.push(RouterError::CapabilityInvalid);
        outer.push(RouterError::Aggregate(inner));

        let err = outer.into_result().unwrap_err();
        match err {
            RouterError::Aggregate(agg) => {
                let codes: Vec<_> = agg.errors().iter().map(RouterError::code).collect();
                assert_eq!(
                    codes,
                    vec![
                        ErrorCode::CapabilityInvalid,
                        ErrorCode::RouterNotReady,
                        ErrorCode::RouterClosed,
                    ]
                );
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_display_lists_all() {
        let mut agg = AggregateError::new();
        agg.push(RouterError::NotReady);
        agg.push(RouterError::Closed);
        let text = agg.to_string();
        assert!(text.starts_with("2 errors: "));
        assert!(text.contains("not open"));
        assert!(text.contains("closed"));
    }
}
