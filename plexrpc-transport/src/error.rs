//! Transport error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable wire codes the transport itself produces.
pub mod codes {
    /// A responder handler failed; the original failure is the cause.
    pub const REQUEST_ERROR: &str = "REQUEST_ERROR";
    /// The requested method is not bound on the responder.
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    /// The responder was closed by its owner.
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";
    /// The session was destroyed before the request was made.
    pub const SESSION_DESTROYED: &str = "SESSION_DESTROYED";
}

/// An error signaled to the calling peer.
///
/// This is the wire shape: a stable code, a human message, an optional
/// request-correlation context and an optional cause chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable error code.
    pub code: String,

    /// Human-readable message.
    pub message: String,

    /// Correlation context (the request id, when one exists).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// The underlying failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WireError>>,
}

impl WireError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: None,
            cause: None,
        }
    }

    /// Sets the correlation context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: WireError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Wraps a handler failure in the transport's request-error envelope.
    pub fn request_error(cause: WireError) -> Self {
        Self {
            code: codes::REQUEST_ERROR.to_string(),
            message: format!("request failed: {}", cause.message),
            context: cause.context.clone(),
            cause: Some(Box::new(cause)),
        }
    }

    /// The deepest code in the cause chain.
    pub fn root_code(&self) -> &str {
        match &self.cause {
            Some(cause) => cause.root_code(),
            None => &self.code,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(context) = &self.context {
            write!(f, " (request {context})")?;
        }
        Ok(())
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Local attach-time errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("a responder with this id is already attached")]
    DuplicateResponder,

    #[error("no responder with the requested id")]
    UnknownResponder,

    #[error("the responder is closed")]
    ResponderClosed,
}
