//! Dynamic payload values.

use crate::error::ProtocolError;
use bytes::Bytes;

/// A payload value flowing through a responder pipeline.
///
/// Payloads arrive from the transport as [`Value::Raw`]; codecs move them
/// between variants. Handlers may return any variant and the dispatch
/// pipeline coerces the result back to bytes before it reaches the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Uninterpreted bytes.
    Raw(Bytes),
    /// A UTF-8 string.
    Text(String),
    /// A JSON document.
    Json(serde_json::Value),
}

impl Value {
    /// Creates a raw value from anything byte-like.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Value::Raw(bytes.into())
    }

    /// Creates a text value.
    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }

    /// Creates a JSON value.
    pub fn json(value: serde_json::Value) -> Self {
        Value::Json(value)
    }

    /// Returns the raw bytes if this is a raw value.
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            Value::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the string if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the JSON document if this is a JSON value.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(value) => Some(value),
            _ => None,
        }
    }

    /// A short tag naming the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Raw(_) => "raw",
            Value::Text(_) => "text",
            Value::Json(_) => "json",
        }
    }

    /// Coerces the value into bytes for the wire.
    ///
    /// Raw values pass through untouched, text becomes its UTF-8 bytes and
    /// JSON serializes to its compact form.
    pub fn into_bytes(self) -> Result<Bytes, ProtocolError> {
        match self {
            Value::Raw(bytes) => Ok(bytes),
            Value::Text(text) => Ok(Bytes::from(text.into_bytes())),
            Value::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Raw(bytes)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Value::Json(value)
    }
}
