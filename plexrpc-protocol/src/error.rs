//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding payloads and handshakes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected end of input: need {needed} more bytes")]
    OutOfBounds { needed: usize },

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("varint is malformed or exceeds 64 bits")]
    InvalidVarint,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("invalid handshake flags: {0:#04x}")]
    InvalidFlags(u8),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("value not representable by this codec: {0}")]
    UnsupportedValue(&'static str),
}
