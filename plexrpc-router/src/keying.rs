//! Key extraction for per-peer limiter middleware.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use plexrpc_transport::Connection;

/// How a limiter buckets peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKey {
    /// Bucket by the peer's remote host string.
    RemoteAddress,
    /// Bucket by the base64 form of the peer's 32-byte identity key.
    RemotePublicKey,
}

impl LimitKey {
    /// Extracts the bucket key for a connection.
    pub fn extract(&self, connection: &Connection) -> String {
        match self {
            LimitKey::RemoteAddress => connection.remote_host(),
            LimitKey::RemotePublicKey => BASE64.encode(connection.remote_public_key()),
        }
    }
}
