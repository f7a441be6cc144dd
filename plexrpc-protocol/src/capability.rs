//! Capability proof computation and verification.
//!
//! A proof is an HMAC-SHA256 keyed by the capability token over the
//! namespace and the connection's session key, so it binds the token to
//! one handshake transcript and cannot be replayed across connections.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::handshake::PROOF_LEN;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator between the namespace and the session key.
const SEPARATOR: &[u8] = &[0x00];

fn mac(namespace: &str, capability: &[u8], session_key: &[u8; 32]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(capability).expect("HMAC key");
    mac.update(namespace.as_bytes());
    mac.update(SEPARATOR);
    mac.update(session_key);
    mac
}

/// Computes the capability proof for one connection.
pub fn proof(namespace: &str, capability: &[u8], session_key: &[u8; 32]) -> [u8; PROOF_LEN] {
    let digest = mac(namespace, capability, session_key).finalize().into_bytes();
    let mut out = [0u8; PROOF_LEN];
    out.copy_from_slice(&digest);
    out
}

/// Verifies a presented proof in constant time.
pub fn verify(
    namespace: &str,
    capability: &[u8],
    session_key: &[u8; 32],
    presented: &[u8],
) -> bool {
    mac(namespace, capability, session_key)
        .verify_slice(presented)
        .is_ok()
}
