//! Capability handshake wire format.
//!
//! Layout (1 byte flags + optional fixed proof):
//!
//! ```text
//! +-------+----------------------+
//! | flags | [proof]              |
//! | 1 byte| 32 bytes if flags&1  |
//! +-------+----------------------+
//! ```

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Length of a capability proof in bytes.
pub const PROOF_LEN: usize = 32;

/// Flag bit: a proof follows the flags byte.
pub const FLAG_PROOF: u8 = 1;

/// Valid flag bits for version 1 of the handshake.
const VALID_MASK: u8 = FLAG_PROOF;

/// Encodes a handshake message, with or without a proof.
pub fn encode_handshake(proof: Option<&[u8; PROOF_LEN]>) -> Bytes {
    match proof {
        Some(proof) => {
            let mut buf = BytesMut::with_capacity(1 + PROOF_LEN);
            buf.put_u8(FLAG_PROOF);
            buf.put_slice(proof);
            buf.freeze()
        }
        None => Bytes::from_static(&[0]),
    }
}

/// Decodes a handshake message.
///
/// Returns the proof when one is present. Truncated input, unknown flag
/// bits and trailing bytes are all rejected.
pub fn decode_handshake(bytes: &[u8]) -> Result<Option<[u8; PROOF_LEN]>, ProtocolError> {
    let (&flags, rest) = bytes
        .split_first()
        .ok_or(ProtocolError::OutOfBounds { needed: 1 })?;
    if flags & !VALID_MASK != 0 {
        return Err(ProtocolError::InvalidFlags(flags));
    }

    if flags & FLAG_PROOF == 0 {
        if !rest.is_empty() {
            return Err(ProtocolError::TrailingBytes(rest.len()));
        }
        return Ok(None);
    }

    if rest.len() < PROOF_LEN {
        return Err(ProtocolError::OutOfBounds {
            needed: PROOF_LEN - rest.len(),
        });
    }
    if rest.len() > PROOF_LEN {
        return Err(ProtocolError::TrailingBytes(rest.len() - PROOF_LEN));
    }

    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(rest);
    Ok(Some(proof))
}
