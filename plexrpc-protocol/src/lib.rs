//! # plexrpc-protocol
//!
//! Wire-level building blocks for plexrpc responders.
//!
//! This crate provides:
//! - The [`Value`] payload model (raw bytes, UTF-8 text, JSON)
//! - The codec contract (`preencode`/`encode`/`decode` over an explicit
//!   state) with raw, UTF-8 and JSON codecs
//! - The capability handshake wire format (flags byte + 32-byte proof)
//! - The capability proof helper (HMAC-SHA256)

pub mod capability;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod value;

pub use codec::{decode, decode_value, encode, Codec, DecodeState, EncodeState};
pub use codec::{JsonCodec, RawCodec, Utf8Codec};
pub use error::ProtocolError;
pub use handshake::{decode_handshake, encode_handshake, FLAG_PROOF, PROOF_LEN};
pub use value::Value;
