//! Capability handshake gate.
//!
//! When a router carries a capability configuration, every attach
//! installs a handshake: the local side emits its proof on session open,
//! and the peer's proof is verified exactly once. A peer that presents
//! no proof or a wrong proof has its session destroyed; the rejection is
//! observable only through the router's capability-error events.

use crate::error::RouterError;
use bytes::Bytes;
use plexrpc_protocol::{capability, decode_handshake, encode_handshake};
use plexrpc_transport::Connection;
use std::sync::atomic::{AtomicBool, Ordering};

/// Capability configuration for a router.
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    /// Namespace the proof is bound to.
    pub namespace: String,
    /// Shared capability token.
    pub capability: Bytes,
}

/// A capability rejection event.
#[derive(Debug, Clone)]
pub struct CapabilityReject {
    /// The connection whose peer failed verification.
    pub connection: Connection,
}

/// Per-attach verification state.
pub(crate) struct CapabilityGate {
    config: CapabilityConfig,
    verified: AtomicBool,
}

impl CapabilityGate {
    pub(crate) fn new(config: CapabilityConfig) -> Self {
        Self {
            config,
            verified: AtomicBool::new(false),
        }
    }

    /// The handshake payload this side emits: its own proof for the
    /// connection's session key.
    pub(crate) fn local_handshake(&self, connection: &Connection) -> Bytes {
        let proof = capability::proof(
            &self.config.namespace,
            &self.config.capability,
            &connection.session_key(),
        );
        encode_handshake(Some(&proof))
    }

    /// Marks the gate verified, returning whether it already was.
    ///
    /// Verification runs exactly once per attached connection.
    pub(crate) fn already_verified(&self) -> bool {
        self.verified.swap(true, Ordering::SeqCst)
    }

    /// Verifies the peer's handshake. A missing handshake, a malformed
    /// one, an absent proof and a wrong proof all fail.
    pub(crate) fn verify(
        &self,
        connection: &Connection,
        handshake: Option<&[u8]>,
    ) -> Result<(), RouterError> {
        let presented = handshake
            .and_then(|bytes| decode_handshake(bytes).ok())
            .flatten()
            .ok_or(RouterError::CapabilityInvalid)?;

        if capability::verify(
            &self.config.namespace,
            &self.config.capability,
            &connection.session_key(),
            &presented,
        ) {
            Ok(())
        } else {
            Err(RouterError::CapabilityInvalid)
        }
    }
}
