//! # Security Envelope
//!
//! Wraps marshalled frames before transmission and unwraps them on
//! receipt. Three modes:
//!
//! - **None**: frames travel in the clear ([`PlainEnvelope`])
//! - **Symmetric**: passphrase-derived XChaCha20-Poly1305 AEAD with
//!   selectable key strength (128/256-bit) and KDF work factor
//! - **Asymmetric**: TLS on the stream itself (see [`tls`]); the frame
//!   envelope stays plain because the transport already encrypts
//!
//! Failure during handshake or decrypt is fatal to that connection
//! attempt only; the engine may retry with a fresh connection.

pub mod symmetric;
pub mod tls;

use crate::config::SecurityMode;
use crate::error::Result;
use std::sync::Arc;

pub use symmetric::SymmetricEnvelope;

/// Applied after marshalling and before transmission; symmetric across
/// sender and receiver given identical configuration.
pub trait Envelope: Send + Sync {
    /// Secure an outbound frame
    fn wrap(&self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Recover the frame from secured bytes
    fn unwrap(&self, secured: &[u8]) -> Result<Vec<u8>>;
}

/// Identity envelope for `SecurityMode::None` and TLS transports
pub struct PlainEnvelope;

impl Envelope for PlainEnvelope {
    fn wrap(&self, frame: &[u8]) -> Result<Vec<u8>> {
        Ok(frame.to_vec())
    }

    fn unwrap(&self, secured: &[u8]) -> Result<Vec<u8>> {
        Ok(secured.to_vec())
    }
}

/// Resolve the configured security mode into a concrete envelope.
/// The symmetric key derivation happens here, once, so the KDF work
/// factor is paid at `start()` rather than per message.
pub fn build_envelope(mode: &SecurityMode) -> Result<Arc<dyn Envelope>> {
    match mode {
        SecurityMode::None => Ok(Arc::new(PlainEnvelope)),
        SecurityMode::Symmetric {
            bits,
            strength,
            passphrase,
        } => Ok(Arc::new(SymmetricEnvelope::new(passphrase, *bits, *strength)?)),
        // TLS encrypts the transport; frames inside it stay plain
        SecurityMode::Asymmetric(_) => Ok(Arc::new(PlainEnvelope)),
    }
}
