//! Symmetric security envelope
//!
//! Both endpoints share a passphrase; no negotiation handshake exists.
//! The AEAD key is derived once at construction by salted iterated
//! SHA-256 with a fixed domain-separation salt, so both sides reach the
//! same key independently. The `High` work factor costs materially more
//! CPU at engine start and must be budgeted into timeouts.
//!
//! Wire layout: `[nonce(24)][ciphertext + tag(16)]`. A wrong passphrase
//! fails AEAD authentication and surfaces as `DecryptionFailure` --
//! corrupted plaintext is never returned.

use crate::config::{KdfStrength, KeyBits};
use crate::error::{constants, CommError, Result};
use crate::security::Envelope;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Domain-separation salt for key derivation. Changing it is a wire break.
const KDF_SALT: &[u8] = b"commlink.symmetric.kdf.v1";

/// Expansion label lifting a truncated 128-bit key back to AEAD size
const KEY_EXPAND_LABEL: &[u8] = b"commlink.key.expand.v1";

const NONCE_LEN: usize = 24;

/// Iteration counts per work factor
fn iterations(strength: KdfStrength) -> u32 {
    match strength {
        KdfStrength::Low => 4_096,
        KdfStrength::High => 262_144,
    }
}

/// Derive the AEAD key from the shared passphrase.
///
/// 256-bit mode uses the full iterated digest; 128-bit mode truncates to
/// 16 bytes of entropy and expands back to the cipher's 32-byte key size
/// with a labelled hash.
fn derive_key(passphrase: &str, bits: KeyBits, strength: KdfStrength) -> Result<[u8; 32]> {
    if passphrase.is_empty() {
        return Err(CommError::Security(
            constants::ERR_EMPTY_PASSPHRASE.to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(KDF_SALT);
    hasher.update(match bits {
        KeyBits::Bits128 => b"128" as &[u8],
        KeyBits::Bits256 => b"256" as &[u8],
    });
    hasher.update(passphrase.as_bytes());
    let mut digest: [u8; 32] = hasher.finalize().into();

    for _ in 1..iterations(strength) {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(passphrase.as_bytes());
        digest = hasher.finalize().into();
    }

    let key = match bits {
        KeyBits::Bits256 => digest,
        KeyBits::Bits128 => {
            let mut hasher = Sha256::new();
            hasher.update(KEY_EXPAND_LABEL);
            hasher.update(&digest[..16]);
            let expanded: [u8; 32] = hasher.finalize().into();
            digest.zeroize();
            expanded
        }
    };

    Ok(key)
}

/// Passphrase-derived AEAD envelope
pub struct SymmetricEnvelope {
    cipher: XChaCha20Poly1305,
}

impl SymmetricEnvelope {
    /// Derive the key and initialize the cipher. This is the expensive
    /// step; call it once per engine start.
    pub fn new(passphrase: &str, bits: KeyBits, strength: KdfStrength) -> Result<Self> {
        let mut key = derive_key(passphrase, bits, strength)?;
        let cipher = XChaCha20Poly1305::new((&key).into());
        key.zeroize();
        Ok(Self { cipher })
    }

    fn generate_nonce() -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| CommError::Security(format!("Nonce generation failed: {e}")))?;
        Ok(nonce)
    }
}

impl Envelope for SymmetricEnvelope {
    fn wrap(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::generate_nonce()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), frame)
            .map_err(|_| CommError::EncryptionFailure)?;

        let mut secured = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        secured.extend_from_slice(&nonce);
        secured.extend_from_slice(&ciphertext);
        Ok(secured)
    }

    fn unwrap(&self, secured: &[u8]) -> Result<Vec<u8>> {
        if secured.len() < NONCE_LEN {
            return Err(CommError::Security(
                constants::ERR_SHORT_ENVELOPE.to_string(),
            ));
        }
        let (nonce, ciphertext) = secured.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CommError::DecryptionFailure)
    }
}
