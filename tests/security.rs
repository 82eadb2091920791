//! Integration tests for the security envelope

#![allow(clippy::unwrap_used)]

use commlink::config::{KdfStrength, KeyBits, SecurityMode};
use commlink::error::CommError;
use commlink::security::tls::TlsSettings;
use commlink::security::{build_envelope, Envelope, SymmetricEnvelope};

#[test]
fn plain_envelope_is_identity() {
    let envelope = build_envelope(&SecurityMode::None).unwrap();
    let frame = b"frame bytes".to_vec();
    let secured = envelope.wrap(&frame).unwrap();
    assert_eq!(secured, frame);
    assert_eq!(envelope.unwrap(&secured).unwrap(), frame);
}

#[test]
fn symmetric_roundtrip_all_strengths() {
    for bits in [KeyBits::Bits128, KeyBits::Bits256] {
        for strength in [KdfStrength::Low, KdfStrength::High] {
            let envelope = SymmetricEnvelope::new("shared secret", bits, strength).unwrap();
            let frame = b"confidential payload".to_vec();
            let secured = envelope.wrap(&frame).unwrap();
            assert_ne!(secured, frame);
            assert!(secured.len() > frame.len(), "nonce and tag add overhead");
            assert_eq!(envelope.unwrap(&secured).unwrap(), frame);
        }
    }
}

#[test]
fn nonces_differ_per_message() {
    let envelope =
        SymmetricEnvelope::new("shared secret", KeyBits::Bits256, KdfStrength::Low).unwrap();
    let a = envelope.wrap(b"same frame").unwrap();
    let b = envelope.wrap(b"same frame").unwrap();
    assert_ne!(a, b, "two wraps of one frame must not repeat bytes");
}

#[test]
fn wrong_passphrase_fails_authentication() {
    let sender =
        SymmetricEnvelope::new("correct horse", KeyBits::Bits256, KdfStrength::Low).unwrap();
    let receiver =
        SymmetricEnvelope::new("battery staple", KeyBits::Bits256, KdfStrength::Low).unwrap();

    let secured = sender.wrap(b"frame").unwrap();
    assert!(matches!(
        receiver.unwrap(&secured),
        Err(CommError::DecryptionFailure)
    ));
}

#[test]
fn mismatched_parameters_fail_authentication() {
    let wide = SymmetricEnvelope::new("secret", KeyBits::Bits256, KdfStrength::Low).unwrap();
    let narrow = SymmetricEnvelope::new("secret", KeyBits::Bits128, KdfStrength::Low).unwrap();
    let strong = SymmetricEnvelope::new("secret", KeyBits::Bits256, KdfStrength::High).unwrap();

    let secured = wide.wrap(b"frame").unwrap();
    assert!(narrow.unwrap(&secured).is_err());
    assert!(strong.unwrap(&secured).is_err());
}

#[test]
fn tampered_ciphertext_is_rejected() {
    let envelope = SymmetricEnvelope::new("secret", KeyBits::Bits256, KdfStrength::Low).unwrap();
    let mut secured = envelope.wrap(b"frame").unwrap();
    let last = secured.len() - 1;
    secured[last] ^= 0x01;
    assert!(matches!(
        envelope.unwrap(&secured),
        Err(CommError::DecryptionFailure)
    ));
}

#[test]
fn truncated_envelope_is_rejected() {
    let envelope = SymmetricEnvelope::new("secret", KeyBits::Bits256, KdfStrength::Low).unwrap();
    assert!(envelope.unwrap(&[0u8; 10]).is_err());
}

#[test]
fn empty_passphrase_is_rejected() {
    assert!(SymmetricEnvelope::new("", KeyBits::Bits256, KdfStrength::Low).is_err());
}

#[test]
fn asymmetric_mode_keeps_frames_plain() {
    // TLS encrypts the stream, not the frames
    let envelope = build_envelope(&SecurityMode::Asymmetric(TlsSettings::default())).unwrap();
    let frame = b"frame".to_vec();
    assert_eq!(envelope.wrap(&frame).unwrap(), frame);
}

#[test]
fn self_signed_material_loads() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");

    TlsSettings::generate_self_signed(&cert_path, &key_path, "localhost").unwrap();

    let settings = TlsSettings {
        cert_path: Some(cert_path.to_string_lossy().into_owned()),
        key_path: Some(key_path.to_string_lossy().into_owned()),
        use_platform_roots: true,
        ..TlsSettings::default()
    };
    assert!(settings.validate().is_empty());
    settings.load_server_config().unwrap();
}

#[test]
fn tls_validation_rejects_bad_settings() {
    let half_pair = TlsSettings {
        cert_path: Some("cert.pem".to_string()),
        use_platform_roots: true,
        ..TlsSettings::default()
    };
    assert!(!half_pair.validate().is_empty());

    let encrypted = TlsSettings {
        cert_password: Some("hunter2".to_string()),
        use_platform_roots: true,
        ..TlsSettings::default()
    };
    assert!(encrypted
        .validate()
        .iter()
        .any(|e| e.contains("Password-protected")));

    let bad_fingerprint = TlsSettings {
        allowed_fingerprints: vec!["zz".to_string()],
        use_platform_roots: true,
        ..TlsSettings::default()
    };
    assert!(!bad_fingerprint.validate().is_empty());

    let no_trust = TlsSettings {
        use_platform_roots: false,
        ..TlsSettings::default()
    };
    assert!(no_trust
        .validate()
        .iter()
        .any(|e| e.contains("no trust source")));
}
