//! Integration tests for configuration validation

#![allow(clippy::unwrap_used)]

use commlink::config::{
    Cardinality, CommunicationConfig, Endpoint, KdfStrength, KeyBits, SecurityMode, TransportMode,
};
use commlink::security::tls::TlsSettings;
use std::time::Duration;

#[test]
fn default_config_validates() {
    let config = CommunicationConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {errors:?}"
    );
}

#[test]
fn missing_endpoint_is_rejected() {
    let config = CommunicationConfig::default_with_overrides(|c| c.endpoints.clear());
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("endpoint")));
}

#[test]
fn port_zero_is_rejected() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.endpoints = vec![Endpoint::new("10.0.0.1", 0)];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("port")));
}

#[test]
fn box_count_must_match_cardinality() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.cardinality = Cardinality::EqualBidirectional;
        c.box_lengths = vec![32];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("box length")));

    let fixed = CommunicationConfig::default_with_overrides(|c| {
        c.cardinality = Cardinality::EqualBidirectional;
        c.box_lengths = vec![32, 32];
    });
    assert!(fixed.validate().is_empty());
}

#[test]
fn many_boxes_accepts_any_count() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.cardinality = Cardinality::ManyBoxesToOneSocket;
        c.box_lengths = vec![8, 16, 32];
    });
    assert!(config.validate().is_empty());
}

#[test]
fn zero_length_box_is_rejected() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.box_lengths = vec![0];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("greater than 0")));
}

#[test]
fn send_answer_requires_bidirectional() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.transport = TransportMode::TcpSendAnswer;
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("EqualBidirectional")));
}

#[test]
fn ack_cannot_be_bidirectional() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.transport = TransportMode::UdpSendAck;
        c.cardinality = Cardinality::EqualBidirectional;
        c.box_lengths = vec![32, 32];
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("ACK")));
}

#[test]
fn ack_window_cannot_exceed_sender_budget() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.transport = TransportMode::UdpSendAck;
        c.udp_ack_timeout = Duration::from_secs(10);
        c.sender_timeout = Duration::from_secs(5);
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("ACK timeout")));
}

#[test]
fn empty_passphrase_is_rejected() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.security = SecurityMode::Symmetric {
            bits: KeyBits::Bits256,
            strength: KdfStrength::Low,
            passphrase: String::new(),
        };
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("passphrase")));
}

#[test]
fn high_kdf_with_short_timeout_warns() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.security = SecurityMode::Symmetric {
            bits: KeyBits::Bits256,
            strength: KdfStrength::High,
            passphrase: "secret".to_string(),
        };
        c.sender_timeout = Duration::from_millis(100);
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("KDF")));
}

#[test]
fn tls_requires_tcp() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.transport = TransportMode::UdpSend;
        c.security = SecurityMode::Asymmetric(TlsSettings::default());
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("TCP")));
}

#[test]
fn invalid_marshalling_width_is_rejected() {
    for width in [0u8, 5, 8] {
        let config = CommunicationConfig::default_with_overrides(|c| {
            c.marshalling.length_width = width;
        });
        let errors = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("length width")),
            "width {width} should be rejected"
        );
    }
}

#[test]
fn use_properties_is_rejected() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.marshalling.use_properties = true;
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("use_properties")));
}

#[test]
fn validate_strict_collects_all_errors() {
    let config = CommunicationConfig::default_with_overrides(|c| {
        c.endpoints.clear();
        c.box_lengths = vec![0];
        c.marshalling.length_width = 9;
    });
    match config.validate_strict() {
        Err(commlink::CommError::Config(msg)) => {
            assert!(msg.contains("endpoint"));
            assert!(msg.contains("greater than 0"));
            assert!(msg.contains("length width"));
        }
        other => panic!("expected Config error, got {other:?}"),
    }
}

#[test]
fn toml_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commlink.toml");

    let config = CommunicationConfig::default_with_overrides(|c| {
        c.transport = TransportMode::TcpReceive;
        c.endpoints = vec![Endpoint::new("192.168.1.10", 7800)];
        c.sender_timeout = Duration::from_millis(1234);
        c.marshalling.length_width = 3;
        c.marshalling.little_endian = true;
    });
    config.save_to_file(&path).unwrap();

    let loaded = CommunicationConfig::from_file(&path).unwrap();
    assert_eq!(loaded.transport, TransportMode::TcpReceive);
    assert_eq!(loaded.endpoints, config.endpoints);
    assert_eq!(loaded.sender_timeout, Duration::from_millis(1234));
    assert_eq!(loaded.marshalling.length_width, 3);
    assert!(loaded.marshalling.little_endian);
}

#[test]
fn example_config_parses() {
    let example = CommunicationConfig::example_config();
    let parsed = CommunicationConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}
