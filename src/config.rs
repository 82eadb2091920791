//! # Configuration Management
//!
//! Centralized configuration for the communication framework.
//!
//! This module provides the immutable-after-start `CommunicationConfig`
//! value object: transport mode, socket/box cardinality, endpoints,
//! timeouts, security selection and marshalling switches.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `default_with_overrides()` for programmatic setup
//!
//! ## Validation
//! Configuration errors are detected eagerly at build time via
//! `validate()`/`validate_strict()` and never reach the engine. Both
//! endpoints of a deployment MUST share the marshalling and security
//! settings; there is no negotiation handshake beyond the TLS case.

use crate::error::{CommError, Result};
use crate::security::tls::TlsSettings;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Poll interval used by `dequeue_with_wait` and ACK wait loops
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Max allowed secured frame size on stream transports (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Byte sent as the UDP acknowledgment datagram
pub const ACK_BYTE: u8 = 0xA5;

/// Transport mode, resolved once at `start()` into a concrete socket
/// topology and loop strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TransportMode {
    /// Fire-and-forget UDP sender
    UdpSend,
    /// UDP receiver
    UdpReceive,
    /// UDP sender with application-level acknowledgment and retransmission
    UdpSendAck,
    /// UDP receiver that emits an acknowledgment datagram per receipt
    UdpReceiveAck,
    /// UDP sender targeting a multicast group
    UdpMulticastSend,
    /// UDP receiver joined to a multicast group
    UdpMulticastReceive,
    /// TCP client sender
    TcpSend,
    /// TCP listening receiver
    TcpReceive,
    /// TCP client that sends a request and awaits an answer per message
    TcpSendAnswer,
    /// TCP listening receiver that runs a socket task and answers in-place
    TcpReceiveAnswer,
}

impl TransportMode {
    /// Whether this mode uses UDP datagrams
    pub fn is_udp(self) -> bool {
        matches!(
            self,
            TransportMode::UdpSend
                | TransportMode::UdpReceive
                | TransportMode::UdpSendAck
                | TransportMode::UdpReceiveAck
                | TransportMode::UdpMulticastSend
                | TransportMode::UdpMulticastReceive
        )
    }

    /// Whether this mode primarily transmits (vs. listens)
    pub fn is_sender(self) -> bool {
        matches!(
            self,
            TransportMode::UdpSend
                | TransportMode::UdpSendAck
                | TransportMode::UdpMulticastSend
                | TransportMode::TcpSend
                | TransportMode::TcpSendAnswer
        )
    }

    /// Whether this mode participates in the UDP ACK sub-protocol
    pub fn uses_ack(self) -> bool {
        matches!(self, TransportMode::UdpSendAck | TransportMode::UdpReceiveAck)
    }

    /// Whether this mode carries a request/answer exchange
    pub fn uses_answer(self) -> bool {
        matches!(
            self,
            TransportMode::TcpSendAnswer | TransportMode::TcpReceiveAnswer
        )
    }
}

/// Socket/message-box topology mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum Cardinality {
    /// One message box, one socket
    #[default]
    Equal,
    /// Two boxes (outbound, inbound) sharing one socket
    EqualBidirectional,
    /// Many boxes multiplexed through one socket
    ManyBoxesToOneSocket,
}

impl Cardinality {
    /// Number of message boxes this cardinality expects, given the
    /// configured box-length list.
    pub fn expected_boxes(self, configured: usize) -> usize {
        match self {
            Cardinality::Equal => 1,
            Cardinality::EqualBidirectional => 2,
            Cardinality::ManyBoxesToOneSocket => configured.max(1),
        }
    }
}

/// Symmetric key strength in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum KeyBits {
    Bits128,
    Bits256,
}

/// Key-derivation work factor. `High` costs materially more CPU per
/// engine start and must be budgeted into timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum KdfStrength {
    Low,
    High,
}

/// Security envelope selection plus its key material
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub enum SecurityMode {
    /// Frames travel in the clear
    #[default]
    None,
    /// Passphrase-derived symmetric AEAD
    Symmetric {
        bits: KeyBits,
        strength: KdfStrength,
        passphrase: String,
    },
    /// TLS with certificate files / fingerprint allow-list
    Asymmetric(TlsSettings),
}

/// Marshalling codec switches. Both endpoints must agree on every field.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MarshalSettings {
    /// Whether the codec runs at all (raw `Bytes` passthrough otherwise)
    pub enabled: bool,

    /// Serialize every declared field of registered objects
    pub whole_object: bool,

    /// Width of every length prefix written, in bytes (1..=4)
    pub length_width: u8,

    /// Walk accessor members instead of raw storage members. The field
    /// registry exposes a single accessor path, so enabling this is a
    /// validation error; the switch exists only so configurations from
    /// peers with a storage/accessor distinction stay parseable.
    pub use_properties: bool,

    /// Force the type tag written so heterogeneous channels can steer
    /// the receiver's decode path
    pub override_type_tag: Option<u8>,

    /// Little-endian length prefixes and numeric payloads
    pub little_endian: bool,
}

impl Default for MarshalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            whole_object: false,
            length_width: 2,
            use_properties: false,
            override_type_tag: None,
            little_endian: false,
        }
    }
}

impl MarshalSettings {
    /// Validate marshalling settings
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(1..=4).contains(&self.length_width) {
            errors.push(format!(
                "Invalid marshalling length width: {} (valid range: 1-4 bytes)",
                self.length_width
            ));
        }

        if self.use_properties {
            errors.push(
                "use_properties is not supported: field access always goes through the registry accessors, so both endpoints must leave it false"
                    .to_string(),
            );
        }

        errors
    }
}

/// One remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Render as a `host:port` connect string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Main configuration structure consumed by the communication engine.
/// Immutable after `start()`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommunicationConfig {
    /// Transport mode (UDP/TCP x send/receive x {none, ack, answer})
    pub transport: TransportMode,

    /// Socket/message-box topology
    #[serde(default)]
    pub cardinality: Cardinality,

    /// Remote endpoints; senders use the first entry
    pub endpoints: Vec<Endpoint>,

    /// Optional local bind address (receivers default to 0.0.0.0)
    pub local_address: Option<String>,

    /// Optional local bind port (senders default to an ephemeral port)
    pub local_port: Option<u16>,

    /// Capacity of each message box, one entry per box
    pub box_lengths: Vec<usize>,

    /// Overall per-message send budget; ACK retransmission gives up
    /// once this much time has elapsed
    #[serde(with = "duration_serde")]
    pub sender_timeout: Duration,

    /// Receive-side inactivity budget for answer exchanges
    #[serde(with = "duration_serde")]
    pub receiver_timeout: Duration,

    /// How long a dequeue wait loop polls before giving up
    #[serde(with = "duration_serde")]
    pub queue_timeout: Duration,

    /// Retransmission timer for one UDP ACK wait
    #[serde(with = "duration_serde")]
    pub udp_ack_timeout: Duration,

    /// TTL for multicast sends
    pub multicast_ttl: u32,

    /// Security envelope selection
    #[serde(default)]
    pub security: SecurityMode,

    /// Marshalling codec switches
    #[serde(default)]
    pub marshalling: MarshalSettings,

    /// Interval between shared-memory sync passes
    #[serde(with = "duration_serde")]
    pub sync_interval: Duration,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::UdpSend,
            cardinality: Cardinality::Equal,
            endpoints: vec![Endpoint::new("127.0.0.1", 9000)],
            local_address: None,
            local_port: None,
            box_lengths: vec![32],
            sender_timeout: Duration::from_secs(5),
            receiver_timeout: Duration::from_secs(5),
            queue_timeout: Duration::from_millis(500),
            udp_ack_timeout: Duration::from_millis(250),
            multicast_ttl: 1,
            security: SecurityMode::None,
            marshalling: MarshalSettings::default(),
            sync_interval: Duration::from_millis(100),
        }
    }
}

impl CommunicationConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| CommError::Config(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| CommError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| CommError::Config(format!("Failed to parse TOML: {e}")))
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CommError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| CommError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.endpoints.is_empty() {
            errors.push("At least one endpoint (host, port) is required".to_string());
        }

        for ep in &self.endpoints {
            if ep.host.is_empty() {
                errors.push("Endpoint host cannot be empty".to_string());
            }
            if ep.port == 0 {
                errors.push(format!(
                    "Invalid endpoint port for host '{}': 0 (valid range: 1-65535)",
                    ep.host
                ));
            }
        }

        if let Some(0) = self.local_port {
            // 0 means ephemeral for senders, but receivers must bind a real port
            if !self.transport.is_sender() {
                errors.push("Receivers cannot bind local port 0".to_string());
            }
        }

        // Box count must match the cardinality's expectation
        let expected = self.cardinality.expected_boxes(self.box_lengths.len());
        if self.box_lengths.len() != expected {
            errors.push(format!(
                "Cardinality {:?} expects {} message box length(s), got {}",
                self.cardinality,
                expected,
                self.box_lengths.len()
            ));
        }

        for (i, len) in self.box_lengths.iter().enumerate() {
            if *len == 0 {
                errors.push(format!("Message box {i} length must be greater than 0"));
            }
        }

        // Answer exchanges route answers through the inbound box
        if self.transport == TransportMode::TcpSendAnswer
            && self.cardinality != Cardinality::EqualBidirectional
        {
            errors.push(
                "TcpSendAnswer requires Cardinality::EqualBidirectional (answers arrive on the inbound box)"
                    .to_string(),
            );
        }

        // The ACK wait and a bidirectional receive loop would compete
        // for the same socket's datagrams
        if self.transport.uses_ack() && self.cardinality == Cardinality::EqualBidirectional {
            errors.push(
                "UDP ACK modes cannot be combined with Cardinality::EqualBidirectional".to_string(),
            );
        }

        if self.transport.uses_ack() && self.udp_ack_timeout > self.sender_timeout {
            errors.push(format!(
                "UDP ACK timeout ({} ms) exceeds the overall sender timeout ({} ms)",
                self.udp_ack_timeout.as_millis(),
                self.sender_timeout.as_millis()
            ));
        }

        if self.sender_timeout.as_millis() < 10 {
            errors.push("Sender timeout too short (minimum: 10ms)".to_string());
        }

        if self.sync_interval.as_millis() == 0 {
            errors.push("Shared-memory sync interval must be greater than 0".to_string());
        }

        if self.transport.is_udp() {
            if !(1..=255).contains(&self.multicast_ttl) {
                errors.push(format!(
                    "Invalid multicast TTL: {} (valid range: 1-255)",
                    self.multicast_ttl
                ));
            }
        }

        match &self.security {
            SecurityMode::None => {}
            SecurityMode::Symmetric {
                strength,
                passphrase,
                ..
            } => {
                if passphrase.is_empty() {
                    errors.push(crate::error::constants::ERR_EMPTY_PASSPHRASE.to_string());
                }
                if *strength == KdfStrength::High && self.sender_timeout.as_millis() < 500 {
                    errors.push(
                        "High KDF strength with a sub-500ms sender timeout risks spurious timeouts during startup"
                            .to_string(),
                    );
                }
            }
            SecurityMode::Asymmetric(tls) => {
                if self.transport.is_udp() {
                    errors.push("Asymmetric (TLS) security requires a TCP transport".to_string());
                }
                errors.extend(tls.validate());
            }
        }

        errors.extend(self.marshalling.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CommError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// The connect/send target: first configured endpoint
    pub fn remote_address(&self) -> Result<String> {
        self.endpoints
            .first()
            .map(Endpoint::address)
            .ok_or_else(|| CommError::Config("No endpoint configured".to_string()))
    }

    /// The local bind string for this mode. Receivers bind the first
    /// endpoint's port on all interfaces unless a local address/port is
    /// given; senders default to an ephemeral port.
    pub fn bind_address(&self) -> String {
        let host = self
            .local_address
            .clone()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port = self.local_port.unwrap_or_else(|| {
            if self.transport.is_sender() {
                0
            } else {
                self.endpoints.first().map(|e| e.port).unwrap_or(0)
            }
        });
        format!("{host}:{port}")
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CommunicationConfig::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let config = CommunicationConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed = CommunicationConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.endpoints, config.endpoints);
        assert_eq!(parsed.sender_timeout, config.sender_timeout);
    }

    #[test]
    fn bind_address_defaults() {
        let sender = CommunicationConfig::default();
        assert_eq!(sender.bind_address(), "0.0.0.0:0");

        let receiver = CommunicationConfig::default_with_overrides(|c| {
            c.transport = TransportMode::UdpReceive;
            c.endpoints = vec![Endpoint::new("127.0.0.1", 4100)];
        });
        assert_eq!(receiver.bind_address(), "0.0.0.0:4100");
    }
}
