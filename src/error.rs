//! # Error Types
//!
//! Comprehensive error handling for the communication framework.
//!
//! This module defines all error variants that can occur across the
//! framework, from low-level I/O failures to marshalling and security
//! violations.
//!
//! ## Error Categories
//! - **I/O Errors**: Network and file system failures
//! - **Configuration Errors**: Invalid ports, mismatched box counts
//! - **Marshalling Errors**: Unknown type tags, length-prefix overflow
//! - **Security Errors**: Key derivation, AEAD and TLS failures
//! - **Transport Errors**: Connect/bind failures, closed connections,
//!   exhausted ACK budgets
//!
//! All errors implement `std::error::Error` for interoperability.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Engine lifecycle errors
    pub const ERR_NOT_STARTED: &str = "Engine has not been started";
    pub const ERR_ALREADY_STARTED: &str = "Engine has already been started";
    pub const ERR_NO_TASK: &str = "Answer transport requires a registered socket task";

    /// Marshalling errors
    pub const ERR_EMPTY_FRAME: &str = "Frame is empty";
    pub const ERR_TRUNCATED_FRAME: &str = "Frame shorter than its length prefix";
    pub const ERR_TRAILING_BYTES: &str = "Trailing bytes after frame payload";
    pub const ERR_INVALID_UTF8: &str = "String payload is not valid UTF-8";
    pub const ERR_INVALID_TIMESTAMP: &str = "Timestamp out of representable range";

    /// Security errors
    pub const ERR_SHORT_ENVELOPE: &str = "Secured payload shorter than envelope header";
    pub const ERR_EMPTY_PASSPHRASE: &str = "Symmetric security requires a passphrase";

    /// Mirror errors
    pub const ERR_FIELD_TYPE_MISMATCH: &str = "Value type does not match the registered field type";
    pub const ERR_DELTA_INDEX_RANGE: &str = "Field delta index outside the registered table";
    pub const ERR_OBJECT_ARITY: &str = "Object snapshot does not match the registered field count";
}

/// CommError is the primary error type for all framework operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum CommError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Marshalling error: {0}")]
    Marshal(String),

    #[error("Encoded length {len} exceeds the {max}-byte limit of the configured length prefix")]
    LengthOverflow { len: usize, max: u64 },

    #[error("Unknown wire type tag: {0:#04x}")]
    UnknownTypeTag(u8),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Peer authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("No acknowledgment received within the sender timeout budget")]
    AckTimeout,

    #[error("Operation timed out")]
    Timeout,

    #[error("Message box is full")]
    BoxFull,

    #[error("Unknown shared-memory field: {0}")]
    UnknownField(String),

    #[error("Invalid engine state: {0}")]
    InvalidState(&'static str),
}

/// Type alias for Results using CommError
pub type Result<T> = std::result::Result<T, CommError>;
