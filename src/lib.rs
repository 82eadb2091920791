//! # Commlink
//!
//! A configurable point-to-point communication framework: socket
//! session orchestration, a compact binary marshalling codec, a
//! security envelope, application-level UDP acknowledgment, and a
//! shared-memory field-diff synchronization engine.
//!
//! ## Pipeline
//!
//! ```text
//! Shared Memory Mirror -> Marshalling Codec -> Security Envelope
//!                      -> Communication Engine -> socket
//! ```
//!
//! and the reverse path on receipt. Both endpoints of a deployment must
//! share the marshalling and security settings; there is no negotiation
//! handshake beyond the TLS case.
//!
//! ## Quick start
//!
//! ```no_run
//! use commlink::config::{CommunicationConfig, Endpoint, TransportMode};
//! use commlink::core::Value;
//! use commlink::engine::CommunicationEngine;
//!
//! # async fn run() -> commlink::error::Result<()> {
//! let config = CommunicationConfig::default_with_overrides(|c| {
//!     c.transport = TransportMode::UdpSend;
//!     c.endpoints = vec![Endpoint::new("127.0.0.1", 9000)];
//! });
//!
//! let engine = CommunicationEngine::new(config)?;
//! engine.start().await?;
//! engine.outbound_box().try_enqueue(Value::Str("hello".into()));
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: immutable-after-start session configuration
//! - [`core`]: the wire value model, marshalling codec and stream framing
//! - [`security`]: plaintext, symmetric AEAD and TLS envelopes
//! - [`mailbox`]: the bounded queue between callers and engine loops
//! - [`task`]: pluggable per-connection protocol work
//! - [`engine`]: socket topology resolution and loop orchestration
//! - [`mirror`]: the shared-memory field table and its sync driver

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod mailbox;
pub mod mirror;
pub mod security;
pub mod task;

pub use crate::config::{Cardinality, CommunicationConfig, Endpoint, SecurityMode, TransportMode};
pub use crate::core::{Decimal, FrameCodec, Marshaller, Value};
pub use crate::engine::{CommunicationEngine, EngineMetrics, MetricsSnapshot};
pub use crate::error::{CommError, Result};
pub use crate::mailbox::MessageBox;
pub use crate::mirror::{FieldDef, FieldSchema, MirrorSession, Mirrored, SharedMemory};
pub use crate::task::{SocketTask, TaskContext, TaskSpec};

/// Library version from the crate manifest
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
