//! # Core Codec Components
//!
//! The proprietary binary wire format: typed values, the marshalling
//! codec, and stream framing.
//!
//! ## Components
//! - **Value**: closed tagged union of wire values
//! - **Marshal**: length-prefixed encode/decode with configurable prefix
//!   width and endianness
//! - **Frame**: tokio codec delimiting secured blobs on TCP streams
//!
//! ## Wire Format
//! ```text
//! [Length(1-4, configured)] [TypeTag(1)] [Payload(N)]
//! ```
//!
//! Both endpoints must share the prefix width and endianness; there is no
//! format negotiation.
//!
//! ## Security
//! - Length validation before allocation
//! - Maximum stream frame size: 16MB (prevents memory exhaustion)

pub mod frame;
pub mod marshal;
pub mod value;

pub use frame::FrameCodec;
pub use marshal::Marshaller;
pub use value::{tag, Decimal, Value};
