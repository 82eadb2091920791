//! Typed wire values
//!
//! `Value` is the closed set of payloads the marshalling codec can move:
//! primitives, a normalized decimal, strings, raw bytes, timestamps,
//! collections, whole objects and shared-memory field deltas. Every
//! variant carries a stable one-byte tag; the tag set is part of the wire
//! contract and must never be reordered.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;

/// Wire type tags. Stable across releases; both endpoints of a
/// deployment must run the same table.
pub mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const U8: u8 = 0x02;
    pub const I8: u8 = 0x03;
    pub const U16: u8 = 0x04;
    pub const I16: u8 = 0x05;
    pub const U32: u8 = 0x06;
    pub const I32: u8 = 0x07;
    pub const U64: u8 = 0x08;
    pub const I64: u8 = 0x09;
    pub const F32: u8 = 0x0A;
    pub const F64: u8 = 0x0B;
    pub const DECIMAL: u8 = 0x0C;
    pub const STR: u8 = 0x0D;
    pub const BYTES: u8 = 0x0E;
    pub const DATETIME: u8 = 0x0F;
    pub const LIST: u8 = 0x10;
    pub const OBJECT: u8 = 0x11;
    pub const FIELD_DELTA: u8 = 0x12;
}

/// Fixed-point decimal as a normalized (mantissa, scale) pair.
///
/// Construction strips trailing zeros so equal quantities compare equal
/// and repeated encode/decode round-trips are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    /// Build a decimal representing `mantissa * 10^-scale`, normalized.
    pub fn new(mantissa: i128, scale: u32) -> Self {
        let mut d = Self { mantissa, scale };
        d.normalize();
        d
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Strip trailing zeros: `1.500` becomes `1.5`, `100.0` becomes `100`.
    fn normalize(&mut self) {
        if self.mantissa == 0 {
            self.scale = 0;
            return;
        }
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        if digits.len() > scale {
            let (int_part, frac_part) = digits.split_at(digits.len() - scale);
            write!(f, "{sign}{int_part}.{frac_part}")
        } else {
            write!(f, "{sign}0.{:0>width$}", digits, width = scale)
        }
    }
}

/// One marshallable value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value. Inside a list this is the null-element sentinel,
    /// distinct from the list being empty.
    Null,
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Str(String),
    Bytes(Vec<u8>),
    /// UTC timestamp, microsecond precision on the wire
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    /// Whole-object mode: every declared field in registry order
    Object(Vec<Value>),
    /// One shared-memory field update: `(field index, latest value)`
    FieldDelta { index: u16, value: Box<Value> },
}

impl Value {
    /// The natural wire tag for this variant
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => tag::NULL,
            Value::Bool(_) => tag::BOOL,
            Value::U8(_) => tag::U8,
            Value::I8(_) => tag::I8,
            Value::U16(_) => tag::U16,
            Value::I16(_) => tag::I16,
            Value::U32(_) => tag::U32,
            Value::I32(_) => tag::I32,
            Value::U64(_) => tag::U64,
            Value::I64(_) => tag::I64,
            Value::F32(_) => tag::F32,
            Value::F64(_) => tag::F64,
            Value::Decimal(_) => tag::DECIMAL,
            Value::Str(_) => tag::STR,
            Value::Bytes(_) => tag::BYTES,
            Value::DateTime(_) => tag::DATETIME,
            Value::List(_) => tag::LIST,
            Value::Object(_) => tag::OBJECT,
            Value::FieldDelta { .. } => tag::FIELD_DELTA,
        }
    }

    /// Human-readable tag name, for logs and errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::U8(_) => "U8",
            Value::I8(_) => "I8",
            Value::U16(_) => "U16",
            Value::I16(_) => "I16",
            Value::U32(_) => "U32",
            Value::I32(_) => "I32",
            Value::U64(_) => "U64",
            Value::I64(_) => "I64",
            Value::F32(_) => "F32",
            Value::F64(_) => "F64",
            Value::Decimal(_) => "Decimal",
            Value::Str(_) => "Str",
            Value::Bytes(_) => "Bytes",
            Value::DateTime(_) => "DateTime",
            Value::List(_) => "List",
            Value::Object(_) => "Object",
            Value::FieldDelta { .. } => "FieldDelta",
        }
    }

    /// Canonical text rendering used by the shared-memory dump:
    /// `NULL` for absent values, `True`/`False` booleans, collections as
    /// `[v, v, ...]`. Deterministic for any given value.
    pub fn render(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => {
                if *b {
                    "True".to_string()
                } else {
                    "False".to_string()
                }
            }
            Value::U8(v) => v.to_string(),
            Value::I8(v) => v.to_string(),
            Value::U16(v) => v.to_string(),
            Value::I16(v) => v.to_string(),
            Value::U32(v) => v.to_string(),
            Value::I32(v) => v.to_string(),
            Value::U64(v) => v.to_string(),
            Value::I64(v) => v.to_string(),
            Value::F32(v) => v.to_string(),
            Value::F64(v) => v.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => render_seq(b.iter().map(|v| v.to_string())),
            Value::DateTime(t) => t.to_rfc3339(),
            Value::List(items) | Value::Object(items) => {
                render_seq(items.iter().map(Value::render))
            }
            Value::FieldDelta { index, value } => format!("({index}, {})", value.render()),
        }
    }

    /// Reconstruct a UTC timestamp from wire microseconds
    pub(crate) fn datetime_from_micros(micros: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(micros).single()
    }
}

fn render_seq<I: Iterator<Item = String>>(items: I) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    format!("[{joined}]")
}
