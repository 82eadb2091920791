//! Marshalling codec
//!
//! Encodes and decodes [`Value`]s into the length-prefixed proprietary
//! wire format:
//!
//! ```text
//! [Length(1-4 bytes)] [TypeTag(1 byte)] [Payload(N bytes)]
//! ```
//!
//! The length prefix counts the tag byte plus the payload. Its width and
//! endianness come from [`MarshalSettings`] and apply to *every* length
//! and count written, including those nested inside strings, byte
//! buffers, lists and objects. A value whose encoded body exceeds the
//! prefix's numeric range is a hard [`CommError::LengthOverflow`];
//! nothing is ever silently truncated.
//!
//! Decimal payloads are re-normalized on decode so repeated round-trips
//! are idempotent.

use crate::config::MarshalSettings;
use crate::core::value::{tag, Decimal, Value};
use crate::error::{constants, CommError, Result};

/// Stateless encoder/decoder configured once from [`MarshalSettings`].
#[derive(Debug, Clone)]
pub struct Marshaller {
    length_width: u8,
    little_endian: bool,
    override_tag: Option<u8>,
}

impl Marshaller {
    /// Build a marshaller, validating the prefix width.
    pub fn new(settings: &MarshalSettings) -> Result<Self> {
        if !(1..=4).contains(&settings.length_width) {
            return Err(CommError::Config(format!(
                "Invalid marshalling length width: {} (valid range: 1-4 bytes)",
                settings.length_width
            )));
        }
        Ok(Self {
            length_width: settings.length_width,
            little_endian: settings.little_endian,
            override_tag: settings.override_type_tag,
        })
    }

    /// Largest body (tag + payload) the configured prefix can describe.
    pub fn max_body_len(&self) -> u64 {
        match self.length_width {
            4 => u32::MAX as u64,
            w => (1u64 << (8 * w as u64)) - 1,
        }
    }

    /// Encode one value into a complete frame.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(16);
        body.push(self.override_tag.unwrap_or_else(|| value.type_tag()));
        self.encode_payload(value, &mut body)?;

        if body.len() as u64 > self.max_body_len() {
            return Err(CommError::LengthOverflow {
                len: body.len(),
                max: self.max_body_len(),
            });
        }

        let mut frame = Vec::with_capacity(self.length_width as usize + body.len());
        self.put_prefix(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one complete frame back into a value.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let width = self.length_width as usize;
        if bytes.len() < width {
            return Err(CommError::Marshal(constants::ERR_EMPTY_FRAME.to_string()));
        }
        let body_len = self.read_prefix(&bytes[..width]) as usize;
        let body = &bytes[width..];
        if body.len() < body_len {
            return Err(CommError::Marshal(constants::ERR_TRUNCATED_FRAME.to_string()));
        }
        if body.len() > body_len {
            return Err(CommError::Marshal(constants::ERR_TRAILING_BYTES.to_string()));
        }

        let mut cursor = Cursor::new(body);
        let value = self.decode_value(&mut cursor)?;
        if cursor.remaining() != 0 {
            return Err(CommError::Marshal(constants::ERR_TRAILING_BYTES.to_string()));
        }
        Ok(value)
    }

    // ---- encoding -------------------------------------------------------

    fn encode_payload(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        match value {
            Value::Null => {}
            Value::Bool(b) => out.push(u8::from(*b)),
            Value::U8(v) => out.push(*v),
            Value::I8(v) => out.push(*v as u8),
            Value::U16(v) => self.put_bytes(out, &v.to_be_bytes(), &v.to_le_bytes()),
            Value::I16(v) => self.put_bytes(out, &v.to_be_bytes(), &v.to_le_bytes()),
            Value::U32(v) => self.put_bytes(out, &v.to_be_bytes(), &v.to_le_bytes()),
            Value::I32(v) => self.put_bytes(out, &v.to_be_bytes(), &v.to_le_bytes()),
            Value::U64(v) => self.put_bytes(out, &v.to_be_bytes(), &v.to_le_bytes()),
            Value::I64(v) => self.put_bytes(out, &v.to_be_bytes(), &v.to_le_bytes()),
            Value::F32(v) => {
                let bits = v.to_bits();
                self.put_bytes(out, &bits.to_be_bytes(), &bits.to_le_bytes());
            }
            Value::F64(v) => {
                let bits = v.to_bits();
                self.put_bytes(out, &bits.to_be_bytes(), &bits.to_le_bytes());
            }
            Value::Decimal(d) => {
                let m = d.mantissa();
                let s = d.scale();
                self.put_bytes(out, &m.to_be_bytes(), &m.to_le_bytes());
                self.put_bytes(out, &s.to_be_bytes(), &s.to_le_bytes());
            }
            Value::Str(s) => {
                self.put_len(out, s.len())?;
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                self.put_len(out, b.len())?;
                out.extend_from_slice(b);
            }
            Value::DateTime(t) => {
                let micros = t.timestamp_micros();
                self.put_bytes(out, &micros.to_be_bytes(), &micros.to_le_bytes());
            }
            Value::List(items) | Value::Object(items) => {
                self.put_len(out, items.len())?;
                for item in items {
                    out.push(item.type_tag());
                    self.encode_payload(item, out)?;
                }
            }
            Value::FieldDelta { index, value } => {
                self.put_bytes(out, &index.to_be_bytes(), &index.to_le_bytes());
                out.push(value.type_tag());
                self.encode_payload(value, out)?;
            }
        }
        Ok(())
    }

    fn put_bytes(&self, out: &mut Vec<u8>, be: &[u8], le: &[u8]) {
        out.extend_from_slice(if self.little_endian { le } else { be });
    }

    /// Write a nested length/count at the configured prefix width,
    /// rejecting values the width cannot represent.
    fn put_len(&self, out: &mut Vec<u8>, len: usize) -> Result<()> {
        if len as u64 > self.max_body_len() {
            return Err(CommError::LengthOverflow {
                len,
                max: self.max_body_len(),
            });
        }
        self.put_prefix(out, len as u64);
        Ok(())
    }

    fn put_prefix(&self, out: &mut Vec<u8>, v: u64) {
        let width = self.length_width as usize;
        let bytes = if self.little_endian {
            let le = v.to_le_bytes();
            le[..width].to_vec()
        } else {
            let be = v.to_be_bytes();
            be[8 - width..].to_vec()
        };
        out.extend_from_slice(&bytes);
    }

    fn read_prefix(&self, bytes: &[u8]) -> u64 {
        let mut v = 0u64;
        if self.little_endian {
            for (i, b) in bytes.iter().enumerate() {
                v |= (*b as u64) << (8 * i);
            }
        } else {
            for b in bytes {
                v = (v << 8) | *b as u64;
            }
        }
        v
    }

    // ---- decoding -------------------------------------------------------

    fn decode_value(&self, cursor: &mut Cursor<'_>) -> Result<Value> {
        let type_tag = cursor.read_u8()?;
        self.decode_payload(type_tag, cursor)
    }

    fn decode_payload(&self, type_tag: u8, cursor: &mut Cursor<'_>) -> Result<Value> {
        let value = match type_tag {
            tag::NULL => Value::Null,
            tag::BOOL => Value::Bool(cursor.read_u8()? != 0),
            tag::U8 => Value::U8(cursor.read_u8()?),
            tag::I8 => Value::I8(cursor.read_u8()? as i8),
            tag::U16 => Value::U16(u16::from_be_bytes(self.take_fixed(cursor)?)),
            tag::I16 => Value::I16(i16::from_be_bytes(self.take_fixed(cursor)?)),
            tag::U32 => Value::U32(u32::from_be_bytes(self.take_fixed(cursor)?)),
            tag::I32 => Value::I32(i32::from_be_bytes(self.take_fixed(cursor)?)),
            tag::U64 => Value::U64(u64::from_be_bytes(self.take_fixed(cursor)?)),
            tag::I64 => Value::I64(i64::from_be_bytes(self.take_fixed(cursor)?)),
            tag::F32 => Value::F32(f32::from_bits(u32::from_be_bytes(self.take_fixed(cursor)?))),
            tag::F64 => Value::F64(f64::from_bits(u64::from_be_bytes(self.take_fixed(cursor)?))),
            tag::DECIMAL => {
                let mantissa = i128::from_be_bytes(self.take_fixed(cursor)?);
                let scale = u32::from_be_bytes(self.take_fixed(cursor)?);
                // Decimal::new re-normalizes, keeping round-trips idempotent
                Value::Decimal(Decimal::new(mantissa, scale))
            }
            tag::STR => {
                let len = self.take_len(cursor)?;
                let raw = cursor.take(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| CommError::Marshal(constants::ERR_INVALID_UTF8.to_string()))?;
                Value::Str(s.to_string())
            }
            tag::BYTES => {
                let len = self.take_len(cursor)?;
                Value::Bytes(cursor.take(len)?.to_vec())
            }
            tag::DATETIME => {
                let micros = i64::from_be_bytes(self.take_fixed(cursor)?);
                let t = Value::datetime_from_micros(micros).ok_or_else(|| {
                    CommError::Marshal(constants::ERR_INVALID_TIMESTAMP.to_string())
                })?;
                Value::DateTime(t)
            }
            tag::LIST => Value::List(self.decode_seq(cursor)?),
            tag::OBJECT => Value::Object(self.decode_seq(cursor)?),
            tag::FIELD_DELTA => {
                let index = u16::from_be_bytes(self.take_fixed(cursor)?);
                let value = self.decode_value(cursor)?;
                Value::FieldDelta {
                    index,
                    value: Box::new(value),
                }
            }
            other => return Err(CommError::UnknownTypeTag(other)),
        };
        Ok(value)
    }

    fn decode_seq(&self, cursor: &mut Cursor<'_>) -> Result<Vec<Value>> {
        let count = self.take_len(cursor)?;
        // Guard before allocation: each element needs at least a tag byte
        if count > cursor.remaining() {
            return Err(CommError::Marshal(constants::ERR_TRUNCATED_FRAME.to_string()));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.decode_value(cursor)?);
        }
        Ok(items)
    }

    fn take_len(&self, cursor: &mut Cursor<'_>) -> Result<usize> {
        let raw = cursor.take(self.length_width as usize)?;
        Ok(self.read_prefix(raw) as usize)
    }

    /// Read a fixed-width numeric payload, flipping to big-endian byte
    /// order so one `from_be_bytes` path serves both configurations.
    fn take_fixed<const N: usize>(&self, cursor: &mut Cursor<'_>) -> Result<[u8; N]> {
        let raw = cursor.take(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(raw);
        if self.little_endian {
            buf.reverse();
        }
        Ok(buf)
    }
}

/// Bounds-checked read position over a frame body
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        let raw = self.take(1)?;
        Ok(raw[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CommError::Marshal(constants::ERR_TRUNCATED_FRAME.to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MarshalSettings;

    fn marshaller(width: u8, little_endian: bool) -> Marshaller {
        Marshaller::new(&MarshalSettings {
            length_width: width,
            little_endian,
            ..MarshalSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn prefix_roundtrip_all_widths() {
        for width in 1..=4u8 {
            for le in [false, true] {
                let m = marshaller(width, le);
                let mut out = Vec::new();
                m.put_prefix(&mut out, 0x2A);
                assert_eq!(out.len(), width as usize);
                assert_eq!(m.read_prefix(&out), 0x2A);
            }
        }
    }

    #[test]
    fn length_overflow_is_hard_error() {
        let m = marshaller(1, false);
        // 300-byte payload cannot fit a 1-byte length prefix
        let value = Value::Bytes(vec![0u8; 300]);
        match m.encode(&value) {
            Err(CommError::LengthOverflow { max, .. }) => assert_eq!(max, 255),
            other => panic!("expected LengthOverflow, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let m = marshaller(2, false);
        // length=1, tag=0x7F, no payload
        let frame = vec![0x00, 0x01, 0x7F];
        assert!(matches!(
            m.decode(&frame),
            Err(CommError::UnknownTypeTag(0x7F))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let m = marshaller(2, false);
        let mut frame = m.encode(&Value::U8(7)).unwrap();
        frame.push(0xFF);
        assert!(m.decode(&frame).is_err());
    }

    #[test]
    fn override_tag_forces_decode_path() {
        // Sender overrides U32's tag with I32: receiver decodes signed
        let settings = MarshalSettings {
            override_type_tag: Some(tag::I32),
            ..MarshalSettings::default()
        };
        let m = Marshaller::new(&settings).unwrap();
        let frame = m.encode(&Value::U32(0xFFFF_FFFF)).unwrap();

        let plain = marshaller(2, false);
        assert_eq!(plain.decode(&frame).unwrap(), Value::I32(-1));
    }

    #[test]
    fn null_in_list_distinct_from_empty() {
        let m = marshaller(2, false);
        let with_null = m.encode(&Value::List(vec![Value::Null])).unwrap();
        let empty = m.encode(&Value::List(vec![])).unwrap();
        assert_ne!(with_null, empty);
        assert_eq!(m.decode(&with_null).unwrap(), Value::List(vec![Value::Null]));
        assert_eq!(m.decode(&empty).unwrap(), Value::List(vec![]));
    }
}
