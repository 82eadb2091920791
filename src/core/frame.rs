//! Stream framing
//!
//! TCP carries no datagram boundaries, so secured blobs are delimited by
//! an outer length prefix with the same configurable width and
//! endianness as the marshalling codec. Both endpoints must share the
//! configuration; a mismatch surfaces as a framing error, not silent
//! corruption.
//!
//! Frame length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation happens.

use crate::config::{MarshalSettings, MAX_FRAME_SIZE};
use crate::error::CommError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length-delimited codec for secured frame blobs on byte streams.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    width: usize,
    little_endian: bool,
}

impl FrameCodec {
    pub fn new(settings: &MarshalSettings) -> Self {
        Self {
            width: settings.length_width.clamp(1, 4) as usize,
            little_endian: settings.little_endian,
        }
    }

    fn max_len(&self) -> usize {
        let range = match self.width {
            4 => u32::MAX as usize,
            w => (1usize << (8 * w)) - 1,
        };
        range.min(MAX_FRAME_SIZE)
    }

    fn read_len(&self, raw: &[u8]) -> usize {
        let mut v = 0usize;
        if self.little_endian {
            for (i, b) in raw.iter().enumerate() {
                v |= (*b as usize) << (8 * i);
            }
        } else {
            for b in raw {
                v = (v << 8) | *b as usize;
            }
        }
        v
    }

    fn write_len(&self, dst: &mut BytesMut, len: usize) {
        if self.little_endian {
            let bytes = (len as u64).to_le_bytes();
            dst.put_slice(&bytes[..self.width]);
        } else {
            let bytes = (len as u64).to_be_bytes();
            dst.put_slice(&bytes[8 - self.width..]);
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CommError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < self.width {
            return Ok(None);
        }

        let len = self.read_len(&src[..self.width]);
        if len > self.max_len() {
            return Err(CommError::Marshal(format!(
                "Stream frame of {len} bytes exceeds the {} byte limit",
                self.max_len()
            )));
        }

        if src.len() < self.width + len {
            src.reserve(self.width + len - src.len());
            return Ok(None);
        }

        src.advance(self.width);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CommError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_len() {
            return Err(CommError::LengthOverflow {
                len: item.len(),
                max: self.max_len() as u64,
            });
        }
        dst.reserve(self.width + item.len());
        self.write_len(dst, item.len());
        dst.put_slice(&item);
        Ok(())
    }
}
