//! Length-delimited frame codec for the post-handshake CSP stream.
//!
//! Wire format: 2-byte little-endian length prefix + encrypted box. The codec
//! does not touch the box; encryption is owned by the [`CspSession`](crate::CspSession).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::defines::DEFINES;
use crate::ProtocolError;

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 2;

/// Codec for framing encrypted boxes over a byte stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u16::MAX as usize),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFINES.max_frame_len)
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u16::from_le_bytes([src[0], src[1]]) as usize;
        if length > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_len,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).to_vec()))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_len,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u16_le(item.len() as u16);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
