//! Rendezvous frames: `u32 LE length ‖ encrypted payload`.

use bytes::{Buf, BytesMut};

use crate::RendezvousProtocolError;

const LENGTH_PREFIX: usize = 4;

/// Encrypted frame ready to be written to a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame(pub Vec<u8>);

impl OutgoingFrame {
    /// Length-prefixed wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LENGTH_PREFIX + self.0.len());
        out.extend_from_slice(&(self.0.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.0);
        out
    }
}

/// Reassembles frames from arbitrarily chunked path data.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `chunks`. Returns the announced length of the next frame once
    /// its prefix is complete.
    pub fn add_chunks(&mut self, chunks: &[&[u8]]) -> Option<usize> {
        for chunk in chunks {
            self.buffer.extend_from_slice(chunk);
        }
        self.next_length()
    }

    fn next_length(&self) -> Option<usize> {
        if self.buffer.len() < LENGTH_PREFIX {
            return None;
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
        Some(u32::from_le_bytes(prefix) as usize)
    }

    /// Pop the next complete frame payload. Fails as soon as the announced
    /// length of the next frame exceeds `max_length`.
    pub fn next_frame(
        &mut self,
        max_length: usize,
    ) -> Result<Option<Vec<u8>>, RendezvousProtocolError> {
        let Some(length) = self.next_length() else {
            return Ok(None);
        };
        if length > max_length {
            return Err(RendezvousProtocolError::OversizedFrame(length));
        }
        if self.buffer.len() < LENGTH_PREFIX + length {
            return Ok(None);
        }
        self.buffer.advance(LENGTH_PREFIX);
        Ok(Some(self.buffer.split_to(length).to_vec()))
    }
}
