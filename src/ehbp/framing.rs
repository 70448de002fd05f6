//! Body framing: `u32 big-endian header ‖ ciphertext`, repeated
//!
//! The header's top bit marks the final frame of a body; the remaining 31
//! bits are the ciphertext length. The flag is also bound into each frame's
//! AEAD associated data, so a body cut on a frame boundary is detected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Largest plaintext sealed into a single frame by this crate
pub const MAX_CHUNK_LEN: usize = 64 * 1024;

/// AES-GCM tag length
pub const TAG_LEN: usize = 16;

/// Largest ciphertext frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024 + TAG_LEN;

const HEADER_LEN: usize = 4;
const FINAL_FLAG: u32 = 1 << 31;

/// One sealed chunk as it travels on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Set on the last frame of a body
    pub last: bool,
    pub ciphertext: Bytes,
}

/// Append one frame to `out`
pub fn encode_frame(ciphertext: &[u8], last: bool, out: &mut BytesMut) {
    let flag = if last { FINAL_FLAG } else { 0 };
    out.reserve(HEADER_LEN + ciphertext.len());
    out.put_u32(ciphertext.len() as u32 | flag);
    out.put_slice(ciphertext);
}

/// Incremental frame decoder for bodies arriving in arbitrary pieces
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or `None` if more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let len = (header & !FINAL_FLAG) as usize;
        if len < TAG_LEN {
            return Err(Error::Transport(format!("frame of {} bytes is shorter than the tag", len)));
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::Transport(format!("frame of {} bytes exceeds limit", len)));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(Frame {
            last: header & FINAL_FLAG != 0,
            ciphertext: self.buf.split_to(len).freeze(),
        }))
    }

    /// Call at end of body; leftover bytes mean a truncated frame
    pub fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "body ended inside a frame ({} trailing bytes)",
                self.buf.len()
            )))
        }
    }
}

/// Split a complete body into frames
pub fn decode_all(body: &[u8]) -> Result<Vec<Frame>> {
    let mut decoder = FrameDecoder::new();
    decoder.extend(body);

    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    decoder.finish()?;
    Ok(frames)
}
