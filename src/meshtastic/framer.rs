//! Stream framer for the Meshtastic serial API.
//!
//! Binary frames on the serial link are emitted as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! Anything between frames (boot banners, debug console text) is skipped. The framer
//! is fed arbitrary chunks and yields whole payloads once they are complete.
use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Largest payload the firmware emits (`MAX_TO_FROM_RADIO_SIZE`).
pub const MAX_PAYLOAD: usize = 512;

pub struct StreamFramer {
    buf: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pull the next complete payload, if any. Garbage before a header and headers
    /// with an impossible length are discarded one byte at a time.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => self.buf.advance(pos),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != START2 {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let declared = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
            if declared == 0 || declared > MAX_PAYLOAD {
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < HEADER_LEN + declared {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(declared).to_vec());
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix `payload` with the serial frame header.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD {
        return None;
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[
        START1,
        START2,
        ((payload.len() >> 8) & 0xFF) as u8,
        (payload.len() & 0xFF) as u8,
    ]);
    out.extend_from_slice(payload);
    Some(out)
}
