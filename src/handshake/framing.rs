//! Wire framing for the `Running`-state control channel.
//!
//! Each frame is `len:u32-be | type:u16-be | reserved:u16-be(=0) | body`,
//! where `len` covers only `body`. Adapted from the RFC 4571 2-byte framing
//! idiom used elsewhere in this codebase, widened to a 4-byte length and a
//! type tag instead of a bare length prefix.

pub const HEADER_LEN: usize = 8;
pub const MAX_FRAME_BODY: usize = 1 << 20;

#[derive(Debug)]
pub enum FrameError {
    FrameTooLarge(usize),
}

pub fn encode_frame(frame_type: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub struct DecodedFrame {
    pub frame_type: u16,
    pub body: Vec<u8>,
}

/// Stateful decoder handling partial reads across TCP segment boundaries.
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(4096) }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<DecodedFrame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_BODY {
            return Err(FrameError::FrameTooLarge(len));
        }
        let frame_type = u16::from_be_bytes([self.buf[4], self.buf[5]]);
        let total = HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let body = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(DecodedFrame { frame_type, body }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let framed = encode_frame(0x00FE, b"payload");
        let mut dec = FrameDecoder::new();
        dec.extend(&framed);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.frame_type, 0x00FE);
        assert_eq!(frame.body, b"payload");
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn handles_byte_at_a_time_delivery() {
        let framed = encode_frame(0x0033, b"session-id-body");
        let mut dec = FrameDecoder::new();
        for &b in &framed {
            dec.extend(&[b]);
        }
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.body, b"session-id-body");
    }
}
