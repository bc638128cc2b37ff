//! Stream framing for the Meshtastic serial/TCP API.
//!
//! Every protobuf on the stream is preceded by a four byte header:
//!
//!   `0x94 0xC3 <len_hi> <len_lo>`
//!
//! Radios interleave plain debug log text with frames on serial links, so the framer skips
//! anything that is not a header and resynchronizes on the next `0x94`.
use bytes::{Buf, BytesMut};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
const HEADER_LEN: usize = 4;

/// Largest payload accepted from the radio.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Incremental decoder fed with arbitrary chunks.
pub struct StreamFramer {
    buf: BytesMut,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
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

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete payload, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.buf.len() < HEADER_LEN {
                self.drop_garbage_prefix();
                return None;
            }

            if !(self.buf[0] == START1 && self.buf[1] == START2) {
                match self.buf.iter().skip(1).position(|&b| b == START1) {
                    Some(pos) => self.buf.advance(pos + 1),
                    None => {
                        self.buf.clear();
                        return None;
                    }
                }
                continue;
            }

            let declared = ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
            if declared == 0 || declared > MAX_FRAME_SIZE {
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

    // Keep a trailing partial header; anything before it is log noise.
    fn drop_garbage_prefix(&mut self) {
        match self.buf.iter().position(|&b| b == START1) {
            Some(pos) if pos > 0 => self.buf.advance(pos),
            Some(_) => {}
            None => self.buf.clear(),
        }
    }
}

/// Prefix `payload` with the stream header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(START1);
    out.push(START2);
    out.push(((payload.len() >> 8) & 0xFF) as u8);
    out.push((payload.len() & 0xFF) as u8);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(b"hello mesh");
        let mut framer = StreamFramer::new();
        framer.push(&frame[..3]);
        assert!(framer.next_frame().is_none());
        framer.push(&frame[3..8]);
        assert!(framer.next_frame().is_none());
        framer.push(&frame[8..]);
        assert_eq!(framer.next_frame().as_deref(), Some(&b"hello mesh"[..]));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn skips_debug_text_between_frames() {
        let mut stream = b"INFO | booting radio\r\n".to_vec();
        stream.extend(encode_frame(b"one"));
        stream.extend_from_slice(b"\x94garbage");
        stream.extend(encode_frame(b"two"));

        let mut framer = StreamFramer::new();
        framer.push(&stream);
        assert_eq!(framer.next_frame().as_deref(), Some(&b"one"[..]));
        assert_eq!(framer.next_frame().as_deref(), Some(&b"two"[..]));
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn oversized_length_resyncs() {
        let mut stream = vec![START1, START2, 0xFF, 0xFF];
        stream.extend(encode_frame(b"ok"));
        let mut framer = StreamFramer::new();
        framer.push(&stream);
        assert_eq!(framer.next_frame().as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn header_encodes_big_endian_length() {
        let payload = vec![7u8; 300];
        let frame = encode_frame(&payload);
        assert_eq!(&frame[..4], &[0x94, 0xC3, 0x01, 0x2C]);
        assert_eq!(frame.len(), 304);
    }
}
