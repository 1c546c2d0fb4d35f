//! WebSocket frame codec (RFC 6455 wire format).
//!
//! Wire format: `[FIN|RSV|opcode: u8][MASK|len7: u8][ext len: 0/2/8 bytes][mask key: 0/4 bytes][payload]`
//!
//! Client frames arrive masked; server frames are always written unmasked.
//! Fragmented messages are not supported: continuation frames and text
//! frames without FIN are handed up as-is and dropped by the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Payload is written to the socket in slices of this size.
const WRITE_CHUNK: usize = 64 * 1024;

/// Close status sent when the peer asked to close without a code.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close status sent when the server is shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close status for a frame or buffer beyond the configured limits.
pub const CLOSE_TOO_BIG: u16 = 1009;
/// Close status for a text frame whose payload is not UTF-8.
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;

/// Frame opcode values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Self {
        match byte & 0x0f {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(b) => b & 0x0f,
        }
    }
}

/// Transport-level framing violations. Any of these closes the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame buffer would exceed {limit} bytes")]
    BufferOverflow { limit: usize },
    #[error("frame declares {declared} payload bytes, limit is {limit}")]
    FrameTooLarge { declared: u64, limit: usize },
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Bytes occupied by the header, including extended length and mask key.
    pub header_len: usize,
}

/// A complete frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Assemble a big-endian length field by accumulation.
///
/// Saturates instead of wrapping, so a bogus length with the top bit set
/// still ends up above any configured limit.
fn be_length(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| acc.saturating_mul(256).saturating_add(u64::from(b)))
}

/// Parse a frame header from the front of `buf`.
///
/// Returns `None` when `buf` does not yet hold the full header.
pub fn parse_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < 2 {
        return None;
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0]);
    let masked = buf[1] & 0x80 != 0;

    let (payload_len, mut offset) = match buf[1] & 0x7f {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (be_length(&buf[2..4]), 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            (be_length(&buf[2..10]), 10)
        }
        n => (u64::from(n), 2),
    };

    let mask = if masked {
        if buf.len() < offset + 4 {
            return None;
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    Some(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
        header_len: offset,
    })
}

/// XOR `payload` in place with the repeating 4-byte `key`.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Incremental decoder over an accumulating byte buffer.
///
/// Feed socket reads with [`push`](Self::push) and pull complete frames with
/// [`next_frame`](Self::next_frame). Partial frames stay buffered until the
/// rest arrives, so decoding does not depend on how the stream was chunked.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_buffered: usize,
}

impl FrameDecoder {
    pub fn new(max_buffered: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_buffered,
        }
    }

    /// Append received bytes. Fails if the unprocessed backlog would exceed
    /// the configured limit. The same limit bounds a whole frame (header
    /// included) in [`next_frame`](Self::next_frame), so any frame that
    /// decodes also fits the buffer.
    pub fn push(&mut self, data: &[u8]) -> Result<(), FrameError> {
        if self.buf.len() + data.len() > self.max_buffered {
            return Err(FrameError::BufferOverflow {
                limit: self.max_buffered,
            });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Pop the next complete frame, or `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(header) = parse_header(&self.buf) else {
            return Ok(None);
        };
        let frame_len = header.payload_len.saturating_add(header.header_len as u64);
        if frame_len > self.max_buffered as u64 {
            return Err(FrameError::FrameTooLarge {
                declared: header.payload_len,
                limit: self.max_buffered,
            });
        }
        let payload_len = header.payload_len as usize;
        if self.buf.len() < header.header_len + payload_len {
            return Ok(None);
        }

        self.buf.advance(header.header_len);
        let mut payload = self.buf.split_to(payload_len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }
        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload: payload.freeze(),
        }))
    }

    /// Number of bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Write an unmasked, final-fragment header for a payload of `len` bytes.
pub fn encode_header(opcode: Opcode, len: usize, dst: &mut BytesMut) {
    dst.put_u8(0x80 | opcode.as_u8());
    if len < 126 {
        dst.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(126);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(127);
        dst.put_u64(len as u64);
    }
}

/// Encode a complete server-to-client frame into one buffer.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(10 + payload.len());
    encode_header(opcode, payload.len(), &mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

/// Write a frame to an async writer, streaming the payload in bounded chunks.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
) -> io::Result<()> {
    let mut header = BytesMut::with_capacity(10);
    encode_header(opcode, payload.len(), &mut header);
    writer.write_all(&header).await?;
    for chunk in payload.chunks(WRITE_CHUNK) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

/// Build the payload of a close frame.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a client-style (masked) frame.
    fn masked_frame(opcode: Opcode, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_header(opcode, payload.len(), &mut out);
        out[1] |= 0x80;
        out.put_slice(&key);
        let mut body = payload.to_vec();
        apply_mask(&mut body, key);
        out.put_slice(&body);
        out.to_vec()
    }

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decoding_is_insensitive_to_chunk_boundaries() {
        let key = [0x11, 0x22, 0x33, 0x44];
        let mut stream = Vec::new();
        stream.extend(masked_frame(Opcode::Text, b"hello", key));
        stream.extend(masked_frame(Opcode::Ping, b"", key));
        stream.extend(masked_frame(Opcode::Text, &[b'x'; 300], key));
        stream.extend(masked_frame(Opcode::Text, &vec![b'y'; 70_000], key));

        let mut whole = FrameDecoder::new(1 << 20);
        whole.push(&stream).unwrap();
        let expected = decode_all(&mut whole);
        assert_eq!(expected.len(), 4);

        for split in [1, 2, 3, 7, 11, 129, 4096] {
            let mut decoder = FrameDecoder::new(1 << 20);
            let mut got = Vec::new();
            for chunk in stream.chunks(split) {
                decoder.push(chunk).unwrap();
                got.extend(decode_all(&mut decoder));
            }
            assert_eq!(got, expected, "chunk size {split}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn masked_payload_matches_xor_with_repeated_key() {
        let key = [0xde, 0xad, 0xbe, 0xef];
        let payload: Vec<u8> = (0..=250u8).collect();
        let wire = masked_frame(Opcode::Binary, &payload, key);

        let header = parse_header(&wire).unwrap();
        assert_eq!(header.mask, Some(key));
        let on_wire = &wire[header.header_len..];
        let xored: Vec<u8> = payload
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % 4])
            .collect();
        assert_eq!(on_wire, xored.as_slice());

        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&wire).unwrap();
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn sixty_four_bit_length_is_not_truncated() {
        let declared: u64 = 5_000_000_000;
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&declared.to_be_bytes());
        let header = parse_header(&wire).unwrap();
        assert_eq!(header.payload_len, 5_000_000_000);
        assert_eq!(header.header_len, 10);

        let mut decoder = FrameDecoder::new(32 * 1024 * 1024);
        decoder.push(&wire).unwrap();
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::FrameTooLarge {
                declared: 5_000_000_000,
                limit: 32 * 1024 * 1024,
            })
        );
    }

    #[test]
    fn length_with_top_bit_set_saturates() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&[0xff; 8]);
        assert_eq!(parse_header(&wire).unwrap().payload_len, u64::MAX);
    }

    #[test]
    fn incomplete_header_and_payload_wait_for_more() {
        let wire = masked_frame(Opcode::Text, &[b'a'; 200], [1, 2, 3, 4]);
        let mut decoder = FrameDecoder::new(4096);
        decoder.push(&wire[..1]).unwrap();
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.push(&wire[1..3]).unwrap();
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.push(&wire[3..wire.len() - 1]).unwrap();
        assert_eq!(decoder.next_frame(), Ok(None));
        decoder.push(&wire[wire.len() - 1..]).unwrap();
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload.len(), 200);
    }

    #[test]
    fn frame_limit_counts_the_header() {
        // 2 header bytes + 4 mask bytes + 58 payload bytes = 64.
        let fits = masked_frame(Opcode::Binary, &[7u8; 58], [1, 2, 3, 4]);
        assert_eq!(fits.len(), 64);
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&fits).unwrap();
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload.len(), 58);

        // One byte more is rejected up front, before the payload arrives.
        let over = masked_frame(Opcode::Binary, &[7u8; 59], [1, 2, 3, 4]);
        let mut decoder = FrameDecoder::new(64);
        decoder.push(&over[..6]).unwrap();
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::FrameTooLarge {
                declared: 59,
                limit: 64,
            })
        );
    }

    #[test]
    fn push_beyond_limit_is_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&[0u8; 10]).unwrap();
        assert_eq!(
            decoder.push(&[0u8; 7]),
            Err(FrameError::BufferOverflow { limit: 16 })
        );
    }

    #[test]
    fn server_frames_are_unmasked_with_matching_length_forms() {
        let small = encode_frame(Opcode::Text, b"hi");
        assert_eq!(small.as_ref(), &[0x81, 2, b'h', b'i']);

        let medium = encode_frame(Opcode::Binary, &[0u8; 300]);
        assert_eq!(&medium[..4], &[0x82, 126, 0x01, 0x2c]);

        let large = encode_frame(Opcode::Binary, &vec![0u8; 70_000]);
        assert_eq!(large[1], 127);
        let header = parse_header(&large).unwrap();
        assert_eq!(header.payload_len, 70_000);
        assert!(header.mask.is_none());
    }

    #[tokio::test]
    async fn write_frame_streams_large_payloads() {
        let payload = vec![7u8; WRITE_CHUNK * 3 + 5];
        let mut out: Vec<u8> = Vec::new();
        write_frame(&mut out, Opcode::Binary, &payload).await.unwrap();

        let mut decoder = FrameDecoder::new(payload.len() + 16);
        decoder.push(&out).unwrap();
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload.len(), payload.len());
    }

    #[test]
    fn close_code_is_read_from_payload() {
        let frame = Frame {
            fin: true,
            opcode: Opcode::Close,
            payload: Bytes::from(close_payload(1001, "bye")),
        };
        assert_eq!(frame.close_code(), Some(1001));
    }
}
