//! frame header parsing and serialization.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    mask::apply_mask,
    proto::{CloseReason, OpCode},
};

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const RSV2: u8 = 0x20;
const RSV3: u8 = 0x10;
const OPCODE_MASK: u8 = 0x0F;
const MASKED: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

const SHORT_EXT_LEN_CODE: u8 = 126;
const LONG_EXT_LEN_CODE: u8 = 127;
/// largest payload expressible without an extended length field.
pub(crate) const MAX_PLAIN_LEN: usize = 125;

/// One parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub mask_key: [u8; 4],
    pub payload_len: u64,
}

impl FrameHeader {
    pub fn rsv_set(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// fin/rsv/opcode byte and mask/length-code byte.
    FirstTwo,
    /// 2 or 8 byte big-endian extended payload length.
    ExtendedLen,
    /// 4 byte masking key.
    MaskKey,
}

/// Byte-fed header parser.
///
/// Consumes bytes from the source as they become available; a frame header
/// may arrive split at any byte position.
pub struct HeaderParser {
    state: ParseState,
    buf: [u8; 8],
    filled: usize,
    expected: usize,
    header: FrameHeader,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::FirstTwo,
            buf: [0; 8],
            filled: 0,
            expected: 2,
            header: FrameHeader {
                fin: false,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode: OpCode::Continue,
                masked: false,
                mask_key: [0; 4],
                payload_len: 0,
            },
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed bytes from `src`. Returns the header once complete; the parser
    /// must be [reset](HeaderParser::reset) before the next frame.
    pub fn parse(&mut self, src: &mut BytesMut) -> Option<FrameHeader> {
        loop {
            let take = (self.expected - self.filled).min(src.len());
            self.buf[self.filled..self.filled + take].copy_from_slice(&src[..take]);
            self.filled += take;
            src.advance(take);

            if self.filled < self.expected {
                return None;
            }

            match self.state {
                ParseState::FirstTwo => {
                    let first = self.buf[0];
                    self.header.fin = first & FIN != 0;
                    self.header.rsv1 = first & RSV1 != 0;
                    self.header.rsv2 = first & RSV2 != 0;
                    self.header.rsv3 = first & RSV3 != 0;
                    self.header.opcode = OpCode::from(first & OPCODE_MASK);

                    let second = self.buf[1];
                    self.header.masked = second & MASKED != 0;

                    match second & LEN_MASK {
                        SHORT_EXT_LEN_CODE => self.await_bytes(ParseState::ExtendedLen, 2),
                        LONG_EXT_LEN_CODE => self.await_bytes(ParseState::ExtendedLen, 8),
                        len => {
                            self.header.payload_len = len as u64;
                            if self.header.masked {
                                self.await_bytes(ParseState::MaskKey, 4);
                            } else {
                                return Some(self.header);
                            }
                        }
                    }
                }
                ParseState::ExtendedLen => {
                    self.header.payload_len = match self.expected {
                        2 => u16::from_be_bytes([self.buf[0], self.buf[1]]) as u64,
                        _ => u64::from_be_bytes(self.buf),
                    };
                    if self.header.masked {
                        self.await_bytes(ParseState::MaskKey, 4);
                    } else {
                        return Some(self.header);
                    }
                }
                ParseState::MaskKey => {
                    self.header.mask_key.copy_from_slice(&self.buf[..4]);
                    return Some(self.header);
                }
            }
        }
    }

    fn await_bytes(&mut self, state: ParseState, expected: usize) {
        self.state = state;
        self.filled = 0;
        self.expected = expected;
    }
}

/// Serialize one frame header.
pub fn write_header(dst: &mut BytesMut, header: &FrameHeader) {
    let mut first = u8::from(header.opcode) & OPCODE_MASK;
    if header.fin {
        first |= FIN;
    }
    if header.rsv1 {
        first |= RSV1;
    }
    if header.rsv2 {
        first |= RSV2;
    }
    if header.rsv3 {
        first |= RSV3;
    }

    let masked = if header.masked { MASKED } else { 0 };

    dst.reserve(14);
    dst.put_u8(first);

    if header.payload_len <= MAX_PLAIN_LEN as u64 {
        dst.put_u8(masked | header.payload_len as u8);
    } else if header.payload_len <= u16::MAX as u64 {
        dst.put_u8(masked | SHORT_EXT_LEN_CODE);
        dst.put_u16(header.payload_len as u16);
    } else {
        dst.put_u8(masked | LONG_EXT_LEN_CODE);
        dst.put_u64(header.payload_len);
    }

    if header.masked {
        dst.put_slice(&header.mask_key);
    }
}

/// Serialize a whole frame, masking the payload when a key is given.
pub fn write_frame(dst: &mut BytesMut, opcode: OpCode, fin: bool, payload: &[u8], mask_key: Option<[u8; 4]>) {
    let header = FrameHeader {
        fin,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode,
        masked: mask_key.is_some(),
        mask_key: mask_key.unwrap_or_default(),
        payload_len: payload.len() as u64,
    };

    write_header(dst, &header);

    match mask_key {
        Some(key) => {
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(key, &mut dst[start..]);
        }
        None => dst.put_slice(payload),
    }
}

/// Serialize a close frame: optional 2 byte big-endian status code followed
/// by a UTF-8 reason.
pub fn write_close(dst: &mut BytesMut, reason: Option<&CloseReason>, mask_key: Option<[u8; 4]>) {
    match reason {
        None => write_frame(dst, OpCode::Close, true, &[], mask_key),
        Some(reason) => {
            let mut payload = Vec::with_capacity(2 + reason.description.as_ref().map_or(0, String::len));
            payload.extend_from_slice(&u16::from(reason.code).to_be_bytes());
            if let Some(ref description) = reason.description {
                payload.extend_from_slice(description.as_bytes());
            }
            write_frame(dst, OpCode::Close, true, &payload, mask_key);
        }
    }
}

/// Parse the payload of a close frame.
///
/// An empty payload carries no reason. RFC 6455 forbids a 1 byte payload.
pub fn parse_close_payload(payload: &[u8]) -> Option<CloseReason> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]).into();
    let description = if payload.len() > 2 {
        Some(String::from_utf8_lossy(&payload[2..]).into_owned())
    } else {
        None
    };
    Some(CloseReason { code, description })
}

/// Split one frame payload out of `src` once enough bytes arrived,
/// unmasking it when the header says so.
pub(crate) fn take_payload(src: &mut BytesMut, header: &FrameHeader) -> Option<Bytes> {
    let len = header.payload_len as usize;
    if src.len() < len {
        return None;
    }
    let mut payload = src.split_to(len);
    if header.masked {
        apply_mask(header.mask_key, &mut payload);
    }
    Some(payload.freeze())
}
