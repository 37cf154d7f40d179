//! message level framing on top of the header parser.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::{
    error::ProtocolError,
    frame::{self, FrameHeader, HeaderParser},
    proto::{CloseReason, OpCode},
    utf8::Utf8Checker,
};

/// A websocket message.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// text message. the payload is valid UTF-8.
    Text(Bytes),
    /// binary message.
    Binary(Bytes),
    /// one fragment of a fragmented message.
    Continuation(Item),
    /// ping control message.
    Ping(Bytes),
    /// pong control message.
    Pong(Bytes),
    /// close control message with optional reason.
    Close(Option<CloseReason>),
}

/// One fragment of a fragmented message.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Item {
    FirstText(Bytes),
    FirstBinary(Bytes),
    Continue(Bytes),
    Last(Bytes),
}

#[derive(Debug, Copy, Clone)]
struct Flags(u8);

impl Flags {
    const SERVER: u8 = 0b0001;
    /// an incoming fragmented message is in progress.
    const CONTINUATION: u8 = 0b0010;
    /// an outgoing fragmented message is in progress.
    const W_CONTINUATION: u8 = 0b0100;

    fn remove(&mut self, other: u8) {
        self.0 &= !other;
    }

    fn insert(&mut self, other: u8) {
        self.0 |= other;
    }

    const fn contains(&self, other: u8) -> bool {
        (self.0 & other) == other
    }
}

/// websocket protocol codec.
///
/// Enforces the framing rules of RFC 6455: masking direction, rsv bits,
/// control frame constraints, continuation bookkeeping and incremental UTF-8
/// validation of text messages (splits mid-codepoint across fragments are
/// accepted).
pub struct Codec {
    flags: Flags,
    max_size: usize,
    parser: HeaderParser,
    /// parsed header of the frame whose payload has not fully arrived.
    pending: Option<FrameHeader>,
    /// validation state of the current (possibly fragmented) text message.
    utf8: Utf8Checker,
    /// the fragmented message in progress is a text message.
    text_message: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Create a codec in server mode.
    pub fn new() -> Self {
        Self {
            flags: Flags(Flags::SERVER),
            max_size: 65_536,
            parser: HeaderParser::new(),
            pending: None,
            utf8: Utf8Checker::new(),
            text_message: false,
        }
    }

    /// Set the maximum accepted frame payload size. 64kB by default.
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Switch the codec to client mode: outgoing frames are masked, incoming
    /// frames must not be.
    pub fn client_mode(mut self) -> Self {
        self.flags.remove(Flags::SERVER);
        self
    }

    /// Encode one message into `dst`.
    pub fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mask = (!self.flags.contains(Flags::SERVER)).then(rand::random::<[u8; 4]>);

        match item {
            Message::Text(bytes) => frame::write_frame(dst, OpCode::Text, true, &bytes, mask),
            Message::Binary(bytes) => frame::write_frame(dst, OpCode::Binary, true, &bytes, mask),
            Message::Ping(bytes) => frame::write_frame(dst, OpCode::Ping, true, &bytes, mask),
            Message::Pong(bytes) => frame::write_frame(dst, OpCode::Pong, true, &bytes, mask),
            Message::Close(reason) => frame::write_close(dst, reason.as_ref(), mask),
            Message::Continuation(item) => match item {
                Item::FirstText(ref bytes) => {
                    self.try_start_write_continuation()?;
                    frame::write_frame(dst, OpCode::Text, false, bytes, mask);
                }
                Item::FirstBinary(ref bytes) => {
                    self.try_start_write_continuation()?;
                    frame::write_frame(dst, OpCode::Binary, false, bytes, mask);
                }
                Item::Continue(ref bytes) => {
                    if !self.flags.contains(Flags::W_CONTINUATION) {
                        return Err(ProtocolError::ContinuationNotStarted);
                    }
                    frame::write_frame(dst, OpCode::Continue, false, bytes, mask);
                }
                Item::Last(ref bytes) => {
                    if !self.flags.contains(Flags::W_CONTINUATION) {
                        return Err(ProtocolError::ContinuationNotStarted);
                    }
                    self.flags.remove(Flags::W_CONTINUATION);
                    frame::write_frame(dst, OpCode::Continue, true, bytes, mask);
                }
            },
        }

        Ok(())
    }

    fn try_start_write_continuation(&mut self) -> Result<(), ProtocolError> {
        if self.flags.contains(Flags::W_CONTINUATION) {
            Err(ProtocolError::ContinuationStarted)
        } else {
            self.flags.insert(Flags::W_CONTINUATION);
            Ok(())
        }
    }

    /// Decode the next message out of `src`. Returns `None` until a complete
    /// frame arrived.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => match self.parser.parse(src) {
                Some(header) => {
                    self.parser.reset();
                    self.validate_header(&header)?;
                    header
                }
                None => return Ok(None),
            },
        };

        let Some(payload) = frame::take_payload(src, &header) else {
            self.pending = Some(header);
            return Ok(None);
        };

        self.interpret(header, payload).map(Some)
    }

    fn validate_header(&self, header: &FrameHeader) -> Result<(), ProtocolError> {
        if header.rsv_set() {
            return Err(ProtocolError::RsvBitsSet);
        }

        if matches!(header.opcode, OpCode::Bad) {
            return Err(ProtocolError::BadOpCode);
        }

        // server-to-client frames must be unmasked, client-to-server frames
        // must be masked.
        if self.flags.contains(Flags::SERVER) {
            if !header.masked {
                return Err(ProtocolError::UnmaskedFrame);
            }
        } else if header.masked {
            return Err(ProtocolError::MaskedFrame);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(ProtocolError::FragmentedControlFrame(header.opcode));
            }
            if header.payload_len > frame::MAX_PLAIN_LEN as u64 {
                return Err(ProtocolError::InvalidLength(header.payload_len as usize));
            }
        }

        if header.payload_len > self.max_size as u64 {
            return Err(ProtocolError::Overflow);
        }

        Ok(())
    }

    fn interpret(&mut self, header: FrameHeader, payload: Bytes) -> Result<Message, ProtocolError> {
        let continuation = self.flags.contains(Flags::CONTINUATION);

        match header.opcode {
            OpCode::Continue if !continuation => Err(ProtocolError::ContinuationNotStarted),
            OpCode::Continue => {
                if self.text_message {
                    self.validate_text_fragment(&payload, header.fin)?;
                }
                if header.fin {
                    self.flags.remove(Flags::CONTINUATION);
                    Ok(Message::Continuation(Item::Last(payload)))
                } else {
                    Ok(Message::Continuation(Item::Continue(payload)))
                }
            }
            OpCode::Text if continuation => Err(ProtocolError::ContinuationStarted),
            OpCode::Binary if continuation => Err(ProtocolError::ContinuationStarted),
            OpCode::Text if !header.fin => {
                self.flags.insert(Flags::CONTINUATION);
                self.text_message = true;
                self.utf8.reset();
                self.validate_text_fragment(&payload, false)?;
                Ok(Message::Continuation(Item::FirstText(payload)))
            }
            OpCode::Binary if !header.fin => {
                self.flags.insert(Flags::CONTINUATION);
                self.text_message = false;
                Ok(Message::Continuation(Item::FirstBinary(payload)))
            }
            OpCode::Text => {
                self.utf8.reset();
                self.validate_text_fragment(&payload, true)?;
                Ok(Message::Text(payload))
            }
            OpCode::Binary => Ok(Message::Binary(payload)),
            OpCode::Close => {
                trace!(target: "ws_codec", "close frame received");
                if payload.len() == 1 {
                    return Err(ProtocolError::InvalidLength(1));
                }
                if payload.len() > 2 && !super::utf8::is_valid_utf8(&payload[2..]) {
                    return Err(ProtocolError::InvalidUtf8);
                }
                Ok(Message::Close(frame::parse_close_payload(&payload)))
            }
            OpCode::Ping => Ok(Message::Ping(payload)),
            OpCode::Pong => Ok(Message::Pong(payload)),
            OpCode::Bad => Err(ProtocolError::BadOpCode),
        }
    }

    // feed one text fragment into the message-scoped validation automaton.
    // `last` requires the stream to end on a codepoint boundary.
    fn validate_text_fragment(&mut self, payload: &[u8], last: bool) -> Result<(), ProtocolError> {
        if !self.utf8.process(payload) {
            return Err(ProtocolError::InvalidUtf8);
        }
        if last && !self.utf8.finalized() {
            return Err(ProtocolError::InvalidUtf8);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn masked(opcode: OpCode, fin: bool, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        frame::write_frame(&mut buf, opcode, fin, payload, Some([0x11, 0x22, 0x33, 0x44]));
        buf
    }

    #[test]
    fn server_decodes_masked_text() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Text, true, b"Hello");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Text(Bytes::from_static(b"Hello")));
    }

    #[test]
    fn server_rejects_unmasked_frame() {
        let mut codec = Codec::new();
        let mut src = BytesMut::new();
        frame::write_frame(&mut src, OpCode::Text, true, b"Hello", None);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::UnmaskedFrame)));
    }

    #[test]
    fn client_rejects_masked_frame() {
        let mut codec = Codec::new().client_mode();
        let mut src = masked(OpCode::Text, true, b"Hello");
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::MaskedFrame)));
    }

    #[test]
    fn rsv_bits_are_rejected() {
        let mut codec = Codec::new();
        // fin + rsv1 + text opcode, masked empty payload.
        let mut src = BytesMut::from(&[0xC1u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::RsvBitsSet)));
    }

    #[test]
    fn fragmented_control_frame_is_rejected() {
        let mut codec = Codec::new();
        // ping without fin.
        let mut src = BytesMut::from(&[0x09u8, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::FragmentedControlFrame(OpCode::Ping))
        ));
    }

    #[test]
    fn oversize_control_frame_is_rejected() {
        let mut codec = Codec::new();
        let payload = vec![0u8; 126];
        let mut src = masked(OpCode::Ping, true, &payload);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::InvalidLength(126))));
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let mut codec = Codec::new().max_size(8);
        let mut src = masked(OpCode::Binary, true, &[0u8; 16]);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::Overflow)));
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut codec = Codec::new();
        let full = masked(OpCode::Text, true, b"Hello");

        let mut src = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&full[3..]);
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Text(Bytes::from_static(b"Hello")));
    }

    #[test]
    fn fragmented_message_round() {
        let mut codec = Codec::new();

        let mut src = masked(OpCode::Text, false, b"Hel");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Continuation(Item::FirstText(Bytes::from_static(b"Hel"))));

        let mut src = masked(OpCode::Continue, false, b"lo ");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Continuation(Item::Continue(Bytes::from_static(b"lo "))));

        let mut src = masked(OpCode::Continue, true, b"there");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Continuation(Item::Last(Bytes::from_static(b"there"))));
    }

    #[test]
    fn continuation_without_start_is_rejected() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Continue, true, b"x");
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::ContinuationNotStarted)
        ));
    }

    #[test]
    fn new_data_frame_during_continuation_is_rejected() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Binary, false, b"x");
        codec.decode(&mut src).unwrap().unwrap();

        let mut src = masked(OpCode::Text, true, b"y");
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::ContinuationStarted)));
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut codec = Codec::new();

        let mut src = masked(OpCode::Text, false, b"Hel");
        codec.decode(&mut src).unwrap().unwrap();

        let mut src = masked(OpCode::Ping, true, b"hi");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Ping(Bytes::from_static(b"hi")));

        let mut src = masked(OpCode::Continue, true, b"lo");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Continuation(Item::Last(Bytes::from_static(b"lo"))));
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Text, true, &[0xC0, 0xAF]);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn empty_text_frame_is_accepted() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Text, true, b"");
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Text(Bytes::new()));
    }

    #[test]
    fn utf8_split_across_fragments_is_accepted() {
        let mut codec = Codec::new();
        let euro = "€".as_bytes();

        let mut src = masked(OpCode::Text, false, &euro[..1]);
        codec.decode(&mut src).unwrap().unwrap();

        let mut src = masked(OpCode::Continue, true, &euro[1..]);
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Message::Continuation(Item::Last(Bytes::copy_from_slice(&euro[1..]))));
    }

    #[test]
    fn utf8_truncated_at_message_end_is_rejected() {
        let mut codec = Codec::new();
        let euro = "€".as_bytes();

        let mut src = masked(OpCode::Text, false, &euro[..1]);
        codec.decode(&mut src).unwrap().unwrap();

        let mut src = masked(OpCode::Continue, true, &euro[..1]);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::InvalidUtf8)));
    }

    #[test]
    fn close_round_trip() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Close, true, &[0x03, 0xE8]);
        let msg = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(
            msg,
            Message::Close(Some(CloseReason {
                code: super::super::proto::CloseCode::Normal,
                description: None
            }))
        );
    }

    #[test]
    fn one_byte_close_payload_is_rejected() {
        let mut codec = Codec::new();
        let mut src = masked(OpCode::Close, true, &[0x03]);
        assert!(matches!(codec.decode(&mut src), Err(ProtocolError::InvalidLength(1))));
    }

    #[test]
    fn client_encode_masks_server_encode_does_not() {
        let mut server = Codec::new();
        let mut dst = BytesMut::new();
        server.encode(Message::Text(Bytes::from_static(b"Hello")), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        let mut client = Codec::new().client_mode();
        let mut dst = BytesMut::new();
        client.encode(Message::Text(Bytes::from_static(b"Hello")), &mut dst).unwrap();
        assert_eq!(dst[1] & 0x80, 0x80);

        // the server side decodes the masked frame back.
        let msg = server.decode(&mut dst).unwrap().unwrap();
        assert_eq!(msg, Message::Text(Bytes::from_static(b"Hello")));
    }

    #[test]
    fn write_continuation_bookkeeping() {
        let mut codec = Codec::new();
        let mut dst = BytesMut::new();

        assert!(matches!(
            codec.encode(Message::Continuation(Item::Continue(Bytes::new())), &mut dst),
            Err(ProtocolError::ContinuationNotStarted)
        ));

        codec
            .encode(Message::Continuation(Item::FirstBinary(Bytes::from_static(b"a"))), &mut dst)
            .unwrap();
        assert!(matches!(
            codec.encode(Message::Continuation(Item::FirstText(Bytes::new())), &mut dst),
            Err(ProtocolError::ContinuationStarted)
        ));
        codec
            .encode(Message::Continuation(Item::Last(Bytes::from_static(b"b"))), &mut dst)
            .unwrap();

        // a fresh message may start after the last fragment.
        codec
            .encode(Message::Continuation(Item::FirstText(Bytes::from_static(b"c"))), &mut dst)
            .unwrap();
    }
}
