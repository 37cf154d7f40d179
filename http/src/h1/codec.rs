//! request body transfer decoding.
//!
//! Bodies are buffered in full before handler dispatch. The chunked decoder
//! additionally records a per-chunk description (offset into the decoded
//! body, declared length, chunk extension parameters) and collects trailing
//! header fields.

use bytes::{Buf, BytesMut};
use http::{HeaderMap, header::HeaderName, header::HeaderValue};
use tracing::trace;

use crate::request::{ChunkExt, ChunkInfo};

use super::error::ProtoError;

/// Progress of body decoding.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeState {
    /// more input bytes required.
    NeedMore,
    /// message complete. the sink holds the full body.
    Complete,
}

/// Accumulator for the decoded request body and its chunked-input metadata.
pub struct BodySink {
    pub body: BytesMut,
    pub chunks: Vec<ChunkInfo>,
    pub trailers: HeaderMap,
    max_body_size: usize,
}

impl BodySink {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            body: BytesMut::new(),
            chunks: Vec::new(),
            trailers: HeaderMap::new(),
            max_body_size,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), ProtoError> {
        if self.body.len() + bytes.len() > self.max_body_size {
            return Err(ProtoError::BodyTooLarge);
        }
        self.body.extend_from_slice(bytes);
        Ok(())
    }
}

/// Coder for the different body transfer encodings of an incoming request.
#[derive(Debug)]
pub enum BodyCoding {
    /// the request does not have a body.
    Eof,
    /// a Content-Length header with a positive integer was present.
    Length(u64),
    /// Transfer-Encoding included `chunked`.
    Chunked(ChunkedDecoder),
}

impl BodyCoding {
    #[inline]
    pub const fn eof() -> Self {
        Self::Eof
    }

    #[inline]
    pub const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    #[inline]
    pub fn chunked() -> Self {
        Self::Chunked(ChunkedDecoder::new())
    }

    /// `true` when no body bytes are expected at all.
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(*self, Self::Eof | Self::Length(0))
    }

    pub fn is_chunked(&self) -> bool {
        matches!(*self, Self::Chunked(_))
    }

    /// Set the coder from a framing header. A second framing source
    /// (duplicate Content-Length, or Content-Length next to chunked) is
    /// rejected.
    pub fn try_set(&mut self, other: Self) -> Result<(), ProtoError> {
        match *self {
            Self::Eof => {
                *self = other;
                Ok(())
            }
            _ => Err(ProtoError::HeaderName),
        }
    }

    /// Consume bytes from `src` into `sink` until the body completes or the
    /// input runs dry.
    pub fn decode(&mut self, src: &mut BytesMut, sink: &mut BodySink) -> Result<DecodeState, ProtoError> {
        match *self {
            Self::Eof => Ok(DecodeState::Complete),
            Self::Length(ref mut rem) => {
                if *rem == 0 {
                    return Ok(DecodeState::Complete);
                }
                let take = (*rem).min(src.len() as u64) as usize;
                sink.append(&src[..take])?;
                src.advance(take);
                *rem -= take as u64;
                if *rem == 0 {
                    Ok(DecodeState::Complete)
                } else {
                    Ok(DecodeState::NeedMore)
                }
            }
            Self::Chunked(ref mut decoder) => decoder.decode(src, sink),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    /// receiving a `<hex-size>[;extensions]` line.
    SizeLine,
    /// receiving chunk payload bytes.
    Data { remaining: u64 },
    /// receiving the CRLF closing a chunk's payload.
    DataEnd,
    /// receiving trailing header lines, up to the empty line.
    TrailerLine,
    Done,
}

/// Decoder for `Transfer-Encoding: chunked` input.
///
/// Works line-wise: chunk size lines and trailing header lines accumulate in
/// a scratch buffer until their LF arrives and are parsed in one piece,
/// while payload bytes stream straight into the sink. A chunk is recorded in
/// the sink the moment its size line completes.
#[derive(Debug)]
pub struct ChunkedDecoder {
    phase: Phase,
    /// scratch for the line being received. taken (left empty) once the
    /// line completes.
    line: Vec<u8>,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self {
            phase: Phase::SizeLine,
            line: Vec::new(),
        }
    }

    fn decode(&mut self, src: &mut BytesMut, sink: &mut BodySink) -> Result<DecodeState, ProtoError> {
        loop {
            match self.phase {
                Phase::SizeLine => {
                    let Some(line) = take_line(&mut self.line, src)? else {
                        return Ok(DecodeState::NeedMore);
                    };
                    let (size, ext) = parse_size_line(&line)?;
                    if size == 0 {
                        trace!(target: "h1_decode", "last chunk received");
                        self.phase = Phase::TrailerLine;
                    } else {
                        sink.chunks.push(ChunkInfo {
                            offset: sink.body.len(),
                            len: size as usize,
                            ext: parse_chunk_ext(ext),
                        });
                        self.phase = Phase::Data { remaining: size };
                    }
                }
                Phase::Data { ref mut remaining } => {
                    if src.is_empty() {
                        return Ok(DecodeState::NeedMore);
                    }
                    let take = (*remaining).min(src.len() as u64) as usize;
                    sink.append(&src[..take])?;
                    src.advance(take);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.phase = Phase::DataEnd;
                    }
                }
                Phase::DataEnd => {
                    if src.len() < 2 {
                        return Ok(DecodeState::NeedMore);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ProtoError::Chunk("chunk data not closed by CRLF"));
                    }
                    src.advance(2);
                    self.phase = Phase::SizeLine;
                }
                Phase::TrailerLine => {
                    let Some(line) = take_line(&mut self.line, src)? else {
                        return Ok(DecodeState::NeedMore);
                    };
                    if line.is_empty() {
                        self.phase = Phase::Done;
                    } else {
                        let (name, value) = split_trailer_line(&line)?;
                        sink.trailers.append(name, value);
                    }
                }
                Phase::Done => return Ok(DecodeState::Complete),
            }
        }
    }
}

// pull bytes into `acc` until a LF arrives. the completed line is returned
// without its CRLF; `None` asks for more input.
fn take_line(acc: &mut Vec<u8>, src: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtoError> {
    match src.iter().position(|&b| b == b'\n') {
        Some(lf) => {
            acc.extend_from_slice(&src[..lf]);
            src.advance(lf + 1);
            if acc.pop() != Some(b'\r') {
                return Err(ProtoError::Chunk("line not closed by CRLF"));
            }
            Ok(Some(std::mem::take(acc)))
        }
        None => {
            acc.extend_from_slice(src);
            let buffered = src.len();
            src.advance(buffered);
            Ok(None)
        }
    }
}

// `<hex-size>` optionally padded with trailing whitespace, optionally
// followed by `;extensions`.
fn parse_size_line(line: &[u8]) -> Result<(u64, &[u8]), ProtoError> {
    let (digits, ext) = match line.iter().position(|&b| b == b';') {
        Some(semi) => (&line[..semi], &line[semi + 1..]),
        None => (line, &line[..0]),
    };

    let digits = digits.trim_ascii_end();
    if digits.is_empty() {
        return Err(ProtoError::Chunk("chunk size missing"));
    }

    let mut size = 0u64;
    for &b in digits {
        let digit = (b as char)
            .to_digit(16)
            .ok_or(ProtoError::Chunk("invalid chunk size digit"))?;
        size = size
            .checked_mul(16)
            .and_then(|size| size.checked_add(digit as u64))
            .ok_or(ProtoError::Chunk("chunk size overflow"))?;
    }

    Ok((size, ext))
}

fn split_trailer_line(line: &[u8]) -> Result<(HeaderName, HeaderValue), ProtoError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ProtoError::Trailer("trailing field without colon"))?;

    let name = HeaderName::from_bytes(line[..colon].trim_ascii())
        .map_err(|_| ProtoError::Trailer("invalid trailing field name"))?;
    let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
        .map_err(|_| ProtoError::Trailer("invalid trailing field value"))?;

    Ok((name, value))
}

fn parse_chunk_ext(raw: &[u8]) -> Vec<ChunkExt> {
    raw.split(|&b| b == b';')
        .filter_map(|part| {
            let part = part.trim_ascii();
            if part.is_empty() {
                return None;
            }
            let (name, value) = match part.iter().position(|&b| b == b'=') {
                Some(eq) => (
                    part[..eq].trim_ascii(),
                    Some(String::from_utf8_lossy(part[eq + 1..].trim_ascii()).into_owned()),
                ),
                None => (part, None),
            };
            Some(ChunkExt {
                name: String::from_utf8_lossy(name).into_owned(),
                value,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(input: &str) -> (BodySink, DecodeState) {
        let mut sink = BodySink::new(usize::MAX);
        let mut coding = BodyCoding::chunked();
        let mut src = BytesMut::from(input);
        let state = coding.decode(&mut src, &mut sink).unwrap();
        (sink, state)
    }

    #[test]
    fn decodes_single_chunk() {
        let (sink, state) = decode_all("10\r\n1234567890abcdef\r\n0\r\n\r\n");
        assert_eq!(state, DecodeState::Complete);
        assert_eq!(&sink.body[..], b"1234567890abcdef");
        assert_eq!(sink.chunks.len(), 1);
        assert_eq!((sink.chunks[0].offset, sink.chunks[0].len), (0, 16));
        assert!(sink.trailers.is_empty());
    }

    #[test]
    fn records_chunk_infos_per_chunk() {
        // "Hello," + " " + "World!"
        let (sink, state) = decode_all("6\r\nHello,\r\n1\r\n \r\n6\r\nWorld!\r\n0\r\n\r\n");
        assert_eq!(state, DecodeState::Complete);
        assert_eq!(&sink.body[..], b"Hello, World!");
        let spans = sink
            .chunks
            .iter()
            .map(|c| (c.offset, c.len))
            .collect::<Vec<_>>();
        assert_eq!(spans, vec![(0, 6), (6, 1), (7, 6)]);
        assert!(sink.trailers.is_empty());
    }

    #[test]
    fn captures_trailing_fields() {
        let (sink, state) =
            decode_all("6\r\nHello,\r\n0\r\nHeader-1: Value-1\r\nHeader-2: Value-2\r\n\r\n");
        assert_eq!(state, DecodeState::Complete);
        assert_eq!(sink.trailers.len(), 2);
        assert_eq!(sink.trailers.get("header-1").unwrap(), "Value-1");
        assert_eq!(sink.trailers.get("header-2").unwrap(), "Value-2");
    }

    #[test]
    fn captures_chunk_extensions() {
        let (sink, state) = decode_all("5;ext name=value\r\nhello\r\n0\r\n\r\n");
        assert_eq!(state, DecodeState::Complete);
        let ext = &sink.chunks[0].ext;
        assert_eq!(ext.len(), 2);
        assert_eq!(ext[0].name, "ext");
        assert_eq!(ext[0].value, None);
        assert_eq!(ext[1].name, "name");
        assert_eq!(ext[1].value.as_deref(), Some("value"));
    }

    #[test]
    fn line_scratch_is_left_empty_after_chunk_open() {
        let mut sink = BodySink::new(usize::MAX);
        let mut coding = BodyCoding::chunked();
        let mut src = BytesMut::from("3;a=b\r\nxyz\r\n");
        assert_eq!(coding.decode(&mut src, &mut sink).unwrap(), DecodeState::NeedMore);
        match coding {
            BodyCoding::Chunked(ref decoder) => assert!(decoder.line.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn split_input_across_reads() {
        let mut sink = BodySink::new(usize::MAX);
        let mut coding = BodyCoding::chunked();

        let full = "6\r\nHello,\r\n7\r\n World!\r\n0\r\n\r\n";
        for (i, chunk) in full.as_bytes().chunks(3).enumerate() {
            let mut src = BytesMut::from(chunk);
            let state = coding.decode(&mut src, &mut sink).unwrap();
            let last = (i + 1) * 3 >= full.len();
            assert_eq!(state == DecodeState::Complete, last, "at piece {i}");
        }
        assert_eq!(&sink.body[..], b"Hello, World!");
    }

    #[test]
    fn size_line_allows_trailing_whitespace() {
        let (sink, state) = decode_all("3  \r\nabc\r\n0\r\n\r\n");
        assert_eq!(state, DecodeState::Complete);
        assert_eq!(&sink.body[..], b"abc");
        assert_eq!((sink.chunks[0].offset, sink.chunks[0].len), (0, 3));
    }

    #[test]
    fn size_line_rejects_leading_whitespace() {
        let mut sink = BodySink::new(usize::MAX);
        let mut src = BytesMut::from("  3\r\nabc\r\n0\r\n\r\n");
        let err = BodyCoding::chunked().decode(&mut src, &mut sink).unwrap_err();
        assert!(matches!(err, ProtoError::Chunk(_)));
    }

    #[test]
    fn invalid_size_byte_is_rejected() {
        let mut sink = BodySink::new(usize::MAX);
        let mut src = BytesMut::from("X\r\n");
        let err = BodyCoding::chunked().decode(&mut src, &mut sink).unwrap_err();
        assert!(matches!(err, ProtoError::Chunk(_)));
    }

    #[test]
    fn size_overflow_is_rejected() {
        let mut sink = BodySink::new(usize::MAX);
        let mut src = BytesMut::from("f0000000000000003\r\n");
        let err = BodyCoding::chunked().decode(&mut src, &mut sink).unwrap_err();
        assert!(matches!(err, ProtoError::Chunk("chunk size overflow")));
    }

    #[test]
    fn newline_in_extension_is_rejected() {
        let mut sink = BodySink::new(usize::MAX);
        let mut src = BytesMut::from("1;reject\nnewlines\r\n");
        let err = BodyCoding::chunked().decode(&mut src, &mut sink).unwrap_err();
        assert!(matches!(err, ProtoError::Chunk(_)));
    }

    #[test]
    fn body_limit_is_enforced() {
        let mut sink = BodySink::new(4);
        let mut src = BytesMut::from("6\r\nHello,\r\n0\r\n\r\n");
        let err = BodyCoding::chunked().decode(&mut src, &mut sink).unwrap_err();
        assert!(matches!(err, ProtoError::BodyTooLarge));
    }

    #[test]
    fn length_coding_decodes_exactly() {
        let mut sink = BodySink::new(usize::MAX);
        let mut coding = BodyCoding::length(5);
        let mut src = BytesMut::from("helloworld");
        assert_eq!(coding.decode(&mut src, &mut sink).unwrap(), DecodeState::Complete);
        assert_eq!(&sink.body[..], b"hello");
        // pipelined bytes stay in the buffer.
        assert_eq!(&src[..], b"world");
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let mut coding = BodyCoding::length(5);
        assert!(coding.try_set(BodyCoding::chunked()).is_err());

        let mut coding = BodyCoding::eof();
        assert!(coding.try_set(BodyCoding::chunked()).is_ok());
    }
}
