use bytes::{BufMut, Bytes, BytesMut};
use http::{
    HeaderMap, StatusCode, Version,
    header::{CONNECTION, CONTENT_LENGTH, DATE, TRANSFER_ENCODING},
};

use crate::date::DateHandle;

pub(crate) const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

pub(crate) const CRLF: &[u8] = b"\r\n";
pub(crate) const CHUNK_EOF: &[u8] = b"0\r\n\r\n";

/// How the body framing headers of a response are produced.
pub(crate) enum Framing {
    /// emit `content-length` computed by the engine.
    Length(u64),
    /// emit `transfer-encoding: chunked`.
    Chunked,
    /// the caller controls framing via its own header fields.
    CallerProvided,
}

impl Framing {
    fn put(self, buf: &mut BytesMut) {
        match self {
            Self::Length(size) => {
                let mut digits = itoa::Buffer::new();
                put_field(buf, b"content-length", digits.format(size).as_bytes());
            }
            Self::Chunked => put_field(buf, b"transfer-encoding", b"chunked"),
            Self::CallerProvided => {}
        }
    }
}

/// Serialize a response head: status line, the caller's header fields, then
/// the fields owned by the engine (framing, connection, date).
///
/// Caller fields are written one line per value; multi-value fields repeat
/// the field name, which is equivalent on the wire to a combined list value.
/// A caller-provided `content-length` or `transfer-encoding` takes over
/// framing; a caller-provided `date` suppresses the engine's.
pub(crate) fn encode_head(
    buf: &mut BytesMut,
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
    mut framing: Framing,
    close: bool,
    date: &DateHandle,
) {
    put_status_line(buf, version, status);

    let mut caller_date = false;

    for (name, value) in headers {
        if close && *name == CONNECTION {
            // replaced by the close variant written below.
            continue;
        }
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING {
            framing = Framing::CallerProvided;
        } else if *name == DATE {
            caller_date = true;
        }
        put_field(buf, name.as_str().as_bytes(), value.as_bytes());
    }

    framing.put(buf);

    if close {
        put_field(buf, b"connection", b"close");
    }

    if !caller_date {
        date.with_date(|value| put_field(buf, b"date", value));
    }

    buf.extend_from_slice(CRLF);
}

fn put_status_line(buf: &mut BytesMut, version: Version, status: StatusCode) {
    buf.extend_from_slice(match version {
        Version::HTTP_10 => b"HTTP/1.0 ",
        // anything beyond 1.1 never reaches this engine.
        _ => b"HTTP/1.1 ",
    });
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    // a reason MUST be written, as many parsers expect one.
    buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.extend_from_slice(CRLF);
}

fn put_field(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    buf.reserve(name.len() + value.len() + 4);
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(CRLF);
}

/// The `<hex-size>CRLF` line opening one chunk of chunked output.
pub(crate) fn chunk_size_line(len: usize) -> Bytes {
    Bytes::from(format!("{len:X}\r\n"))
}

/// Bare head of an engine-generated error response.
pub(crate) fn status_only(status: StatusCode, date: &DateHandle) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);
    encode_head(
        &mut buf,
        Version::HTTP_11,
        status,
        &HeaderMap::new(),
        Framing::Length(0),
        true,
        date,
    );
    buf
}
