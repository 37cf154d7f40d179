use bytes::{Buf, BytesMut};
use http::{
    Method, Uri, Version,
    header::{CONNECTION, CONTENT_LENGTH, EXPECT, HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING, UPGRADE},
};
use httparse::Status;

use crate::config::Limits;

use super::{codec::BodyCoding, context::ParseContext, error::ProtoError};

/// Parsed request head handed to dispatch together with its body coder.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

// byte ranges of one header field inside the frozen head slice.
struct FieldIndex {
    name: (usize, usize),
    value: (usize, usize),
}

/// Decode a request head from `buf`, enforcing the configured limits.
///
/// Returns `None` when the head is incomplete. `head_limit` bounds the bytes
/// a head may occupy in the read buffer before parsing is aborted.
pub(crate) fn decode_head(
    ctx: &mut ParseContext,
    limits: &Limits,
    head_limit: usize,
    buf: &mut BytesMut,
) -> Result<Option<(RequestHead, BodyCoding)>, ProtoError> {
    let mut headers = vec![httparse::EMPTY_HEADER; limits.max_field_count];
    let mut req = httparse::Request::new(&mut headers);

    let (len, method, version, path_range, field_indices) = match req.parse(buf)? {
        Status::Complete(len) => {
            let method = Method::from_bytes(req.method.ok_or(ProtoError::Method)?.as_bytes())?;

            let version = match req.version {
                Some(1) => Version::HTTP_11,
                Some(0) => Version::HTTP_10,
                _ => return Err(ProtoError::Version),
            };

            let path = req.path.ok_or(ProtoError::Uri)?;
            if path.len() > limits.max_url_size {
                return Err(ProtoError::UrlTooLarge);
            }

            // record byte ranges relative to the buffer start so the borrow of
            // `buf` can be dropped before splitting it.
            let base = buf.as_ptr() as usize;
            let path_head = path.as_ptr() as usize - base;
            let path_range = (path_head, path_head + path.len());

            let field_indices = req
                .headers
                .iter()
                .map(|h| {
                    if h.name.len() > limits.max_field_name_size {
                        return Err(ProtoError::FieldNameTooLarge);
                    }
                    if h.value.len() > limits.max_field_value_size {
                        return Err(ProtoError::FieldValueTooLarge);
                    }
                    let name_head = h.name.as_ptr() as usize - base;
                    let value_head = h.value.as_ptr() as usize - base;
                    Ok(FieldIndex {
                        name: (name_head, name_head + h.name.len()),
                        value: (value_head, value_head + h.value.len()),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            (len, method, version, path_range, field_indices)
        }
        Status::Partial => {
            return if buf.remaining() >= head_limit {
                Err(ProtoError::HeaderTooLarge)
            } else {
                Ok(None)
            };
        }
    };

    // new request: reset per-request parse state.
    ctx.reset_request_state();

    if method == Method::HEAD {
        ctx.set_head_method();
    }

    // http/1.0 defaults to close, 1.1 to keep-alive. a Connection header
    // below overrides either way.
    if version == Version::HTTP_10 {
        ctx.set_close();
    }

    let slice = buf.split_to(len).freeze();

    let uri = Uri::from_maybe_shared(slice.slice(path_range.0..path_range.1))?;

    let mut decoder = BodyCoding::eof();
    let mut headers = HeaderMap::with_capacity(field_indices.len());

    for idx in &field_indices {
        let name = HeaderName::from_bytes(&slice[idx.name.0..idx.name.1]).map_err(|_| ProtoError::HeaderName)?;
        let value = HeaderValue::from_maybe_shared(slice.slice(idx.value.0..idx.value.1))
            .map_err(|_| ProtoError::HeaderValue)?;

        match name {
            TRANSFER_ENCODING => {
                if version != Version::HTTP_11 {
                    return Err(ProtoError::HeaderName);
                }
                for val in value.to_str().map_err(|_| ProtoError::HeaderValue)?.split(',') {
                    if val.trim().eq_ignore_ascii_case("chunked") {
                        decoder.try_set(BodyCoding::chunked())?;
                    }
                }
            }
            CONTENT_LENGTH => {
                let len = parse_content_length(&value)?;
                decoder.try_set(BodyCoding::length(len))?;
            }
            CONNECTION => try_set_close_from_header(ctx, &value)?,
            EXPECT => {
                if !value.as_bytes().eq_ignore_ascii_case(b"100-continue") {
                    return Err(ProtoError::HeaderValue);
                }
                ctx.set_expect_header();
            }
            UPGRADE => {
                if version != Version::HTTP_11 {
                    return Err(ProtoError::HeaderName);
                }
                ctx.set_upgrade();
            }
            _ => {}
        }

        headers.append(name, value);
    }

    let head = RequestHead {
        method,
        uri,
        version,
        headers,
    };

    Ok(Some((head, decoder)))
}

fn try_set_close_from_header(ctx: &mut ParseContext, value: &HeaderValue) -> Result<(), ProtoError> {
    for val in value.to_str().map_err(|_| ProtoError::HeaderValue)?.split(',') {
        let val = val.trim();
        if val.eq_ignore_ascii_case("keep-alive") {
            ctx.remove_close();
        } else if val.eq_ignore_ascii_case("close") {
            ctx.set_close();
        }
    }
    Ok(())
}

fn parse_content_length(value: &HeaderValue) -> Result<u64, ProtoError> {
    value
        .to_str()
        .map_err(|_| ProtoError::HeaderValue)?
        .trim()
        .parse()
        .map_err(|_| ProtoError::HeaderValue)
}
