//! websocket framing and the post-upgrade connection driver.
//!
//! The crate covers the protocol work a server needs after (and for) an
//! HTTP/1.1 Upgrade: handshake verification and accept-token computation,
//! the frame header parser/serializer, payload masking, incremental UTF-8
//! validation of text messages, a message codec enforcing the RFC 6455
//! framing rules, and a connection driver that speaks the protocol over any
//! async byte stream once the http engine hands the socket over.

#![forbid(unsafe_code)]

use http::{HeaderMap, Method, header};

mod codec;
mod error;
mod frame;
mod mask;
mod proto;
mod utf8;

pub mod connection;

pub use self::codec::{Codec, Item, Message};
pub use self::connection::{MessageHandler, Outbox, WsConfig};
pub use self::error::{HandshakeError, ProtocolError};
pub use self::frame::{FrameHeader, HeaderParser};
pub use self::proto::{CloseCode, CloseReason, OpCode, hash_key};
pub use self::utf8::Utf8Checker;

/// Verify an upgrade request and compute the `Sec-WebSocket-Accept` token
/// for the `101 Switching Protocols` response.
pub fn handshake(method: &Method, headers: &HeaderMap) -> Result<[u8; 28], HandshakeError> {
    let key = verify_handshake(method, headers)?;
    Ok(proto::hash_key(key))
}

/// Verify an upgrade request and return the `Sec-WebSocket-Key` value.
fn verify_handshake<'a>(method: &'a Method, headers: &'a HeaderMap) -> Result<&'a [u8], HandshakeError> {
    // websocket accepts only GET.
    if method != Method::GET {
        return Err(HandshakeError::GetMethodRequired);
    }

    let has_upgrade_hd = headers
        .get(header::UPGRADE)
        .and_then(|hdr| hdr.to_str().ok())
        .filter(|s| s.to_ascii_lowercase().contains("websocket"))
        .is_some();

    if !has_upgrade_hd {
        return Err(HandshakeError::NoWebsocketUpgrade);
    }

    let has_connection_hd = headers
        .get(header::CONNECTION)
        .and_then(|hdr| hdr.to_str().ok())
        .filter(|s| s.to_ascii_lowercase().contains("upgrade"))
        .is_some();

    if !has_connection_hd {
        return Err(HandshakeError::NoConnectionUpgrade);
    }

    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .ok_or(HandshakeError::NoVersionHeader)?;

    if version != "13" && version != "8" && version != "7" {
        return Err(HandshakeError::UnsupportedVersion);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::BadWebsocketKey)?;

    Ok(key.as_bytes())
}

#[cfg(test)]
mod tests {
    use http::Request;

    use super::*;

    #[test]
    fn handshake_requires_get() {
        let req = Request::builder().method(Method::POST).body(()).unwrap();
        assert_eq!(
            handshake(req.method(), req.headers()).unwrap_err(),
            HandshakeError::GetMethodRequired,
        );
    }

    #[test]
    fn handshake_requires_upgrade_headers() {
        let req = Request::builder().body(()).unwrap();
        assert_eq!(
            handshake(req.method(), req.headers()).unwrap_err(),
            HandshakeError::NoWebsocketUpgrade,
        );

        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert_eq!(
            handshake(req.method(), req.headers()).unwrap_err(),
            HandshakeError::NoConnectionUpgrade,
        );
    }

    #[test]
    fn handshake_requires_supported_version() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert_eq!(
            handshake(req.method(), req.headers()).unwrap_err(),
            HandshakeError::NoVersionHeader,
        );

        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header(header::SEC_WEBSOCKET_VERSION, "5")
            .body(())
            .unwrap();
        assert_eq!(
            handshake(req.method(), req.headers()).unwrap_err(),
            HandshakeError::UnsupportedVersion,
        );
    }

    #[test]
    fn handshake_requires_key() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap();
        assert_eq!(
            handshake(req.method(), req.headers()).unwrap_err(),
            HandshakeError::BadWebsocketKey,
        );
    }

    #[test]
    fn handshake_computes_accept_token() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "upgrade")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();

        let token = handshake(req.method(), req.headers()).unwrap();
        assert_eq!(&token, b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
