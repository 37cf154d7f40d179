use core::fmt;

use std::io;

use super::proto::{CloseCode, OpCode};

/// websocket protocol errors.
#[derive(Debug)]
pub enum ProtocolError {
    /// received an unmasked frame from a client.
    UnmaskedFrame,

    /// received a masked frame from a server.
    MaskedFrame,

    /// one of the rsv bits is set without a negotiated extension.
    RsvBitsSet,

    /// encountered an invalid opcode.
    BadOpCode,

    /// invalid control frame length.
    InvalidLength(usize),

    /// a control frame must not be fragmented.
    FragmentedControlFrame(OpCode),

    /// a payload reached the size limit.
    Overflow,

    /// continuation frame without a started message.
    ContinuationNotStarted,

    /// new data frame while a fragmented message is in progress.
    ContinuationStarted,

    /// invalid UTF-8 in a text message or close reason.
    InvalidUtf8,

    /// io error.
    Io(io::Error),
}

impl ProtocolError {
    /// Close code to report to the peer for this error.
    pub fn close_code(&self) -> CloseCode {
        match *self {
            Self::InvalidUtf8 => CloseCode::Invalid,
            Self::Overflow => CloseCode::Size,
            _ => CloseCode::Protocol,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// websocket handshake errors.
#[derive(PartialEq, Eq, Debug)]
pub enum HandshakeError {
    /// only the GET method is allowed.
    GetMethodRequired,

    /// the Upgrade header is not set to websocket.
    NoWebsocketUpgrade,

    /// the Connection header is not set to upgrade.
    NoConnectionUpgrade,

    /// the websocket version header is not set.
    NoVersionHeader,

    /// unsupported websocket version.
    UnsupportedVersion,

    /// the websocket key is not set or wrong.
    BadWebsocketKey,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for HandshakeError {}
