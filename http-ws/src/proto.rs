use core::fmt;

use tracing::error;

/// Frame operation codes of RFC 6455.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpCode {
    /// continuation of a fragmented message.
    Continue,
    /// text data frame.
    Text,
    /// binary data frame.
    Binary,
    /// close control frame.
    Close,
    /// ping control frame.
    Ping,
    /// pong control frame.
    Pong,
    /// an invalid opcode was received.
    Bad,
}

impl OpCode {
    /// Control opcodes occupy the `>= 0x8` range.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use OpCode::*;

        match self {
            Continue => write!(f, "CONTINUE"),
            Text => write!(f, "TEXT"),
            Binary => write!(f, "BINARY"),
            Close => write!(f, "CLOSE"),
            Ping => write!(f, "PING"),
            Pong => write!(f, "PONG"),
            Bad => write!(f, "BAD"),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            OpCode::Bad => {
                error!("attempted to convert an invalid opcode to u8. This is a bug.");
                // a close frame at least tears the connection down quickly.
                8
            }
        }
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> OpCode {
        match byte {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Bad,
        }
    }
}

/// Status code explaining why an endpoint closes the connection.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum CloseCode {
    /// the purpose of the connection has been fulfilled.
    Normal,
    /// the endpoint is going away, e.g. a server shutting down.
    Away,
    /// terminated due to a protocol error.
    Protocol,
    /// received a kind of data the endpoint can not accept.
    Unsupported,
    /// abnormal closure without a close frame.
    Abnormal,
    /// received data inconsistent with the message type, e.g. non-UTF-8
    /// bytes in a text message.
    Invalid,
    /// received a message violating the endpoint's policy.
    Policy,
    /// received a message too big to process.
    Size,
    /// the server did not negotiate a required extension.
    Extension,
    /// the server hit an unexpected condition.
    Error,
    /// the server is restarting.
    Restart,
    /// the server is overloaded; try again later.
    Again,
    #[doc(hidden)]
    Tls,
    #[doc(hidden)]
    Other(u16),
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            _ => CloseCode::Other(code),
        }
    }
}

/// Reason attached to a close frame.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct CloseReason {
    pub code: CloseCode,
    pub description: Option<String>,
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        CloseReason {
            code,
            description: None,
        }
    }
}

impl<T: Into<String>> From<(CloseCode, T)> for CloseReason {
    fn from(info: (CloseCode, T)) -> Self {
        CloseReason {
            code: info.0,
            description: Some(info.1.into()),
        }
    }
}

/// The GUID of the websocket handshake. https://tools.ietf.org/html/rfc6455#section-1.3
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Hash a `Sec-WebSocket-Key` header value into the accept token.
///
/// `base64(sha1(key ++ guid))` is always 28 bytes.
pub fn hash_key(key: &[u8]) -> [u8; 28] {
    let hash = {
        use sha1::Digest as _;

        let mut hasher = sha1::Sha1::new();

        hasher.update(key);
        hasher.update(WS_GUID);

        hasher.finalize()
    };

    let mut hash_b64 = [0; 28];
    let n = base64::engine::Engine::encode_slice(&base64::engine::general_purpose::STANDARD, &hash, &mut hash_b64)
        .expect("sha1 digest always fits the 28 byte base64 buffer");
    debug_assert_eq!(n, 28);

    hash_b64
}
