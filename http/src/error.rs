//! error types.

use core::fmt;

use std::io;

use crate::{coordinator::CoordinatorError, h1::ProtoError, timer::Phase};

/// Failure of a connection. Always terminates the affected connection only;
/// the listener keeps accepting.
pub enum Error {
    /// socket keep-alive window expired while waiting for the next request.
    KeepAliveExpire,
    /// socket failed to deliver a complete request head in the given time
    /// window.
    RequestTimeout,
    /// the phase guarded by the named timer did not finish in time.
    Timeout(Phase),
    /// peer closed the connection.
    Closed,
    /// socket and/or runtime error. terminates the connection right away.
    Io(io::Error),
    /// http/1 protocol error. transformed into an error response when the
    /// output buffer still permits, then the connection is closed.
    Proto(ProtoError),
    /// response coordinator misuse. programmer error on the handler side.
    Coordinator(CoordinatorError),
    /// a handler panicked at the dispatch boundary.
    HandlerPanic,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::KeepAliveExpire => f.write_str("keep-alive time expired"),
            Self::RequestTimeout => f.write_str("request head timed out"),
            Self::Timeout(phase) => write!(f, "{phase:?} phase timed out"),
            Self::Closed => f.write_str("closed"),
            Self::Io(ref e) => fmt::Debug::fmt(e, f),
            Self::Proto(ref e) => fmt::Debug::fmt(e, f),
            Self::Coordinator(ref e) => fmt::Debug::fmt(e, f),
            Self::HandlerPanic => f.write_str("request handler panicked"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl From<CoordinatorError> for Error {
    fn from(e: CoordinatorError) -> Self {
        Self::Coordinator(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof | ErrorKind::WriteZero => Self::Closed,
            _ => Self::Io(e),
        }
    }
}
