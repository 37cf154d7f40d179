use core::fmt;

use http::StatusCode;

/// http/1 protocol level error raised while parsing an incoming request.
///
/// Where possible the error is transformed into an error response before the
/// connection closes; [ProtoError::status_code] picks the wire status.
#[derive(Debug)]
pub enum ProtoError {
    /// invalid method token.
    Method,
    /// invalid request target.
    Uri,
    /// invalid or unsupported http version.
    Version,
    /// malformed header field.
    HeaderName,
    /// malformed header field value.
    HeaderValue,
    /// request head does not fit the read buffer.
    HeaderTooLarge,
    /// request target exceeds the configured limit.
    UrlTooLarge,
    /// header field count exceeds the configured limit.
    FieldCountExceeded,
    /// a header field name exceeds the configured limit.
    FieldNameTooLarge,
    /// a header field value exceeds the configured limit.
    FieldValueTooLarge,
    /// decoded body exceeds the configured limit.
    BodyTooLarge,
    /// malformed chunked transfer encoding.
    Chunk(&'static str),
    /// malformed trailing header section.
    Trailer(&'static str),
}

impl ProtoError {
    /// The response status the error maps to.
    pub fn status_code(&self) -> StatusCode {
        match *self {
            Self::HeaderTooLarge | Self::FieldCountExceeded | Self::FieldNameTooLarge | Self::FieldValueTooLarge => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            Self::UrlTooLarge => StatusCode::URI_TOO_LONG,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for ProtoError {}

impl From<httparse::Error> for ProtoError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::TooManyHeaders => Self::FieldCountExceeded,
            httparse::Error::Token | httparse::Error::HeaderName => Self::HeaderName,
            httparse::Error::HeaderValue => Self::HeaderValue,
            httparse::Error::Version => Self::Version,
            _ => Self::HeaderName,
        }
    }
}

impl From<http::method::InvalidMethod> for ProtoError {
    fn from(_: http::method::InvalidMethod) -> Self {
        Self::Method
    }
}

impl From<http::uri::InvalidUri> for ProtoError {
    fn from(_: http::uri::InvalidUri) -> Self {
        Self::Uri
    }
}
