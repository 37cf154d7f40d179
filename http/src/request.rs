//! the immutable request object delivered to handlers.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{Extensions, HeaderMap, Method, StatusCode, Uri, Version};

use crate::{
    h1::{RequestHead, codec::BodySink},
    response::{OutputMode, Responder, ResponseBuilder},
};

/// One chunk extension parameter, `name` or `name=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkExt {
    pub name: String,
    pub value: Option<String>,
}

/// Description of one chunk of a chunked request body: where its bytes landed
/// in the decoded body and which extension parameters it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub offset: usize,
    pub len: usize,
    pub ext: Vec<ChunkExt>,
}

/// Present only when the incoming body used chunked transfer encoding.
#[derive(Debug, Clone)]
pub struct ChunkedInput {
    pub chunks: Vec<ChunkInfo>,
    pub trailers: HeaderMap,
}

/// An incoming request. Immutable after delivery to the handler, except for
/// the embedded user-data slot.
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    chunked_input: Option<ChunkedInput>,
    remote_addr: SocketAddr,
    extensions: Extensions,
    responder: Responder,
}

impl Request {
    pub(crate) fn from_parts(
        head: RequestHead,
        sink: BodySink,
        chunked: bool,
        responder: Responder,
        remote_addr: SocketAddr,
    ) -> Self {
        let chunked_input = chunked.then(|| ChunkedInput {
            chunks: sink.chunks,
            trailers: sink.trailers,
        });

        Self {
            method: head.method,
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            body: sink.body.freeze(),
            chunked_input,
            remote_addr,
            extensions: Extensions::new(),
            responder,
        }
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target.
    #[inline]
    pub fn target(&self) -> &Uri {
        &self.uri
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The header field collection: case-insensitive keys, insertion order
    /// preserved, duplicates allowed.
    #[inline]
    pub fn header(&self) -> &HeaderMap {
        &self.headers
    }

    /// The complete body after transfer decoding.
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Chunked-input description, present when the body arrived with
    /// `Transfer-Encoding: chunked`.
    #[inline]
    pub fn chunked_input_info(&self) -> Option<&ChunkedInput> {
        self.chunked_input.as_ref()
    }

    /// Id of the connection the request arrived on.
    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.responder.conn_id
    }

    /// Id of the request, unique and monotonically increasing per connection.
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.responder.req_id
    }

    #[inline]
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the connection stays open after this request's response,
    /// barring an explicit close requested by the response itself.
    #[inline]
    pub fn should_keep_alive(&self) -> bool {
        self.responder.keep_alive
    }

    /// user-data slot.
    #[inline]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    #[inline]
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Create the response builder for this request.
    ///
    /// May be called before or after moving the request elsewhere; the
    /// builder carries everything it needs and can outlive the request.
    pub fn create_response(&self, status: StatusCode, mode: OutputMode) -> ResponseBuilder {
        ResponseBuilder::new(self.responder.clone(), status, mode)
    }
}
