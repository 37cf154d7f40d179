//! response builder handed to request handlers.

use bytes::{Bytes, BytesMut};
use http::{
    StatusCode, Version,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

use crate::{
    buffer::{Notificator, WritableItem, WriteGroup},
    coordinator::{ConnectionAttr, ResponseFlags, ResponseParts},
    date::DateHandle,
    request::Request,
    timer::Phase,
};

use crate::h1::encode;

/// Verdict of a request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// the handler took responsibility for producing a response, now or
    /// later through a captured [ResponseBuilder].
    Accepted,
    /// the handler refuses the request. the engine responds with an error
    /// status and closes the connection.
    Rejected,
    /// no handler matched. treated the same as [HandleResult::Rejected].
    NotHandled,
}

/// The application facing request handler contract.
///
/// `handle` runs synchronously on the connection's task. A handler that needs
/// asynchrony creates its response builder, moves it into a spawned task and
/// returns [HandleResult::Accepted]; the connection serializes the re-entry.
pub trait Handler {
    fn handle(&self, req: Request) -> HandleResult;
}

impl<F> Handler for F
where
    F: Fn(Request) -> HandleResult,
{
    fn handle(&self, req: Request) -> HandleResult {
        (self)(req)
    }
}

/// How the body of a response is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// the engine buffers all body parts and emits `content-length`.
    Buffered,
    /// the caller controls framing through its own header fields and emits
    /// body parts as they are.
    UserControlledLength,
    /// body parts are emitted as `transfer-encoding: chunked` chunks.
    Chunked,
}

// messages funneled into the connection task.
pub(crate) enum Event {
    Append {
        id: u64,
        flags: ResponseFlags,
        upgrade: bool,
        group: WriteGroup,
    },
    Timeout {
        phase: Phase,
        tag: u32,
    },
}

/// Connection-side seed of response builders: the event funnel plus the
/// request scoped facts a builder needs.
#[derive(Clone)]
pub(crate) struct Responder {
    pub(crate) tx: UnboundedSender<Event>,
    pub(crate) conn_id: u64,
    pub(crate) req_id: u64,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) head_request: bool,
    pub(crate) date: DateHandle,
}

impl Responder {
    pub(crate) fn send(&self, flags: ResponseFlags, upgrade: bool, group: WriteGroup) {
        let sent = self.tx.send(Event::Append {
            id: self.req_id,
            flags,
            upgrade,
            group,
        });
        if sent.is_err() {
            // the connection is gone. the dropped group notifies its
            // after-write callback with the not-executed error.
            trace!(target: "response", "connection {} is gone, response parts dropped", self.conn_id);
        }
    }
}

/// Incremental builder of one response, bound to its request id.
///
/// Emitted output travels to the connection as write groups; the response
/// coordinator holds them until all earlier responses have left the socket.
pub struct ResponseBuilder {
    responder: Responder,
    status: StatusCode,
    headers: HeaderMap,
    mode: OutputMode,
    pending: Vec<WritableItem>,
    head_written: bool,
    close: bool,
    upgrade: bool,
}

impl ResponseBuilder {
    pub(crate) fn new(responder: Responder, status: StatusCode, mode: OutputMode) -> Self {
        let close = !responder.keep_alive;
        Self {
            responder,
            status,
            headers: HeaderMap::new(),
            mode,
            pending: Vec::new(),
            head_written: false,
            close,
            upgrade: false,
        }
    }

    /// Append one header field. An unparsable name or value is skipped with a
    /// warning; header emission itself can not fail.
    pub fn append_header<K, V>(&mut self, name: K, value: V) -> &mut Self
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
    {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!(target: "response", "invalid header field skipped"),
        }
        self
    }

    /// Ask for the connection to be closed once this response is on the wire.
    pub fn connection_close(&mut self) -> &mut Self {
        self.close = true;
        self
    }

    /// Replace the buffered body. Only meaningful in [OutputMode::Buffered].
    pub fn set_body(&mut self, item: impl Into<WritableItem>) -> &mut Self {
        debug_assert!(matches!(self.mode, OutputMode::Buffered));
        self.pending.clear();
        self.pending.push(item.into());
        self
    }

    /// Append one body item.
    pub fn append_body(&mut self, item: impl Into<WritableItem>) -> &mut Self {
        self.pending.push(item.into());
        self
    }

    /// Append one chunk of chunked output. Empty chunks are skipped: an empty
    /// chunk would terminate the chunked body prematurely.
    pub fn append_chunk(&mut self, bytes: impl Into<Bytes>) -> &mut Self {
        debug_assert!(matches!(self.mode, OutputMode::Chunked));
        let bytes = bytes.into();
        if bytes.is_empty() {
            return self;
        }
        self.pending.push(WritableItem::Bytes(encode::chunk_size_line(bytes.len())));
        self.pending.push(WritableItem::Bytes(bytes));
        self.pending.push(WritableItem::Static(encode::CRLF));
        self
    }

    /// Emit everything accumulated so far as a non-final write group.
    ///
    /// A no-op in [OutputMode::Buffered]: buffered responses leave as one
    /// group at [ResponseBuilder::done].
    pub fn flush(&mut self) {
        if matches!(self.mode, OutputMode::Buffered) {
            return;
        }
        let group = self.take_group(false);
        if group.is_empty() {
            return;
        }
        self.responder.send(ResponseFlags::not_final(self.connection_attr()), false, group);
    }

    /// Finalize the response.
    pub fn done(self) {
        self.finish(None)
    }

    /// Finalize the response; `notificator` fires once the final group has
    /// left the socket, or with an error when it never will.
    pub fn done_with(self, notificator: Notificator) {
        self.finish(Some(notificator))
    }

    /// Finalize the response and hand the socket over to a protocol upgrade
    /// once its bytes are on the wire.
    pub fn done_with_upgrade(mut self) {
        self.upgrade = true;
        self.finish(None)
    }

    fn connection_attr(&self) -> ConnectionAttr {
        if self.close {
            ConnectionAttr::Close
        } else {
            ConnectionAttr::KeepAlive
        }
    }

    fn finish(mut self, notificator: Option<Notificator>) {
        let mut group = self.take_group(true);
        if let Some(notificator) = notificator {
            group.set_notificator(notificator);
        }
        let flags = ResponseFlags {
            parts: ResponseParts::Final,
            connection: self.connection_attr(),
        };
        self.responder.send(flags, self.upgrade, group);
    }

    // build the next outgoing group from accumulated state. `last` appends
    // the chunked terminator and allows computing content-length.
    fn take_group(&mut self, last: bool) -> WriteGroup {
        let mut group = WriteGroup::new();

        if !self.head_written {
            let framing = match self.mode {
                OutputMode::Buffered => {
                    let len = self.pending.iter().map(WritableItem::size).sum();
                    encode::Framing::Length(len)
                }
                OutputMode::UserControlledLength => encode::Framing::CallerProvided,
                OutputMode::Chunked => encode::Framing::Chunked,
            };

            let mut head = BytesMut::with_capacity(256);
            encode::encode_head(
                &mut head,
                self.responder.version,
                self.status,
                &self.headers,
                framing,
                self.close,
                &self.responder.date,
            );
            self.headers.clear();
            group.set_status_line_size(head.len());
            group.push(WritableItem::Bytes(head.freeze()));
            self.head_written = true;
        }

        // responses to HEAD requests advertise the body without carrying it.
        if self.responder.head_request {
            self.pending.clear();
        }

        for item in self.pending.drain(..) {
            group.push(item);
        }

        if last && matches!(self.mode, OutputMode::Chunked) && !self.responder.head_request {
            group.push(WritableItem::Static(encode::CHUNK_EOF));
        }

        group
    }
}

