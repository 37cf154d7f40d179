//! per-connection engine driving parse, dispatch, response ordering and write.

use std::{
    collections::HashSet,
    mem,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::pin,
};

use bytes::BytesMut;
use http::StatusCode;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};
use tracing::{error, trace};

use crate::{
    buffer::{WritableItem, WriteGroup},
    config::ServerConfig,
    coordinator::{ConnectionAttr, ResponseCoordinator, ResponseFlags, ResponseParts},
    date::DateHandle,
    error::Error,
    output::send_group,
    request::Request,
    response::{Event, HandleResult, Handler, Responder},
    timer::{Deadline, Phase, Timeout, TimerGuard, TimerHandle},
};

use super::{
    codec::{BodyCoding, BodySink, DecodeState},
    context::ParseContext,
    decode::decode_head,
    encode,
};

/// The socket and buffered bytes of a connection whose final http response
/// carried a protocol upgrade.
pub struct Upgraded<Io> {
    pub io: Io,
    /// bytes received beyond the http stream, already belonging to the
    /// upgraded protocol.
    pub read_buf: BytesMut,
}

/// How a connection ended, short of an error.
pub enum Completion<Io> {
    /// connection closed, gracefully or after an error response.
    Closed,
    /// the socket switched protocols and leaves the http engine.
    Upgraded(Upgraded<Io>),
}

/// Run the http/1 engine on `io` until the connection closes or upgrades.
///
/// The handler is invoked synchronously per parsed request; its response
/// parts funnel back through the builder and leave the socket in request-id
/// order.
pub async fn run<Io, H>(
    io: Io,
    addr: SocketAddr,
    conn_id: u64,
    config: &ServerConfig,
    handler: &H,
    date: DateHandle,
    timers: TimerHandle,
) -> Result<Completion<Io>, Error>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    let (rd, wr) = tokio::io::split(io);
    let (tx, rx) = mpsc::unbounded_channel();

    let dispatcher = Dispatcher {
        rd,
        wr,
        addr,
        conn_id,
        config,
        handler,
        coordinator: ResponseCoordinator::new(config.max_pipelined_requests),
        ctx: ParseContext::new(),
        read_buf: BytesMut::with_capacity(config.read_buf_size),
        read_state: ReadState::Head,
        read_timer: TimerGuard::new(timers.clone(), conn_id, Phase::ReadHeader),
        handle_timer: TimerGuard::new(timers, conn_id, Phase::HandleRequest),
        read_timer_armed: false,
        awaiting_first: HashSet::new(),
        upgrade_id: None,
        upgrade_gate: None,
        continue_pending: false,
        peer_closed: false,
        date,
        tx,
        rx,
    };

    dispatcher.run().await
}

enum Done {
    Close,
    Upgrade,
}

enum ReadState {
    /// waiting for (more of) a request head.
    Head,
    /// head parsed; the body is being decoded into the sink.
    Body {
        head: super::RequestHead,
        coding: BodyCoding,
        sink: BodySink,
    },
}

struct Dispatcher<'a, Io, H> {
    rd: ReadHalf<Io>,
    wr: WriteHalf<Io>,
    addr: SocketAddr,
    conn_id: u64,
    config: &'a ServerConfig,
    handler: &'a H,
    coordinator: ResponseCoordinator,
    ctx: ParseContext,
    read_buf: BytesMut,
    read_state: ReadState,
    read_timer: TimerGuard,
    handle_timer: TimerGuard,
    read_timer_armed: bool,
    /// requests dispatched whose first response part has not arrived yet.
    awaiting_first: HashSet<u64>,
    /// request id whose final response hands the socket to an upgrade.
    upgrade_id: Option<u64>,
    /// request that asked for an upgrade and thereby paused head parsing
    /// until its response decides the protocol.
    upgrade_gate: Option<u64>,
    /// a `100 Continue` must be written before reading the request body.
    continue_pending: bool,
    peer_closed: bool,
    date: DateHandle,
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
}

impl<Io, H> Dispatcher<'_, Io, H>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    async fn run(mut self) -> Result<Completion<Io>, Error> {
        let res = self.drive().await;
        self.finish(res).await
    }

    async fn drive(&mut self) -> Result<Done, Error> {
        loop {
            // deliver queued response parts and timer firings first.
            while let Ok(ev) = self.rx.try_recv() {
                self.on_event(ev)?;
            }

            self.pump_output().await?;

            if self.coordinator.closed() {
                return Ok(Done::Close);
            }

            if let Some(id) = self.upgrade_id {
                if !self.coordinator.is_pending(id) && self.coordinator.is_empty() {
                    return Ok(Done::Upgrade);
                }
            }

            if self.advance_parse()? {
                // dispatched handlers may have queued response parts.
                continue;
            }

            if self.continue_pending {
                self.continue_pending = false;
                self.wr.write_all(encode::CONTINUE).await?;
                continue;
            }

            if self.peer_closed && self.coordinator.is_empty() {
                return Ok(Done::Close);
            }

            let can_read = self.can_read();
            self.sync_read_timer(can_read);

            tokio::select! {
                biased;
                ev = self.rx.recv() => {
                    let ev = ev.expect("dispatcher holds a sender, the channel can not close");
                    self.on_event(ev)?;
                }
                res = self.rd.read_buf(&mut self.read_buf), if can_read => {
                    if res? == 0 {
                        self.on_eof()?;
                    }
                }
            }
        }
    }

    /// Feed buffered bytes through head and body decoding, dispatching every
    /// completed request. Returns whether anything progressed.
    fn advance_parse(&mut self) -> Result<bool, Error> {
        let mut progressed = false;

        loop {
            match mem::replace(&mut self.read_state, ReadState::Head) {
                ReadState::Head => {
                    if !self.may_parse_next_head() || self.read_buf.is_empty() {
                        break;
                    }

                    let limits = &self.config.limits;
                    match decode_head(&mut self.ctx, limits, self.config.read_buf_size, &mut self.read_buf)? {
                        Some((head, coding)) => {
                            progressed = true;
                            if self.ctx.is_expect_header() && !coding.is_eof() {
                                self.continue_pending = true;
                            }
                            let sink = BodySink::new(limits.max_body_size);
                            self.read_state = ReadState::Body { head, coding, sink };
                        }
                        None => break,
                    }
                }
                ReadState::Body {
                    head,
                    mut coding,
                    mut sink,
                } => match coding.decode(&mut self.read_buf, &mut sink)? {
                    DecodeState::Complete => {
                        progressed = true;
                        let chunked = coding.is_chunked();
                        self.dispatch(head, sink, chunked)?;
                        // fresh window for the next message.
                        if self.read_timer_armed {
                            self.arm_read_timer();
                        }
                    }
                    DecodeState::NeedMore => {
                        self.read_state = ReadState::Body { head, coding, sink };
                        break;
                    }
                },
            }
        }

        Ok(progressed)
    }

    fn may_parse_next_head(&self) -> bool {
        self.upgrade_id.is_none()
            && self.upgrade_gate.is_none()
            && !self.ctx.is_connection_closed()
            && self.coordinator.is_able_to_accept()
    }

    fn can_read(&self) -> bool {
        if self.peer_closed {
            return false;
        }
        match self.read_state {
            ReadState::Body { .. } => true,
            ReadState::Head => self.may_parse_next_head(),
        }
    }

    fn dispatch(&mut self, head: super::RequestHead, sink: BodySink, chunked: bool) -> Result<(), Error> {
        let id = self.coordinator.register_new_request()?;

        let responder = Responder {
            tx: self.tx.clone(),
            conn_id: self.conn_id,
            req_id: id,
            version: head.version,
            keep_alive: !self.ctx.is_connection_closed(),
            head_request: self.ctx.is_head_method(),
            date: self.date.clone(),
        };
        let request = Request::from_parts(head, sink, chunked, responder, self.addr);

        if self.ctx.is_upgrade() {
            // bytes past an upgrade request belong to the next protocol.
            // parsing resumes only if the response declines the upgrade.
            self.upgrade_gate = Some(id);
        }

        self.awaiting_first.insert(id);
        self.arm_handle_timer();

        trace!(target: "h1_dispatcher", "connection {} dispatching request {}", self.conn_id, id);

        match catch_unwind(AssertUnwindSafe(|| self.handler.handle(request))) {
            Ok(HandleResult::Accepted) => Ok(()),
            Ok(HandleResult::Rejected) | Ok(HandleResult::NotHandled) => self.reject(id),
            Err(_) => {
                error!(target: "h1_dispatcher", "handler panicked, closing connection {}", self.conn_id);
                Err(Error::HandlerPanic)
            }
        }
    }

    #[cold]
    #[inline(never)]
    fn reject(&mut self, id: u64) -> Result<(), Error> {
        let head = encode::status_only(StatusCode::NOT_IMPLEMENTED, &self.date);

        let mut group = WriteGroup::new();
        group.set_status_line_size(head.len());
        group.push(WritableItem::Bytes(head.freeze()));

        self.settle_first_write(id);
        self.coordinator
            .append_response(id, ResponseFlags::final_parts(ConnectionAttr::Close), group)?;
        Ok(())
    }

    fn on_event(&mut self, ev: Event) -> Result<(), Error> {
        match ev {
            Event::Append {
                id,
                flags,
                upgrade,
                group,
            } => {
                self.settle_first_write(id);
                if upgrade {
                    self.upgrade_id = Some(id);
                } else if self.upgrade_gate == Some(id) && matches!(flags.parts, ResponseParts::Final) {
                    // the upgrade was declined; head parsing resumes.
                    self.upgrade_gate = None;
                    self.ctx.remove_upgrade();
                }
                self.coordinator.append_response(id, flags, group)?;
                Ok(())
            }
            Event::Timeout { phase, tag } => self.on_timeout(phase, tag),
        }
    }

    fn settle_first_write(&mut self, id: u64) {
        if self.awaiting_first.remove(&id) {
            if self.awaiting_first.is_empty() {
                self.handle_timer.cancel();
            } else {
                self.arm_handle_timer();
            }
        }
    }

    fn on_timeout(&mut self, phase: Phase, tag: u32) -> Result<(), Error> {
        let current = match phase {
            Phase::ReadHeader => self.read_timer.is_current(tag),
            Phase::HandleRequest => self.handle_timer.is_current(tag),
            // write deadlines are enforced in place around the write future.
            Phase::WriteResponse => false,
        };

        if !current {
            trace!(target: "h1_dispatcher", "stale {:?} timer firing ignored", phase);
            return Ok(());
        }

        match phase {
            Phase::ReadHeader => {
                if matches!(self.read_state, ReadState::Head) && self.read_buf.is_empty() {
                    Err(Error::KeepAliveExpire)
                } else {
                    Err(Error::RequestTimeout)
                }
            }
            phase => Err(Error::Timeout(phase)),
        }
    }

    fn arm_read_timer(&mut self) {
        let timeout = self.config.timeouts.read_next_header;
        let tx = self.tx.clone();
        self.read_timer.arm(timeout, move |tag| {
            let _ = tx.send(Event::Timeout {
                phase: Phase::ReadHeader,
                tag,
            });
        });
        self.read_timer_armed = !timeout.is_zero();
    }

    fn arm_handle_timer(&mut self) {
        let tx = self.tx.clone();
        self.handle_timer.arm(self.config.timeouts.handle_request, move |tag| {
            let _ = tx.send(Event::Timeout {
                phase: Phase::HandleRequest,
                tag,
            });
        });
    }

    fn sync_read_timer(&mut self, can_read: bool) {
        if can_read && !self.read_timer_armed {
            self.arm_read_timer();
        } else if !can_read && self.read_timer_armed {
            self.read_timer.cancel();
            self.read_timer_armed = false;
        }
    }

    fn on_eof(&mut self) -> Result<(), Error> {
        self.peer_closed = true;
        match self.read_state {
            // a clean end between messages. pending responses still flush.
            ReadState::Head if self.read_buf.is_empty() => {
                self.ctx.set_close();
                Ok(())
            }
            _ => Err(Error::Closed),
        }
    }

    /// Drain coordinator-ready groups into the socket, one write operation in
    /// flight at a time.
    async fn pump_output(&mut self) -> Result<(), Error> {
        loop {
            if self.coordinator.closed() {
                return Ok(());
            }
            let Some((group, id)) = self.coordinator.pop_ready_buffers()? else {
                return Ok(());
            };
            trace!(target: "h1_dispatcher", "connection {} writing group of request {}", self.conn_id, id);
            self.write_group(group).await?;
        }
    }

    async fn write_group(&mut self, group: WriteGroup) -> Result<(), Error> {
        let limit = self.config.timeouts.write_response;
        if limit.is_zero() {
            send_group(&mut self.wr, group).await?;
            return Ok(());
        }

        let mut deadline = pin!(Deadline::new(Instant::now() + limit));
        match send_group(&mut self.wr, group).timeout(deadline.as_mut()).await {
            Ok(res) => {
                res?;
                Ok(())
            }
            Err(()) => Err(Error::Timeout(Phase::WriteResponse)),
        }
    }

    async fn finish(mut self, res: Result<Done, Error>) -> Result<Completion<Io>, Error> {
        self.read_timer.cancel();
        self.handle_timer.cancel();

        match res {
            Ok(Done::Close) => {
                let _ = self.wr.shutdown().await;
                Ok(Completion::Closed)
            }
            Ok(Done::Upgrade) => {
                trace!(target: "h1_dispatcher", "connection {} leaves the http engine", self.conn_id);
                let io = self.rd.unsplit(self.wr);
                Ok(Completion::Upgraded(Upgraded {
                    io,
                    read_buf: self.read_buf,
                }))
            }
            Err(e) => {
                // queued output never reaches the wire; notify and tear down.
                self.coordinator.reset();
                self.try_error_response(&e).await;
                let _ = self.wr.shutdown().await;
                Err(e)
            }
        }
    }

    #[cold]
    #[inline(never)]
    async fn try_error_response(&mut self, e: &Error) {
        let status = match *e {
            Error::Proto(ref proto) => proto.status_code(),
            Error::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            _ => return,
        };
        trace!(target: "h1_dispatcher", "connection {} error response {} for {:?}", self.conn_id, status, e);
        let head = encode::status_only(status, &self.date);
        let _ = self.wr.write_all(&head).await;
    }
}
