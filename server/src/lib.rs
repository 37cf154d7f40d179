//! listening server binding the quay http engine to tcp.
//!
//! The server owns the acceptor with its admission control and glues
//! accepted sockets to the per-connection http engine of `quay-http`; a
//! response finishing with a websocket upgrade hands the socket to the
//! `quay-ws` connection driver.
//!
//! The server is single-threaded by design: `run` must execute inside a
//! tokio [LocalSet](tokio::task::LocalSet) and pins every connection to it.
//! Run one server per worker thread to use more cores.

#![forbid(unsafe_code)]

pub mod acceptor;
pub mod limiter;

use std::{cell::Cell, io, net::SocketAddr, rc::Rc};

use quay_http::{
    ServerConfig,
    date::DateTimeService,
    h1::{self, Completion},
    response::Handler,
    timer::TimerService,
};
use quay_ws::{MessageHandler, WsConfig};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::{net::TcpListener, sync::watch, task::spawn_local};
use tracing::{error, info, trace};

use crate::{
    acceptor::{Accepted, ConnectionState, IpBlocker, SlotTable, StateListener, accept_loop},
    limiter::{AdmissionControl, CountLimiter, LifetimeMonitor, LocalLock, NoopLimiter},
};

pub use crate::acceptor::Inspection;

/// Per-connection websocket handler factory, invoked once per upgraded
/// connection.
pub type WsHandlerFactory = Rc<dyn Fn() -> Box<dyn MessageHandler>>;

/// Builder of a [Server].
pub struct Builder<H> {
    handler: H,
    backlog: u32,
    reuse_address: bool,
    nodelay: bool,
    keep_alive: bool,
    concurrent_accepts: usize,
    separate_accept_and_construct: bool,
    max_parallel_connections: usize,
    http: ServerConfig,
    ws: WsConfig,
    ws_handler: Option<WsHandlerFactory>,
    ip_blocker: Option<Rc<dyn IpBlocker>>,
    state_listener: Option<Rc<dyn StateListener>>,
    acceptor_options: Option<Box<dyn Fn(&Socket) -> io::Result<()>>>,
}

impl<H> Builder<H>
where
    H: Handler + 'static,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            backlog: 2048,
            reuse_address: true,
            nodelay: true,
            keep_alive: false,
            concurrent_accepts: 1,
            separate_accept_and_construct: false,
            max_parallel_connections: usize::MAX,
            http: ServerConfig::default(),
            ws: WsConfig::default(),
            ws_handler: None,
            ip_blocker: None,
            state_listener: None,
            acceptor_options: None,
        }
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, on: bool) -> Self {
        self.reuse_address = on;
        self
    }

    pub fn nodelay(mut self, on: bool) -> Self {
        self.nodelay = on;
        self
    }

    pub fn socket_keep_alive(mut self, on: bool) -> Self {
        self.keep_alive = on;
        self
    }

    /// Count of pre-allocated socket slots accepting in parallel.
    ///
    /// # Panics:
    /// When receive 0 as slot count.
    pub fn concurrent_accepts(mut self, count: usize) -> Self {
        assert_ne!(count, 0, "there must be at least one accept slot");
        self.concurrent_accepts = count;
        self
    }

    /// Defer connection construction to a separate task instead of
    /// constructing inline on the accept slot.
    pub fn separate_accept_and_construct(mut self, on: bool) -> Self {
        self.separate_accept_and_construct = on;
        self
    }

    /// Cap on `active accepts + live connections`. Unlimited by default.
    pub fn max_parallel_connections(mut self, max: usize) -> Self {
        self.max_parallel_connections = max;
        self
    }

    pub fn http_config(mut self, config: ServerConfig) -> Self {
        self.http = config;
        self
    }

    pub fn ws_config(mut self, config: WsConfig) -> Self {
        self.ws = config;
        self
    }

    /// Handler for connections upgraded to websocket.
    pub fn ws_handler(mut self, factory: WsHandlerFactory) -> Self {
        self.ws_handler = Some(factory);
        self
    }

    pub fn ip_blocker(mut self, blocker: Rc<dyn IpBlocker>) -> Self {
        self.ip_blocker = Some(blocker);
        self
    }

    pub fn state_listener(mut self, listener: Rc<dyn StateListener>) -> Self {
        self.state_listener = Some(listener);
        self
    }

    /// Callback applying additional options to the listening socket before
    /// it starts to listen.
    pub fn acceptor_options(mut self, setter: impl Fn(&Socket) -> io::Result<()> + 'static) -> Self {
        self.acceptor_options = Some(Box::new(setter));
        self
    }

    /// Bind the listening socket. Idempotent per builder: each call creates
    /// one independent listener.
    pub fn bind<A: std::net::ToSocketAddrs>(self, addr: A) -> io::Result<Server<H>> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "can not parse socket address"))?;

        let socket = if addr.is_ipv4() {
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?
        } else {
            Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?
        };
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(self.reuse_address)?;
        socket.set_keepalive(self.keep_alive)?;
        if let Some(ref setter) = self.acceptor_options {
            setter(&socket)?;
        }
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(self.backlog as _)?;

        let listener = TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;

        info!(target: "server", "server listening on {local_addr}");

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Server {
            builder: self,
            listener,
            local_addr,
            stop_tx,
            stop_rx,
        })
    }
}

/// Handle for stopping a running [Server] from elsewhere.
#[derive(Clone)]
pub struct ServerHandle {
    stop: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Stop accepting and wind the accept slots down. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A bound, not yet running server.
pub struct Server<H> {
    builder: Builder<H>,
    listener: TcpListener,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl<H> Server<H>
where
    H: Handler + 'static,
{
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: self.stop_tx.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Run the accept slots until [ServerHandle::stop]. Connections accepted
    /// before the stop keep running to completion.
    ///
    /// Must be called from within a tokio `LocalSet` context.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            builder,
            listener,
            local_addr,
            stop_tx,
            stop_rx,
        } = self;
        // the sender must outlive the accept slots: a dropped sender reads
        // as an immediate shutdown on every receiver.
        let _stop_tx = stop_tx;

        let date = DateTimeService::new();
        let timers = TimerService::start(builder.http.tick);

        let slot_count = builder.concurrent_accepts;
        let slots = Rc::new(SlotTable::new(slot_count));
        let listener = Rc::new(listener);

        let admission: Rc<dyn AdmissionControl> = if builder.max_parallel_connections == usize::MAX {
            Rc::new(NoopLimiter)
        } else {
            Rc::new(CountLimiter::<LocalLock>::new(
                builder.max_parallel_connections,
                slot_count,
            ))
        };

        let shared = Rc::new(ConnectionShared {
            handler: builder.handler,
            http: builder.http,
            ws: builder.ws,
            ws_handler: builder.ws_handler,
            state_listener: builder.state_listener,
            nodelay: builder.nodelay,
            date: date.handle(),
            timers: timers.handle(),
            next_conn_id: Cell::new(0),
        });

        let mut slot_tasks = Vec::with_capacity(slot_count);
        for index in 0..slots.len() {
            let separate = builder.separate_accept_and_construct;
            let shared = shared.clone();
            let admission_for_conn = admission.clone();
            let slots_for_conn = slots.clone();

            let construct = move |accepted: Accepted| {
                let monitor_parts = (admission_for_conn.clone(), slots_for_conn.clone());
                let shared = shared.clone();
                if separate {
                    // construction posted to its own task; the accept slot
                    // turns around immediately.
                    spawn_local(async move {
                        let monitor = LifetimeMonitor::new(monitor_parts.0, monitor_parts.1);
                        serve_connection(accepted, shared, monitor).await;
                    });
                } else {
                    let monitor = LifetimeMonitor::new(monitor_parts.0, monitor_parts.1);
                    spawn_local(serve_connection(accepted, shared, monitor));
                }
            };

            slot_tasks.push(spawn_local(accept_loop(
                index,
                listener.clone(),
                slots.clone(),
                admission.clone(),
                builder.ip_blocker.clone(),
                stop_rx.clone(),
                construct,
            )));
        }

        for task in slot_tasks {
            let _ = task.await;
        }

        timers.stop();
        info!(target: "server", "server on {local_addr} stopped accepting");
        Ok(())
    }
}

// connection-scoped context shared by all connections of one server.
struct ConnectionShared<H> {
    handler: H,
    http: ServerConfig,
    ws: WsConfig,
    ws_handler: Option<WsHandlerFactory>,
    state_listener: Option<Rc<dyn StateListener>>,
    nodelay: bool,
    date: quay_http::date::DateHandle,
    timers: quay_http::timer::TimerHandle,
    next_conn_id: Cell<u64>,
}

impl<H> ConnectionShared<H> {
    fn notify(&self, conn_id: u64, addr: SocketAddr, state: ConnectionState) {
        if let Some(ref listener) = self.state_listener {
            listener.state_changed(conn_id, addr, state);
        }
    }
}

async fn serve_connection<H>(accepted: Accepted, shared: Rc<ConnectionShared<H>>, monitor: LifetimeMonitor)
where
    H: Handler + 'static,
{
    let Accepted { stream, addr } = accepted;
    // the monitor stays alive for the whole connection; its drop releases
    // the admission count.
    let _monitor = monitor;

    if shared.nodelay {
        let _ = stream.set_nodelay(true);
    }

    let conn_id = shared.next_conn_id.get();
    shared.next_conn_id.set(conn_id + 1);

    shared.notify(conn_id, addr, ConnectionState::Accepted);
    trace!(target: "server", "connection {conn_id} accepted from {addr}");

    let res = h1::dispatcher::run(
        stream,
        addr,
        conn_id,
        &shared.http,
        &shared.handler,
        shared.date.clone(),
        shared.timers.clone(),
    )
    .await;

    match res {
        Ok(Completion::Closed) => {}
        Ok(Completion::Upgraded(upgraded)) => {
            shared.notify(conn_id, addr, ConnectionState::UpgradedToWebSocket);
            match shared.ws_handler {
                Some(ref factory) => {
                    let mut handler = factory();
                    if let Err(e) =
                        quay_ws::connection::serve(upgraded.io, upgraded.read_buf, &mut *handler, &shared.ws).await
                    {
                        trace!(target: "server", "websocket connection {conn_id} ended: {e}");
                    }
                }
                None => {
                    error!(target: "server", "connection {conn_id} upgraded without a websocket handler");
                }
            }
        }
        Err(e) => {
            trace!(target: "server", "connection {conn_id} ended: {e:?}");
        }
    }

    shared.notify(conn_id, addr, ConnectionState::Closed);
}
