//! listening acceptor with a pool of concurrent accept slots.

use std::{net::SocketAddr, rc::Rc};

use tokio::{net::TcpListener, sync::Notify, sync::watch};
use tracing::{info, trace, warn};

use crate::limiter::{AcceptorCallback, AdmissionControl};

/// Verdict of an [IpBlocker] on an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    Allow,
    Deny,
}

/// Pluggable inspection of accepted peers, invoked once per accepted socket.
pub trait IpBlocker {
    fn inspect(&self, addr: SocketAddr) -> Inspection;
}

impl<F> IpBlocker for F
where
    F: Fn(SocketAddr) -> Inspection,
{
    fn inspect(&self, addr: SocketAddr) -> Inspection {
        (self)(addr)
    }
}

/// Lifecycle notifications of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Closed,
    UpgradedToWebSocket,
}

/// Observer of connection lifecycle changes.
pub trait StateListener {
    fn state_changed(&self, conn_id: u64, addr: SocketAddr, state: ConnectionState);
}

/// Wakeup channels of the accept slots. This is the acceptor-side half of
/// the limiter duplex: both callbacks wake the slot's task, which then posts
/// the actual accept.
pub(crate) struct SlotTable {
    slots: Vec<Notify>,
}

impl SlotTable {
    pub(crate) fn new(count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, Notify::new);
        Self { slots }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) async fn wait(&self, index: usize) {
        self.slots[index].notified().await
    }
}

impl AcceptorCallback for SlotTable {
    fn call_accept_now(&self, index: usize) {
        self.slots[index].notify_one();
    }

    fn schedule_next_accept_attempt(&self, index: usize) {
        self.slots[index].notify_one();
    }
}

/// One accepted socket approved for connection construction.
pub(crate) struct Accepted {
    pub(crate) stream: tokio::net::TcpStream,
    pub(crate) addr: SocketAddr,
}

/// Protocol of one accept slot, looped until shutdown:
///
/// 1. ask the limiter for admission,
/// 2. wait for the slot wakeup (immediate or deferred),
/// 3. accept, inspect the peer, hand the socket to `construct`,
/// 4. re-enter 1.
pub(crate) async fn accept_loop<C>(
    index: usize,
    listener: Rc<TcpListener>,
    slots: Rc<SlotTable>,
    admission: Rc<dyn AdmissionControl>,
    blocker: Option<Rc<dyn IpBlocker>>,
    mut shutdown: watch::Receiver<bool>,
    construct: C,
) where
    C: Fn(Accepted),
{
    info!(target: "acceptor", "init accept #{index}");

    loop {
        admission.accept_next(index, &*slots);

        tokio::select! {
            _ = slots.wait(index) => {}
            _ = shutdown.changed() => return,
        }

        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => {
                admission.cancel_accept(&*slots);
                return;
            }
        };

        match accepted {
            Ok((stream, addr)) => {
                if let Some(ref blocker) = blocker {
                    if blocker.inspect(addr) == Inspection::Deny {
                        trace!(target: "acceptor", "peer {addr} denied by ip blocker");
                        drop(stream);
                        admission.cancel_accept(&*slots);
                        continue;
                    }
                }
                construct(Accepted { stream, addr });
            }
            Err(e) => {
                warn!(target: "acceptor", "accept on slot {index} failed: {e}");
                admission.cancel_accept(&*slots);
            }
        }
    }
}
