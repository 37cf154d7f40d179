//! admission control: the parallel connection count limiter.
//!
//! The acceptor and the limiter form a duplex. Per socket slot the acceptor
//! asks [AdmissionControl::accept_next]; the limiter either calls
//! [AcceptorCallback::call_accept_now] back right away or parks the slot
//! index and releases it via [AcceptorCallback::schedule_next_accept_attempt]
//! once a connection goes away.

use std::{cell::RefCell, rc::Rc, sync::Mutex};

use tracing::trace;

/// Methods of the acceptor invoked by the limiter.
pub trait AcceptorCallback {
    /// An accept may be posted on the slot right now.
    fn call_accept_now(&self, index: usize);

    /// The slot was parked; a new accept attempt should be scheduled.
    fn schedule_next_accept_attempt(&self, index: usize);
}

/// Counters and the parked-slot stack of the limiter.
pub struct LimiterState {
    /// in-flight accept operations.
    pub active_accepts: usize,
    /// live connections.
    pub connections: usize,
    /// parked socket slot indices, LIFO.
    pub pending: Vec<usize>,
}

/// Interior mutability strategy guarding [LimiterState].
///
/// The limiter is the only cross-connection mutable state on the hot path;
/// single-threaded servers use the lock-free [LocalLock] variant, while
/// [SharedLock] carries a real mutex.
pub trait LimiterLock {
    fn new(state: LimiterState) -> Self;

    fn with<R>(&self, f: impl FnOnce(&mut LimiterState) -> R) -> R;
}

/// Mutex-backed lock for multi-threaded embeddings.
pub struct SharedLock(Mutex<LimiterState>);

impl LimiterLock for SharedLock {
    fn new(state: LimiterState) -> Self {
        Self(Mutex::new(state))
    }

    fn with<R>(&self, f: impl FnOnce(&mut LimiterState) -> R) -> R {
        let mut state = self.0.lock().unwrap();
        f(&mut state)
    }
}

/// Plain-cell lock for single-threaded mode.
pub struct LocalLock(RefCell<LimiterState>);

impl LimiterLock for LocalLock {
    fn new(state: LimiterState) -> Self {
        Self(RefCell::new(state))
    }

    fn with<R>(&self, f: impl FnOnce(&mut LimiterState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }
}

/// Limiter contract used by the acceptor and the lifetime monitors.
pub trait AdmissionControl {
    /// Either invoke [AcceptorCallback::call_accept_now] synchronously or
    /// park the slot for later.
    fn accept_next(&self, index: usize, acceptor: &dyn AcceptorCallback);

    /// An accepted socket turned into a live connection.
    fn increment_parallel_connections(&self);

    /// A live connection went away. May release a parked slot.
    fn decrement_parallel_connections(&self, acceptor: &dyn AcceptorCallback);

    /// An in-flight accept ended without producing a connection (accept
    /// error or blocked peer). May release a parked slot.
    fn cancel_accept(&self, acceptor: &dyn AcceptorCallback);
}

/// Counting limiter enforcing `active_accepts + connections <= max_parallel`.
pub struct CountLimiter<L: LimiterLock = SharedLock> {
    lock: L,
    max_parallel: usize,
}

impl<L: LimiterLock> CountLimiter<L> {
    pub fn new(max_parallel: usize, max_pending_slots: usize) -> Self {
        assert_ne!(max_parallel, 0, "connection limit must allow at least one connection");
        Self {
            lock: L::new(LimiterState {
                active_accepts: 0,
                connections: 0,
                // pre-reserved so parking a slot never allocates.
                pending: Vec::with_capacity(max_pending_slots),
            }),
            max_parallel,
        }
    }

    fn pop_pending(state: &mut LimiterState, max_parallel: usize) -> Option<usize> {
        if state.active_accepts + state.connections < max_parallel {
            state.pending.pop()
        } else {
            None
        }
    }
}

impl<L: LimiterLock> AdmissionControl for CountLimiter<L> {
    fn accept_next(&self, index: usize, acceptor: &dyn AcceptorCallback) {
        let accept_now = self.lock.with(|state| {
            if state.active_accepts + state.connections < self.max_parallel {
                state.active_accepts += 1;
                true
            } else {
                trace!(target: "limiter", "connection limit reached, parking slot {}", index);
                state.pending.push(index);
                false
            }
        });

        if accept_now {
            acceptor.call_accept_now(index);
        }
    }

    fn increment_parallel_connections(&self) {
        self.lock.with(|state| {
            debug_assert!(state.active_accepts > 0);
            state.active_accepts -= 1;
            state.connections += 1;
        });
    }

    fn decrement_parallel_connections(&self, acceptor: &dyn AcceptorCallback) {
        let to_activate = self.lock.with(|state| {
            debug_assert!(state.connections > 0);
            state.connections -= 1;
            Self::pop_pending(state, self.max_parallel)
        });

        if let Some(index) = to_activate {
            acceptor.schedule_next_accept_attempt(index);
        }
    }

    fn cancel_accept(&self, acceptor: &dyn AcceptorCallback) {
        let to_activate = self.lock.with(|state| {
            debug_assert!(state.active_accepts > 0);
            state.active_accepts -= 1;
            Self::pop_pending(state, self.max_parallel)
        });

        if let Some(index) = to_activate {
            acceptor.schedule_next_accept_attempt(index);
        }
    }
}

/// Limiter used when the connection count is unbounded. Parks nothing and
/// counts nothing.
pub struct NoopLimiter;

impl AdmissionControl for NoopLimiter {
    fn accept_next(&self, index: usize, acceptor: &dyn AcceptorCallback) {
        acceptor.call_accept_now(index);
    }

    fn increment_parallel_connections(&self) {}

    fn decrement_parallel_connections(&self, _: &dyn AcceptorCallback) {}

    fn cancel_accept(&self, _: &dyn AcceptorCallback) {}
}

/// RAII token binding a connection's lifetime to the limiter counts.
///
/// Construction turns an in-flight accept into a live connection; drop
/// releases the connection and may wake a parked accept slot.
pub struct LifetimeMonitor {
    admission: Rc<dyn AdmissionControl>,
    acceptor: Rc<dyn AcceptorCallback>,
}

impl LifetimeMonitor {
    pub fn new(admission: Rc<dyn AdmissionControl>, acceptor: Rc<dyn AcceptorCallback>) -> Self {
        admission.increment_parallel_connections();
        Self { admission, acceptor }
    }
}

impl Drop for LifetimeMonitor {
    fn drop(&mut self) {
        self.admission.decrement_parallel_connections(&*self.acceptor);
    }
}
