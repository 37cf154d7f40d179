//! per-operation deadline tracking.
//!
//! Two interchangeable implementations serve the same contract:
//!
//! - [TimerService], the default: a single periodic tick sweeps a table of
//!   `{key -> deadline, callback}` entries, so N armed deadlines cost one
//!   timer. Used for the read/handle phase timers of http connections.
//! - [Deadline] plus the [Timeout] combinator: one lazily-reset sleep bound
//!   to a single in-flight future. Used where the guarded operation is
//!   awaited in place, e.g. a write operation or a file transfer step.
//!
//! Cancellation races are resolved on the receiving side: every armed
//! instance carries a 32-bit tag and a fired callback is only honored while
//! its tag still matches the guard's current one. Late firings after cancel
//! or re-arm are no-ops.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, ready},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::{
    task::JoinHandle,
    time::{Instant, Sleep, interval, sleep_until},
};

/// The connection phase a timer guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ReadHeader,
    HandleRequest,
    WriteResponse,
}

/// Opaque id of a timer table entry: the owning connection plus the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub conn: u64,
    pub phase: Phase,
}

type TimerCallback = Box<dyn Fn(u32)>;

struct Entry {
    deadline: Instant,
    tag: u32,
    callback: TimerCallback,
}

#[derive(Default)]
struct Table {
    entries: HashMap<TimerKey, Entry>,
}

/// Coalesced tick timer. One periodic task sweeps all armed deadlines.
pub struct TimerService {
    table: Rc<RefCell<Table>>,
    handle: JoinHandle<()>,
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TimerService {
    /// Start the sweep task with the given tick duration.
    ///
    /// Must be called from within a tokio `LocalSet` context.
    pub fn start(tick: Duration) -> Self {
        let table = Rc::new(RefCell::new(Table::default()));
        let table_clone = Rc::clone(&table);

        let handle = tokio::task::spawn_local(async move {
            let mut tick = interval(tick);
            // the first tick of tokio interval completes immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                sweep(&table_clone);
            }
        });

        Self { table, handle }
    }

    /// Cancel the tick and drop all entries. Symmetric counterpart of
    /// [TimerService::start].
    pub fn stop(&self) {
        self.handle.abort();
        self.table.borrow_mut().entries.clear();
    }

    pub fn handle(&self) -> TimerHandle {
        TimerHandle(Rc::clone(&self.table))
    }
}

fn sweep(table: &Rc<RefCell<Table>>) {
    let now = Instant::now();

    // expired entries leave the table before any callback runs, so a callback
    // is free to schedule or cancel without disturbing the sweep.
    let fired = {
        let mut table = table.borrow_mut();
        let due = table
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>();

        due.into_iter()
            .filter_map(|key| table.entries.remove(&key))
            .collect::<Vec<_>>()
    };

    for entry in fired {
        (entry.callback)(entry.tag);
    }
}

/// Cheaply cloneable accessor to a [TimerService] table.
#[derive(Clone)]
pub struct TimerHandle(Rc<RefCell<Table>>);

impl TimerHandle {
    /// (Re)arm the entry under `key`. The latest call wins; the callback is
    /// delivered at most once per armed instance unless re-armed.
    pub fn schedule(&self, key: TimerKey, timeout: Duration, tag: u32, callback: impl Fn(u32) + 'static) {
        let entry = Entry {
            deadline: Instant::now() + timeout,
            tag,
            callback: Box::new(callback),
        };
        self.0.borrow_mut().entries.insert(key, entry);
    }

    pub fn cancel(&self, key: TimerKey) {
        self.0.borrow_mut().entries.remove(&key);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.borrow().entries.len()
    }
}

/// Guard owned by the party that armed a timer. Carries the monotonically
/// increasing tag deciding whether a delivered firing is still current.
pub struct TimerGuard {
    key: TimerKey,
    tag: Cell<u32>,
    timers: TimerHandle,
}

impl TimerGuard {
    pub fn new(timers: TimerHandle, conn: u64, phase: Phase) -> Self {
        Self {
            key: TimerKey { conn, phase },
            tag: Cell::new(0),
            timers,
        }
    }

    /// (Re)arm the guarded deadline. A zero timeout disables the phase and
    /// cancels any armed instance.
    pub fn arm(&self, timeout: Duration, callback: impl Fn(u32) + 'static) {
        let tag = self.tag.get().wrapping_add(1);
        self.tag.set(tag);
        if timeout.is_zero() {
            self.timers.cancel(self.key);
        } else {
            self.timers.schedule(self.key, timeout, tag, callback);
        }
    }

    pub fn cancel(&self) {
        // bump the tag so an already-fired callback in flight turns stale.
        self.tag.set(self.tag.get().wrapping_add(1));
        self.timers.cancel(self.key);
    }

    /// Whether a firing delivered with `tag` belongs to the currently armed
    /// instance.
    pub fn is_current(&self, tag: u32) -> bool {
        self.tag.get() == tag
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.timers.cancel(self.key);
    }
}

pin_project! {
    /// A deadline backed by a single sleep, lazily reset after the previous
    /// deadline was met.
    ///
    /// Updating the target is nearly free; only a poll observing an elapsed
    /// sleep whose target moved pays the reset.
    pub struct Deadline {
        #[pin]
        timer: Sleep,
        deadline: Instant,
    }
}

impl Deadline {
    #[inline]
    pub fn new(deadline: Instant) -> Self {
        Self {
            timer: sleep_until(deadline),
            deadline,
        }
    }

    /// Move the deadline without touching the underlying sleep.
    #[inline]
    pub fn update(self: Pin<&mut Self>, deadline: Instant) {
        *self.project().deadline = deadline;
    }

    #[inline]
    fn reset(self: Pin<&mut Self>) {
        let this = self.project();
        this.timer.reset(*this.deadline)
    }

    fn is_expired(&self) -> bool {
        self.timer.deadline() >= self.deadline
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().project();
        ready!(this.timer.poll(cx));

        if self.is_expired() {
            Poll::Ready(())
        } else {
            self.as_mut().reset();
            self.poll(cx)
        }
    }
}

/// Attach a [Deadline] to a future, resolving with `Err(())` when the
/// deadline elapses first.
pub trait Timeout: Sized {
    fn timeout(self, timer: Pin<&mut Deadline>) -> TimeoutFuture<'_, Self>;
}

impl<F> Timeout for F
where
    F: Future,
{
    fn timeout(self, timer: Pin<&mut Deadline>) -> TimeoutFuture<'_, Self> {
        TimeoutFuture { fut: self, timer }
    }
}

pin_project! {
    pub struct TimeoutFuture<'a, F> {
        #[pin]
        fut: F,
        timer: Pin<&'a mut Deadline>,
    }
}

impl<F: Future> Future for TimeoutFuture<'_, F> {
    type Output = Result<F::Output, ()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.fut.poll(cx) {
            Poll::Ready(res) => Poll::Ready(Ok(res)),
            Poll::Pending => this.timer.as_mut().poll(cx).map(Err),
        }
    }
}

#[cfg(test)]
mod test {
    use std::pin::pin;

    use super::*;

    async fn with_local<F: Future>(fut: F) -> F::Output {
        tokio::task::LocalSet::new().run_until(fut).await
    }

    #[tokio::test]
    async fn fires_once_after_deadline() {
        with_local(async {
            let service = TimerService::start(Duration::from_millis(5));
            let guard = TimerGuard::new(service.handle(), 1, Phase::ReadHeader);

            let fired = Rc::new(RefCell::new(Vec::new()));
            let fired_clone = fired.clone();
            guard.arm(Duration::from_millis(10), move |tag| {
                fired_clone.borrow_mut().push(tag)
            });

            tokio::time::sleep(Duration::from_millis(50)).await;

            let fired = fired.borrow();
            assert_eq!(fired.len(), 1);
            assert!(guard.is_current(fired[0]));
        })
        .await
    }

    #[tokio::test]
    async fn rearm_invalidates_previous_instance() {
        with_local(async {
            let service = TimerService::start(Duration::from_millis(5));
            let guard = TimerGuard::new(service.handle(), 1, Phase::HandleRequest);

            let fired = Rc::new(RefCell::new(Vec::new()));

            let fired_clone = fired.clone();
            guard.arm(Duration::from_millis(10), move |tag| {
                fired_clone.borrow_mut().push(tag)
            });

            // latest arm wins. only one entry exists per key, so at most one
            // callback can be delivered, and its tag is the re-armed one.
            let fired_clone = fired.clone();
            guard.arm(Duration::from_millis(20), move |tag| {
                fired_clone.borrow_mut().push(tag)
            });

            tokio::time::sleep(Duration::from_millis(60)).await;

            let fired = fired.borrow();
            assert_eq!(fired.len(), 1);
            assert!(guard.is_current(fired[0]));
        })
        .await
    }

    #[tokio::test]
    async fn cancel_turns_fired_instance_stale() {
        with_local(async {
            let service = TimerService::start(Duration::from_millis(5));
            let guard = TimerGuard::new(service.handle(), 2, Phase::WriteResponse);

            let fired = Rc::new(RefCell::new(Vec::new()));
            let fired_clone = fired.clone();
            guard.arm(Duration::from_millis(10), move |tag| {
                fired_clone.borrow_mut().push(tag)
            });
            guard.cancel();

            tokio::time::sleep(Duration::from_millis(40)).await;

            // either the entry was removed before the sweep, or a firing in
            // flight is recognizable as stale via its tag.
            for tag in fired.borrow().iter() {
                assert!(!guard.is_current(*tag));
            }
        })
        .await
    }

    #[tokio::test]
    async fn stop_drops_all_entries() {
        with_local(async {
            let service = TimerService::start(Duration::from_millis(5));
            let handle = service.handle();
            let guard = TimerGuard::new(service.handle(), 3, Phase::ReadHeader);
            guard.arm(Duration::from_secs(60), |_| {});
            assert_eq!(handle.len(), 1);

            service.stop();
            assert_eq!(handle.len(), 0);
        })
        .await
    }

    #[tokio::test]
    async fn deadline_timeout_elapses() {
        let mut deadline = pin!(Deadline::new(Instant::now() + Duration::from_millis(10)));
        let res = std::future::pending::<()>().timeout(deadline.as_mut()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn deadline_update_postpones() {
        let mut deadline = pin!(Deadline::new(Instant::now() + Duration::from_millis(10)));
        deadline.as_mut().update(Instant::now() + Duration::from_millis(40));

        let res = tokio::time::sleep(Duration::from_millis(20))
            .timeout(deadline.as_mut())
            .await;
        assert!(res.is_ok());
    }
}
