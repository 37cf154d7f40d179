//! low resolution date time for reduced syscall when generating http date header.

use std::{
    cell::RefCell,
    fmt::{self, Write},
    rc::Rc,
    time::{Duration, SystemTime},
};

use httpdate::HttpDate;
use tokio::{
    task::JoinHandle,
    time::{Instant, interval},
};

/// The length of byte representation of [HttpDate].
pub const DATE_VALUE_LENGTH: usize = 29;

/// Service refreshing a cached date value periodically at 500 milliseconds interval.
///
/// Connections keep a [DateHandle] and read the cached value instead of asking
/// the OS for wall clock time on every response.
pub struct DateTimeService {
    state: Rc<RefCell<DateTimeState>>,
    handle: JoinHandle<()>,
}

impl Drop for DateTimeService {
    fn drop(&mut self) {
        // stop the timer update async task on drop.
        self.handle.abort();
    }
}

impl Default for DateTimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeService {
    /// Must be called from within a tokio `LocalSet` context.
    pub fn new() -> Self {
        let state = Rc::new(RefCell::new(DateTimeState::new()));
        let state_clone = Rc::clone(&state);
        let handle = tokio::task::spawn_local(async move {
            let mut interval = interval(Duration::from_millis(500));
            let state = &*state_clone;
            loop {
                let _ = interval.tick().await;
                *state.borrow_mut() = DateTimeState::new();
            }
        });

        Self { state, handle }
    }

    pub fn handle(&self) -> DateHandle {
        DateHandle(Rc::clone(&self.state))
    }
}

/// Cheaply cloneable accessor to the cached date value.
#[derive(Clone)]
pub struct DateHandle(Rc<RefCell<DateTimeState>>);

impl DateHandle {
    /// Construct a handle backed by plain OS system time. The value is not
    /// cached; every call performs a syscall. Useful for testing purpose.
    pub fn system_time() -> Self {
        Self(Rc::new(RefCell::new(DateTimeState::new())))
    }

    /// closure receives the byte slice representation of [HttpDate].
    #[inline]
    pub fn with_date<F, O>(&self, f: F) -> O
    where
        F: FnOnce(&[u8]) -> O,
    {
        let state = self.0.borrow();
        f(&state.date[..])
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.0.borrow().now
    }
}

/// byte representation of [HttpDate] paired with the [Instant] it was taken at.
#[derive(Copy, Clone)]
pub struct DateTimeState {
    pub date: [u8; DATE_VALUE_LENGTH],
    pub now: Instant,
}

impl Default for DateTimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl DateTimeState {
    pub fn new() -> Self {
        let mut state = Self {
            date: [0; DATE_VALUE_LENGTH],
            now: Instant::now(),
        };
        let _ = write!(state, "{}", HttpDate::from(SystemTime::now()));
        state
    }
}

impl Write for DateTimeState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.date[..].copy_from_slice(s.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn date_value_is_fixed_width() {
        let state = DateTimeState::new();
        // RFC 7231 IMF-fixdate is always 29 bytes.
        assert_eq!(state.date.len(), DATE_VALUE_LENGTH);
        assert!(state.date.ends_with(b"GMT"));
    }
}
