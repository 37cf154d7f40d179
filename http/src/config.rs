//! runtime configuration for the http/1 engine.

use core::time::Duration;

/// Incoming message limits enforced while parsing.
///
/// Any violation aborts parsing of the offending request. When the head of the
/// request was readable an error response is written before the connection is
/// closed.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// maximum byte length of the request target.
    pub max_url_size: usize,
    /// maximum count of header fields in one request head.
    pub max_field_count: usize,
    /// maximum byte length of a single header field name.
    pub max_field_name_size: usize,
    /// maximum byte length of a single header field value.
    pub max_field_value_size: usize,
    /// maximum byte length of a request body after transfer decoding.
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_url_size: 8 * 1024,
            max_field_count: 64,
            max_field_name_size: 1024,
            max_field_value_size: 8 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Per-phase deadlines of a connection. A deadline of zero disables the timer
/// of that phase.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// time window for receiving the head of the next request. Covers both the
    /// keep-alive idle period and a partially received head.
    pub read_next_header: Duration,
    /// wall time a handler may take before producing the first piece of its
    /// response.
    pub handle_request: Duration,
    /// time window for a single write operation to complete.
    pub write_response: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_next_header: Duration::from_secs(60),
            handle_request: Duration::from_secs(10),
            write_response: Duration::from_secs(15),
        }
    }
}

/// Configuration of the per-connection engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// size of the read buffer backing one outstanding read. Also the upper
    /// bound of a request head.
    pub read_buf_size: usize,
    /// maximum count of requests read from one connection before the first
    /// response is written. Capacity of the response ordering ring.
    pub max_pipelined_requests: usize,
    pub limits: Limits,
    pub timeouts: Timeouts,
    /// tick duration of the coalesced timer sweep.
    pub tick: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_buf_size: 16 * 1024,
            max_pipelined_requests: 16,
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            tick: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size;
        self
    }

    /// # Panics:
    /// When receive 0 as pipeline capacity.
    pub fn max_pipelined_requests(mut self, count: usize) -> Self {
        assert_ne!(count, 0, "there must be room for at least one in-flight request");
        self.max_pipelined_requests = count;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}
