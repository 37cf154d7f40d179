//! coordinator keeping pipelined responses in request order on the wire.

use std::collections::VecDeque;

use crate::buffer::WriteGroup;

/// Completion marker of a response data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseParts {
    NotFinal,
    Final,
}

/// Connection handling requested by a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAttr {
    KeepAlive,
    Close,
}

/// Flags attached to every appended response part.
#[derive(Debug, Clone, Copy)]
pub struct ResponseFlags {
    pub parts: ResponseParts,
    pub connection: ConnectionAttr,
}

impl ResponseFlags {
    pub const fn not_final(connection: ConnectionAttr) -> Self {
        Self {
            parts: ResponseParts::NotFinal,
            connection,
        }
    }

    pub const fn final_parts(connection: ConnectionAttr) -> Self {
        Self {
            parts: ResponseParts::Final,
            connection,
        }
    }
}

/// Misuse of the coordinator by the caller. Always a programmer error; the
/// affected connection is closed.
#[derive(Debug, PartialEq, Eq)]
pub enum CoordinatorError {
    /// a connection-close response already left the coordinator.
    Closed,
    /// the ring has no room for another in-flight request.
    TableFull,
    /// no context is associated with the request id.
    UnknownRequest(u64),
    /// the response of the request is already marked complete.
    AlreadyFinal(u64),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Closed => f.write_str("response coordinator is closed"),
            Self::TableFull => f.write_str("response context table is full"),
            Self::UnknownRequest(id) => write!(f, "no context associated with request {id}"),
            Self::AlreadyFinal(id) => write!(f, "response of request {id} is marked as complete"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

/// A context for a single response: the per-request queue of pending write
/// groups plus the response flags last seen for the request.
#[derive(Default)]
struct ResponseContext {
    request_id: u64,
    write_groups: VecDeque<WriteGroup>,
    flags: Option<ResponseFlags>,
}

impl ResponseContext {
    fn reinit(&mut self, request_id: u64) {
        self.request_id = request_id;
        self.write_groups.clear();
        self.flags = None;
    }

    fn enqueue_group(&mut self, wg: WriteGroup) {
        // adjacent groups merge when the earlier one carries no notificator
        // and the later one no status line.
        match self.write_groups.back_mut() {
            Some(last) if !last.has_notificator() && wg.status_line_size() == 0 => last.merge(wg),
            _ => self.write_groups.push_back(wg),
        }
    }

    fn is_final(&self) -> bool {
        matches!(
            self.flags,
            Some(ResponseFlags {
                parts: ResponseParts::Final,
                ..
            })
        )
    }

    fn is_complete(&self) -> bool {
        self.write_groups.is_empty() && self.is_final()
    }
}

/// Fixed-capacity ring of [ResponseContext] addressed by request id.
///
/// Entries are populated in ascending id order; the entry of request id `i`
/// lives at `(first + (i - front_id)) % capacity`.
struct ContextTable {
    contexts: Vec<ResponseContext>,
    first: usize,
    len: usize,
}

impl ContextTable {
    fn new(capacity: usize) -> Self {
        assert_ne!(capacity, 0, "context table capacity must not be zero");
        let mut contexts = Vec::with_capacity(capacity);
        contexts.resize_with(capacity, ResponseContext::default);
        Self {
            contexts,
            first: 0,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.len == self.contexts.len()
    }

    fn front(&mut self) -> &mut ResponseContext {
        debug_assert!(!self.is_empty());
        &mut self.contexts[self.first]
    }

    fn front_id(&self) -> u64 {
        debug_assert!(!self.is_empty());
        self.contexts[self.first].request_id
    }

    fn back_id(&self) -> u64 {
        debug_assert!(!self.is_empty());
        let idx = (self.first + self.len - 1) % self.contexts.len();
        self.contexts[idx].request_id
    }

    fn get_by_req_id(&mut self, req_id: u64) -> Option<&mut ResponseContext> {
        if self.is_empty() || req_id < self.front_id() || req_id > self.back_id() {
            return None;
        }
        let distance = (req_id - self.front_id()) as usize;
        let idx = (self.first + distance) % self.contexts.len();
        Some(&mut self.contexts[idx])
    }

    fn push(&mut self, req_id: u64) -> Result<(), CoordinatorError> {
        if self.is_full() {
            return Err(CoordinatorError::TableFull);
        }
        let idx = (self.first + self.len) % self.contexts.len();
        self.contexts[idx].reinit(req_id);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) {
        debug_assert!(!self.is_empty());
        self.len -= 1;
        self.first += 1;
        if self.first == self.contexts.len() {
            self.first = 0;
        }
    }
}

/// Coordinator for the process of sending responses with respect to the http
/// pipelining technique and chunked transfer.
///
/// Keeps track of up to N pipelined requests, gathers the write groups of
/// their responses and yields ready-to-send groups strictly in request id
/// order.
pub struct ResponseCoordinator {
    request_id_counter: u64,
    /// set once a response carrying the connection-close attribute has been
    /// handed out; sticky.
    connection_close_occurred: bool,
    table: ContextTable,
}

impl ResponseCoordinator {
    pub fn new(max_pipelined_requests: usize) -> Self {
        Self {
            request_id_counter: 0,
            connection_close_occurred: false,
            table: ContextTable::new(max_pipelined_requests),
        }
    }

    pub fn closed(&self) -> bool {
        self.connection_close_occurred
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.table.is_full()
    }

    /// Check if it is possible to accept one more request.
    pub fn is_able_to_accept(&self) -> bool {
        !self.closed() && !self.is_full()
    }

    /// Whether a context for the request id is still tracked.
    pub fn is_pending(&mut self, req_id: u64) -> bool {
        self.table.get_by_req_id(req_id).is_some()
    }

    /// Reserve a response context for a new request and return its id.
    pub fn register_new_request(&mut self) -> Result<u64, CoordinatorError> {
        self.table.push(self.request_id_counter)?;
        let id = self.request_id_counter;
        self.request_id_counter += 1;
        Ok(id)
    }

    /// Add outgoing data for the specified request.
    pub fn append_response(
        &mut self,
        req_id: u64,
        flags: ResponseFlags,
        wg: WriteGroup,
    ) -> Result<(), CoordinatorError> {
        if self.closed() {
            return Err(CoordinatorError::Closed);
        }

        let ctx = self
            .table
            .get_by_req_id(req_id)
            .ok_or(CoordinatorError::UnknownRequest(req_id))?;

        if ctx.is_final() {
            return Err(CoordinatorError::AlreadyFinal(req_id));
        }

        ctx.flags = Some(flags);
        ctx.enqueue_group(wg);
        Ok(())
    }

    /// Extract the next group available for write, if any.
    ///
    /// Only groups of the oldest un-finalized request are eligible. When that
    /// request's queue drains and its response is final the head advances;
    /// a final response with the connection-close attribute closes the
    /// coordinator for good.
    pub fn pop_ready_buffers(&mut self) -> Result<Option<(WriteGroup, u64)>, CoordinatorError> {
        if self.closed() {
            return Err(CoordinatorError::Closed);
        }

        if self.table.is_empty() {
            return Ok(None);
        }

        let ctx = self.table.front();
        let Some(wg) = ctx.write_groups.pop_front() else {
            return Ok(None);
        };
        let req_id = ctx.request_id;

        if ctx.is_complete() {
            self.connection_close_occurred = matches!(
                ctx.flags,
                Some(ResponseFlags {
                    parts: ResponseParts::Final,
                    connection: ConnectionAttr::Close,
                })
            );
            self.table.pop();
        }

        Ok(Some((wg, req_id)))
    }

    /// Drop all contexts. Queued groups fire their after-write notificators
    /// with the write-not-executed error on the way out.
    pub fn reset(&mut self) {
        while !self.table.is_empty() {
            let ctx = self.table.front();
            while let Some(mut wg) = ctx.write_groups.pop_front() {
                wg.invoke_after_write(Err(crate::buffer::WriteError::NotExecuted));
            }
            self.table.pop();
        }
    }
}
