/// Connection specific parse state carried across requests.
pub(crate) struct ParseContext {
    state: ContextState,
}

// A set of states for the request currently being parsed that outlive the
// request's ownership transfer to the handler.
struct ContextState(u8);

impl ContextState {
    // Enabled when the current connection is to be closed after the current
    // response is sent.
    const CLOSE: u8 = 0b_0001;
    // Enabled when the current request carries `Expect: 100-continue`.
    const EXPECT: u8 = 0b_0010;
    // Enabled when the current request is a HEAD request.
    const HEAD: u8 = 0b_0100;
    // Enabled when the current request asks for a protocol upgrade.
    const UPGRADE: u8 = 0b_1000;

    const fn new() -> Self {
        Self(0)
    }

    fn insert(&mut self, other: u8) {
        self.0 |= other;
    }

    fn remove(&mut self, other: u8) {
        self.0 &= !other;
    }

    const fn contains(&self, other: u8) -> bool {
        (self.0 & other) == other
    }
}

impl ParseContext {
    pub(crate) fn new() -> Self {
        Self {
            state: ContextState::new(),
        }
    }

    /// Reset per-request state. The close flag survives: once set it applies
    /// to the connection, not a single request.
    pub(crate) fn reset_request_state(&mut self) {
        let close = self.is_connection_closed();
        self.state = ContextState::new();
        if close {
            self.set_close();
        }
    }

    pub(crate) fn set_close(&mut self) {
        self.state.insert(ContextState::CLOSE)
    }

    pub(crate) fn remove_close(&mut self) {
        self.state.remove(ContextState::CLOSE)
    }

    pub(crate) fn set_expect_header(&mut self) {
        self.state.insert(ContextState::EXPECT)
    }

    pub(crate) fn set_head_method(&mut self) {
        self.state.insert(ContextState::HEAD)
    }

    pub(crate) fn set_upgrade(&mut self) {
        self.state.insert(ContextState::UPGRADE)
    }

    pub(crate) fn remove_upgrade(&mut self) {
        self.state.remove(ContextState::UPGRADE)
    }

    pub(crate) const fn is_connection_closed(&self) -> bool {
        self.state.contains(ContextState::CLOSE)
    }

    pub(crate) const fn is_expect_header(&self) -> bool {
        self.state.contains(ContextState::EXPECT)
    }

    pub(crate) const fn is_head_method(&self) -> bool {
        self.state.contains(ContextState::HEAD)
    }

    pub(crate) const fn is_upgrade(&self) -> bool {
        self.state.contains(ContextState::UPGRADE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn close_survives_request_reset() {
        let mut ctx = ParseContext::new();
        ctx.set_expect_header();
        ctx.set_close();

        ctx.reset_request_state();
        assert!(ctx.is_connection_closed());
        assert!(!ctx.is_expect_header());
    }
}
