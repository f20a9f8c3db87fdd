//! Connection- and stream-level flow control (RFC 9000 Section 4).
//!
//! Both levels share the same two window halves: [`RecvWindow`] bounds what
//! the peer may send us and decides when to extend the advertised limit;
//! [`SendWindow`] tracks the peer's grant and whether we have run into it.
//! The receive window auto-extends once the application has consumed half of
//! it, which batches MAX_DATA / MAX_STREAM_DATA updates instead of emitting
//! one per read.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};

/// Receive-direction window: the limit we advertise to the peer.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    /// Current advertised limit.
    max_data: u64,

    /// Bytes the peer has claimed: the highest received offset for a
    /// stream, the sum of per-stream highest offsets for the connection.
    claimed: u64,

    /// Bytes the application has consumed.
    consumed: u64,

    /// Window size added on each extension.
    window: u64,

    /// A limit update should be sent even if the window did not grow
    /// (the peer told us it is blocked).
    update_forced: bool,
}

impl RecvWindow {
    pub fn new(initial_max: u64) -> Self {
        Self {
            max_data: initial_max,
            claimed: 0,
            consumed: 0,
            window: initial_max,
            update_forced: false,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn claimed(&self) -> u64 {
        self.claimed
    }

    /// Account for `delta` newly-claimed bytes. FLOW_CONTROL_ERROR if the
    /// peer overran the limit.
    pub fn claim(&mut self, delta: u64) -> Result<()> {
        let claimed = self.claimed.saturating_add(delta);
        if claimed > self.max_data {
            return Err(Error::FlowControlError);
        }
        self.claimed = claimed;
        Ok(())
    }

    /// Whether `delta` more bytes would overrun the limit.
    pub fn can_claim(&self, delta: u64) -> bool {
        self.claimed.saturating_add(delta) <= self.max_data
    }

    /// Account for bytes handed to the application.
    pub fn on_consumed(&mut self, n: u64) {
        self.consumed = self.consumed.saturating_add(n);
    }

    /// Peer reported itself blocked at our limit; force a limit frame out.
    pub fn force_update(&mut self) {
        self.update_forced = true;
    }

    /// Whether a limit-update frame should be emitted, extending the window
    /// when consumption has crossed its midpoint.
    pub fn wants_update(&self) -> bool {
        self.update_forced || self.max_data.saturating_sub(self.consumed) < self.window / 2
    }

    /// Commit to a limit update: slide the window ahead of what has been
    /// consumed and return the new limit to advertise.
    pub fn commit_update(&mut self) -> u64 {
        let new_max = self.consumed.saturating_add(self.window);
        self.max_data = self.max_data.max(new_max);
        self.update_forced = false;
        self.max_data
    }
}

/// Send-direction window: the limit the peer has granted us.
#[derive(Debug, Clone)]
pub struct SendWindow {
    /// Peer's advertised limit (absolute offset).
    max_data: u64,

    /// Bytes we have sent (highest offset committed to the wire).
    used: u64,

    /// We hit the limit and should tell the peer.
    blocked_pending: bool,
}

impl SendWindow {
    pub fn new(initial_max: u64) -> Self {
        Self {
            max_data: initial_max,
            used: 0,
            blocked_pending: false,
        }
    }

    pub fn max_data(&self) -> u64 {
        self.max_data
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Bytes still permitted by the peer's limit.
    pub fn available(&self) -> u64 {
        self.max_data.saturating_sub(self.used)
    }

    /// Consume up to `want` bytes of window, marking blocked if it ran dry.
    pub fn consume(&mut self, want: u64) -> u64 {
        let granted = want.min(self.available());
        self.used += granted;
        if granted < want {
            self.blocked_pending = true;
        }
        granted
    }

    /// Record that the limit blocked a send without consuming credit.
    pub fn mark_blocked(&mut self) {
        self.blocked_pending = true;
    }

    /// Peer raised the limit. Stale (smaller) limits are ignored.
    pub fn on_max_data(&mut self, limit: u64) {
        if limit > self.max_data {
            self.max_data = limit;
            self.blocked_pending = false;
        }
    }

    /// Take the pending blocked signal, to emit a *_BLOCKED frame carrying
    /// the limit we ran into.
    pub fn take_blocked(&mut self) -> Option<u64> {
        if !self.blocked_pending {
            return None;
        }
        self.blocked_pending = false;
        Some(self.max_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_window_enforces_limit() {
        let mut w = RecvWindow::new(100);
        w.claim(60).unwrap();
        assert!(w.can_claim(40));
        assert!(!w.can_claim(41));
        w.claim(40).unwrap();
        assert_eq!(w.claim(1).unwrap_err(), Error::FlowControlError);
        assert_eq!(w.claimed(), 100, "failed claim leaves the count alone");
    }

    #[test]
    fn test_recv_window_extends_at_half() {
        let mut w = RecvWindow::new(100);
        w.claim(60).unwrap();
        w.on_consumed(40);
        assert!(!w.wants_update(), "60 bytes of window still open");

        w.on_consumed(20);
        assert!(w.wants_update(), "only 40 < 50 left");
        assert_eq!(w.commit_update(), 160);
        assert!(!w.wants_update());
    }

    #[test]
    fn test_recv_window_forced_update() {
        let mut w = RecvWindow::new(100);
        assert!(!w.wants_update());
        w.force_update();
        assert!(w.wants_update());
        // The limit need not move, but the frame goes out.
        assert_eq!(w.commit_update(), 100);
        assert!(!w.wants_update());
    }

    #[test]
    fn test_send_window_blocks_and_reopens() {
        let mut w = SendWindow::new(10);
        assert_eq!(w.consume(6), 6);
        assert!(w.take_blocked().is_none());

        assert_eq!(w.consume(6), 4, "clamped to the limit");
        assert_eq!(w.take_blocked(), Some(10));
        assert!(w.take_blocked().is_none(), "signal is one-shot");

        w.on_max_data(20);
        assert_eq!(w.available(), 10);
        w.on_max_data(15); // stale update ignored
        assert_eq!(w.max_data(), 20);
    }
}
