//! NewReno congestion control (RFC 9002 Section 7, Appendix B).

#![forbid(unsafe_code)]

use crate::types::{Instant, MAX_DATAGRAM_SIZE};

/// Initial congestion window in bytes (RFC 9002 Section 7.2).
pub const INITIAL_WINDOW: u64 = 14_720;

/// Floor for the congestion window: two full-size datagrams.
pub const MINIMUM_WINDOW: u64 = 2 * MAX_DATAGRAM_SIZE as u64;

/// NewReno with slow start, congestion avoidance and a recovery period.
///
/// A congestion event (loss or ECN-CE) halves the window once per recovery
/// period: events whose packets were sent before the period started are
/// already accounted for and change nothing.
#[derive(Debug, Clone)]
pub struct NewReno {
    cwnd: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    recovery_start: Option<Instant>,
    max_datagram_size: u64,
}

impl Default for NewReno {
    fn default() -> Self {
        Self::new()
    }
}

impl NewReno {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            max_datagram_size: MAX_DATAGRAM_SIZE as u64,
        }
    }

    pub fn window(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Bytes of ack-eliciting data the window still permits.
    pub fn available(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn in_recovery(&self, sent_time: Instant) -> bool {
        self.recovery_start.is_some_and(|start| sent_time <= start)
    }

    pub fn on_packet_sent(&mut self, size: usize) {
        self.bytes_in_flight += size as u64;
    }

    /// An in-flight packet was acknowledged. Window growth is skipped for
    /// packets sent during the current recovery period.
    pub fn on_packet_acked(&mut self, size: usize, sent_time: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);
        if self.in_recovery(sent_time) {
            return;
        }
        if self.in_slow_start() {
            self.cwnd += size as u64;
        } else {
            self.cwnd += self.max_datagram_size * size as u64 / self.cwnd;
        }
    }

    /// An in-flight packet left tracking without an ACK (lost, or its space
    /// was discarded).
    pub fn on_packet_removed(&mut self, size: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size as u64);
    }

    /// Loss or ECN-CE for a packet sent at `sent_time` (RFC 9002
    /// Section 7.6.1).
    pub fn on_congestion_event(&mut self, sent_time: Instant, now: Instant) {
        if self.in_recovery(sent_time) {
            return;
        }
        self.ssthresh = (self.cwnd / 2).max(MINIMUM_WINDOW);
        self.cwnd = self.ssthresh;
        self.recovery_start = Some(now);
        tracing::debug!(cwnd = self.cwnd, ssthresh = self.ssthresh, "congestion event");
    }

    /// Collapse to the minimum window after persistent congestion
    /// (RFC 9002 Section 7.6.2).
    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = MINIMUM_WINDOW;
        self.recovery_start = None;
        tracing::debug!("persistent congestion, window collapsed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_start_growth() {
        let mut cc = NewReno::new();
        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, Instant::from_millis(1));
        assert_eq!(cc.window(), INITIAL_WINDOW + 1200);
        assert_eq!(cc.bytes_in_flight(), 0);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn test_congestion_event_halves_window() {
        let mut cc = NewReno::new();
        let sent = Instant::from_millis(10);
        let now = Instant::from_millis(50);

        cc.on_congestion_event(sent, now);
        assert_eq!(cc.window(), INITIAL_WINDOW / 2);
        assert_eq!(cc.ssthresh(), INITIAL_WINDOW / 2);
        assert!(!cc.in_slow_start());

        // A second event for a packet sent before recovery began is a no-op.
        cc.on_congestion_event(Instant::from_millis(20), Instant::from_millis(60));
        assert_eq!(cc.window(), INITIAL_WINDOW / 2);

        // One sent after recovery started halves again.
        cc.on_congestion_event(Instant::from_millis(70), Instant::from_millis(80));
        assert_eq!(cc.window(), INITIAL_WINDOW / 4);
    }

    #[test]
    fn test_window_floor() {
        let mut cc = NewReno::new();
        let mut now = 10u64;
        for _ in 0..10 {
            cc.on_congestion_event(Instant::from_millis(now), Instant::from_millis(now + 1));
            now += 10;
        }
        assert_eq!(cc.window(), MINIMUM_WINDOW);
        assert!(cc.window() >= MINIMUM_WINDOW);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut cc = NewReno::new();
        cc.on_congestion_event(Instant::from_millis(1), Instant::from_millis(2));
        let base = cc.window();

        // Packet sent after recovery start: linear-ish growth.
        cc.on_packet_sent(1200);
        cc.on_packet_acked(1200, Instant::from_millis(5));
        assert_eq!(cc.window(), base + 1200 * 1200 / base);
    }

    #[test]
    fn test_no_growth_during_recovery() {
        let mut cc = NewReno::new();
        cc.on_packet_sent(1200);
        cc.on_congestion_event(Instant::from_millis(5), Instant::from_millis(10));
        let base = cc.window();

        // The acked packet was sent before recovery began.
        cc.on_packet_acked(1200, Instant::from_millis(5));
        assert_eq!(cc.window(), base);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_persistent_congestion_collapse() {
        let mut cc = NewReno::new();
        cc.on_persistent_congestion();
        assert_eq!(cc.window(), MINIMUM_WINDOW);
    }
}
