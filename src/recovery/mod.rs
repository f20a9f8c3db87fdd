//! Loss detection and congestion control (RFC 9002).
//!
//! [`Recovery`] owns the RTT estimator, the congestion controller, and the
//! PTO machinery; the per-space in-flight maps live in the packet number
//! spaces themselves. ACK processing removes acknowledged packets, samples
//! RTT off the largest, feeds the congestion controller, then runs loss
//! detection over what remains.

#![forbid(unsafe_code)]

pub mod congestion;
pub mod rtt;

pub use congestion::NewReno;
pub use rtt::RttEstimator;

use crate::error::{Error, Result};
use crate::frames::AckFrame;
use crate::packet::{PacketNumberSpace, SentPacket};
use crate::types::{
    Epoch, Instant, DEFAULT_MAX_ACK_DELAY, PACKET_THRESHOLD, PERSISTENT_CONGESTION_THRESHOLD,
};
use core::time::Duration;

/// Result of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Packets newly acknowledged, for stream/crypto write completion.
    pub newly_acked: Vec<SentPacket>,

    /// Packets declared lost by this ACK, for retransmission.
    pub lost: Vec<SentPacket>,

    /// Send time of the largest newly-acked packet (anchors ECN congestion
    /// events).
    pub largest_acked_sent_time: Option<Instant>,
}

/// What to do when the loss-detection timer fires.
#[derive(Debug)]
pub enum TimerAction {
    /// Packets crossed the time threshold; retransmit their content.
    Lost(Epoch, Vec<SentPacket>),

    /// PTO expired: send up to `count` ack-eliciting probes in `epoch`.
    Probe { epoch: Epoch, count: u32 },

    None,
}

#[derive(Debug)]
pub struct Recovery {
    pub rtt: RttEstimator,
    pub cc: NewReno,

    /// Consecutive PTO expirations in the Application space.
    pto_count: u32,

    /// Consecutive PTO expirations driven by handshake spaces; kept apart
    /// so crypto retransmissions do not inflate the data-path backoff.
    crypto_count: u32,

    /// When the last PTO fired; an ACK for anything sent after this proves
    /// the timeout spurious and resets both counters.
    time_of_last_pto: Option<Instant>,

    /// Peer's max_ack_delay, once transport parameters arrive.
    max_ack_delay: Duration,
}

impl Default for Recovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Recovery {
    pub fn new() -> Self {
        Self {
            rtt: RttEstimator::default(),
            cc: NewReno::new(),
            pto_count: 0,
            crypto_count: 0,
            time_of_last_pto: None,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
        }
    }

    pub fn set_max_ack_delay(&mut self, d: Duration) {
        self.max_ack_delay = d;
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    /// PTO for one space: `srtt + max(4*rttvar, kGranularity)`, plus the
    /// peer's max_ack_delay in the Application space (RFC 9002 Section 6.2).
    pub fn pto(&self, epoch: Epoch) -> Duration {
        let mut pto = self.rtt.pto_base();
        if epoch == Epoch::Application {
            pto += self.max_ack_delay;
        }
        pto
    }

    fn backoff(&self, epoch: Epoch) -> u32 {
        let count = if epoch == Epoch::Application {
            self.pto_count
        } else {
            self.crypto_count
        };
        1u32 << count.min(16)
    }

    /// Record a transmitted packet.
    pub fn on_packet_sent(&mut self, space: &mut PacketNumberSpace, meta: SentPacket, now: Instant) {
        if meta.in_flight {
            self.cc.on_packet_sent(meta.size);
        }
        space.on_sent(meta, now);
    }

    /// Consume an ACK frame for `space` (RFC 9002 Section 6.1).
    ///
    /// Packet numbers already in the space's acked-or-lost set are skipped;
    /// an acknowledgement for a number that was never sent is a
    /// PROTOCOL_VIOLATION. Loss detection runs afterwards iff anything was
    /// newly acknowledged.
    pub fn on_ack_received(
        &mut self,
        space: &mut PacketNumberSpace,
        ack: &AckFrame,
        ack_delay_exponent: u64,
        now: Instant,
    ) -> Result<AckOutcome> {
        if ack.largest_acked >= space.next_unsent() {
            return Err(Error::ProtocolViolation);
        }

        let mut outcome = AckOutcome::default();
        for (lo, hi) in ack.blocks() {
            let pns: Vec<u64> = space.sent.range(lo..=hi).map(|(&pn, _)| pn).collect();
            for pn in pns {
                if space.acked_or_lost.contains(pn) {
                    continue;
                }
                let Some(meta) = space.sent.remove(&pn) else {
                    continue;
                };
                space.acked_or_lost.insert(pn);
                if space.largest_acked.map_or(true, |l| pn > l) {
                    space.largest_acked = Some(pn);
                }

                // RTT sample off the largest, ack-eliciting only.
                if pn == ack.largest_acked && meta.ack_eliciting {
                    if let Some(sample) = now.duration_since(meta.time_sent) {
                        let delay = ack.delay(ack_delay_exponent).min(self.max_ack_delay);
                        self.rtt.update(sample, delay);
                    }
                }
                if pn == ack.largest_acked {
                    outcome.largest_acked_sent_time = Some(meta.time_sent);
                }

                if meta.in_flight {
                    self.cc.on_packet_acked(meta.size, meta.time_sent);
                }

                // Stop re-acknowledging what this packet's ACK covered.
                if let Some(up_to) = meta.acked_up_to {
                    space.recv.remove_up_to(up_to);
                }

                // An ACK for anything sent after the last PTO fired proves
                // the timeout spurious.
                if self.time_of_last_pto.is_some_and(|t| meta.time_sent > t) {
                    self.pto_count = 0;
                    self.crypto_count = 0;
                    self.time_of_last_pto = None;
                }

                outcome.newly_acked.push(meta);
            }
        }

        if outcome.newly_acked.is_empty() {
            return Ok(outcome);
        }

        outcome.lost = self.detect_lost_packets(space, now);
        Ok(outcome)
    }

    /// Time- and packet-threshold loss detection (RFC 9002 Section 6.1).
    ///
    /// Declares lost every unacked packet below `largest_acked` that is
    /// either `kPacketThreshold` behind it or older than the loss delay;
    /// packets not yet over the threshold arm the space's loss timer.
    pub fn detect_lost_packets(
        &mut self,
        space: &mut PacketNumberSpace,
        now: Instant,
    ) -> Vec<SentPacket> {
        space.loss_time = None;
        let Some(largest_acked) = space.largest_acked else {
            return Vec::new();
        };

        let loss_delay = self.rtt.loss_delay();
        let mut lost = Vec::new();

        let candidates: Vec<u64> = space
            .sent
            .range(..largest_acked)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in candidates {
            let meta = &space.sent[&pn];
            let time_lost = meta.time_sent + loss_delay <= now;
            let count_lost = largest_acked - pn >= PACKET_THRESHOLD;
            if time_lost || count_lost {
                let meta = space.sent.remove(&pn).expect("candidate present");
                space.acked_or_lost.insert(pn);
                tracing::debug!(pn, epoch = ?space.epoch, "packet lost");
                lost.push(meta);
            } else {
                let deadline = meta.time_sent + loss_delay;
                if space.loss_time.map_or(true, |t| deadline < t) {
                    space.loss_time = Some(deadline);
                }
            }
        }

        let in_flight_lost: Vec<&SentPacket> = lost.iter().filter(|p| p.in_flight).collect();
        if let Some(latest_sent) = in_flight_lost.iter().map(|p| p.time_sent).max() {
            for p in &in_flight_lost {
                self.cc.on_packet_removed(p.size);
            }
            self.cc.on_congestion_event(latest_sent, now);
            self.check_persistent_congestion(&in_flight_lost);
        }
        lost
    }

    /// RFC 9002 Section 7.6: if consecutive ack-eliciting losses span more
    /// than `kPersistentCongestionThreshold` PTOs, collapse the window and
    /// restart RTT estimation from scratch.
    fn check_persistent_congestion(&mut self, lost: &[&SentPacket]) {
        if !self.rtt.has_sample() {
            return;
        }
        let eliciting: Vec<Instant> = lost
            .iter()
            .filter(|p| p.ack_eliciting)
            .map(|p| p.time_sent)
            .collect();
        let (Some(&first), Some(&last)) = (eliciting.iter().min(), eliciting.iter().max()) else {
            return;
        };
        let duration =
            (self.rtt.pto_base() + self.max_ack_delay) * PERSISTENT_CONGESTION_THRESHOLD;
        if last.saturating_duration_since(first) > duration {
            self.cc.on_persistent_congestion();
            self.rtt.reset();
        }
    }

    /// Earliest loss-detection deadline across the spaces: a pending loss
    /// timer if armed, otherwise the PTO of the oldest ack-eliciting packet
    /// in flight, with exponential backoff.
    pub fn loss_detection_timer(&self, spaces: &[PacketNumberSpace; 3]) -> Option<Instant> {
        if let Some(t) = spaces.iter().filter_map(|s| s.loss_time).min() {
            return Some(t);
        }
        spaces
            .iter()
            .filter(|s| s.has_in_flight())
            .filter_map(|s| {
                s.time_of_last_ack_eliciting
                    .map(|t| t + self.pto(s.epoch) * self.backoff(s.epoch))
            })
            .min()
    }

    /// Handle an expired loss-detection timer (RFC 9002 Section 6.2.1).
    pub fn on_loss_detection_timeout(
        &mut self,
        spaces: &mut [PacketNumberSpace; 3],
        now: Instant,
    ) -> TimerAction {
        // A due loss timer takes precedence over PTO.
        if let Some(epoch) = spaces
            .iter()
            .filter(|s| s.loss_time.is_some_and(|t| t <= now))
            .min_by_key(|s| s.loss_time)
            .map(|s| s.epoch)
        {
            let lost = self.detect_lost_packets(&mut spaces[epoch.index()], now);
            return TimerAction::Lost(epoch, lost);
        }

        // PTO: probe the earliest space holding ack-eliciting data.
        let Some(epoch) = spaces
            .iter()
            .filter(|s| s.has_in_flight() && s.time_of_last_ack_eliciting.is_some())
            .map(|s| s.epoch)
            .next()
        else {
            return TimerAction::None;
        };

        if epoch == Epoch::Application {
            self.pto_count += 1;
        } else {
            self.crypto_count += 1;
        }
        self.time_of_last_pto = Some(now);
        tracing::debug!(?epoch, pto_count = self.pto_count, crypto_count = self.crypto_count, "PTO fired");
        TimerAction::Probe { epoch, count: 2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::AckRange;
    use tinyvec::TinyVec;

    fn spaces() -> [PacketNumberSpace; 3] {
        [
            PacketNumberSpace::new(Epoch::Initial),
            PacketNumberSpace::new(Epoch::Handshake),
            PacketNumberSpace::new(Epoch::Application),
        ]
    }

    fn sent(pn: u64, at: Instant) -> SentPacket {
        let mut meta = SentPacket::new(pn, at, 1200);
        meta.ack_eliciting = true;
        meta.in_flight = true;
        meta
    }

    fn ack(largest: u64, first_range: u64) -> AckFrame {
        AckFrame {
            largest_acked: largest,
            ack_delay: 0,
            first_range,
            ranges: TinyVec::new(),
            ecn: None,
        }
    }

    fn send_n(rec: &mut Recovery, space: &mut PacketNumberSpace, n: u64, t0: Instant) {
        for pn in 0..n {
            assert_eq!(space.next_packet_number(), pn);
            rec.on_packet_sent(space, sent(pn, t0), t0);
        }
    }

    #[test]
    fn test_ack_updates_rtt_and_cc() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 1, t0);
        assert_eq!(rec.cc.bytes_in_flight(), 1200);

        let now = Instant::from_millis(100);
        let out = rec.on_ack_received(&mut sp[2], &ack(0, 0), 3, now).unwrap();
        assert_eq!(out.newly_acked.len(), 1);
        assert!(out.lost.is_empty());
        assert_eq!(rec.rtt.latest_rtt(), Duration::from_millis(100));
        assert_eq!(rec.cc.bytes_in_flight(), 0);
        assert_eq!(sp[2].largest_acked, Some(0));
    }

    #[test]
    fn test_ack_for_never_sent_is_violation() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 2, t0);

        let err = rec
            .on_ack_received(&mut sp[2], &ack(5, 0), 3, Instant::from_millis(1))
            .unwrap_err();
        assert_eq!(err, Error::ProtocolViolation);
    }

    #[test]
    fn test_duplicate_ack_is_idempotent() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 1, t0);

        let now = Instant::from_millis(50);
        let out = rec.on_ack_received(&mut sp[2], &ack(0, 0), 3, now).unwrap();
        assert_eq!(out.newly_acked.len(), 1);

        let out = rec.on_ack_received(&mut sp[2], &ack(0, 0), 3, now).unwrap();
        assert!(out.newly_acked.is_empty(), "second ACK acks nothing new");
    }

    #[test]
    fn test_packet_threshold_loss() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 4, t0);

        // ACK only pn 3: pn 0 is 3 behind and lost, 1 and 2 are not.
        let now = Instant::from_millis(30);
        let out = rec.on_ack_received(&mut sp[2], &ack(3, 0), 3, now).unwrap();
        assert_eq!(out.lost.len(), 1);
        assert_eq!(out.lost[0].packet_number, 0);
        assert!(sp[2].loss_time.is_some(), "1 and 2 arm the loss timer");
        assert!(sp[2].acked_or_lost.contains(0));
    }

    #[test]
    fn test_time_threshold_loss_via_timer() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 3, t0);

        let now = Instant::from_millis(100);
        let out = rec.on_ack_received(&mut sp[2], &ack(2, 0), 3, now).unwrap();
        assert!(out.lost.is_empty(), "pn 0,1 below packet threshold");
        let loss_time = sp[2].loss_time.expect("timer armed");

        // Fire the timer: both tracked packets exceed 9/8 * rtt age.
        match rec.on_loss_detection_timeout(&mut sp, loss_time) {
            TimerAction::Lost(epoch, lost) => {
                assert_eq!(epoch, Epoch::Application);
                let pns: Vec<u64> = lost.iter().map(|p| p.packet_number).collect();
                assert_eq!(pns, vec![0, 1]);
            }
            other => panic!("expected Lost, got {other:?}"),
        }
    }

    #[test]
    fn test_pto_backoff_and_spurious_rollback() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 1, t0);

        let deadline = rec.loss_detection_timer(&sp).expect("PTO armed");
        match rec.on_loss_detection_timeout(&mut sp, deadline) {
            TimerAction::Probe { epoch, count } => {
                assert_eq!(epoch, Epoch::Application);
                assert_eq!(count, 2);
            }
            other => panic!("expected Probe, got {other:?}"),
        }
        assert_eq!(rec.pto_count(), 1);

        // Backoff doubles the next deadline.
        let second = rec.loss_detection_timer(&sp).expect("still armed");
        assert!(second > deadline);

        // Send a probe after the PTO and have it acked: counters reset.
        let probe_time = deadline + Duration::from_millis(1);
        sp[2].next_packet_number();
        rec.on_packet_sent(&mut sp[2], sent(1, probe_time), probe_time);
        let out = rec
            .on_ack_received(&mut sp[2], &ack(1, 1), 3, probe_time + Duration::from_millis(30))
            .unwrap();
        assert_eq!(out.newly_acked.len(), 2, "first range covers both");
        assert_eq!(rec.pto_count(), 0);
    }

    #[test]
    fn test_crypto_count_separate_from_pto_count() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        sp[0].next_packet_number();
        rec.on_packet_sent(&mut sp[0], sent(0, t0), t0);

        let deadline = rec.loss_detection_timer(&sp).unwrap();
        match rec.on_loss_detection_timeout(&mut sp, deadline) {
            TimerAction::Probe { epoch, .. } => assert_eq!(epoch, Epoch::Initial),
            other => panic!("expected Probe, got {other:?}"),
        }
        assert_eq!(rec.pto_count(), 0, "handshake probes use crypto_count");
    }

    #[test]
    fn test_in_flight_invariant() {
        // bytes_in_flight always equals the sum over tracked in-flight
        // packets.
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 5, t0);
        assert_eq!(rec.cc.bytes_in_flight(), sp[2].bytes_in_flight());

        let now = Instant::from_millis(40);
        rec.on_ack_received(&mut sp[2], &ack(4, 1), 3, now).unwrap();
        assert_eq!(rec.cc.bytes_in_flight(), sp[2].bytes_in_flight());
    }

    #[test]
    fn test_ack_with_ranges_skips_gap() {
        let mut rec = Recovery::new();
        let mut sp = spaces();
        let t0 = Instant::from_millis(0);
        send_n(&mut rec, &mut sp[2], 10, t0);

        // Ack {[1,3],[5,5],[7,9]}.
        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
        ranges.push(AckRange { gap: 0, length: 0 });
        ranges.push(AckRange { gap: 0, length: 2 });
        let frame = AckFrame {
            largest_acked: 9,
            ack_delay: 0,
            first_range: 2,
            ranges,
            ecn: None,
        };
        let out = rec
            .on_ack_received(&mut sp[2], &frame, 3, Instant::from_millis(25))
            .unwrap();
        let mut pns: Vec<u64> = out.newly_acked.iter().map(|p| p.packet_number).collect();
        pns.sort_unstable();
        assert_eq!(pns, vec![1, 2, 3, 5, 7, 8, 9]);

        // 4 and 6 sit in the gaps: not acked, and (being within the packet
        // threshold of 9) declared lost along with 0.
        let lost_pns: Vec<u64> = out.lost.iter().map(|p| p.packet_number).collect();
        assert_eq!(lost_pns, vec![0, 4, 6]);
    }
}
