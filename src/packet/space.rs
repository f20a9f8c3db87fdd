//! Packet-number-space state (RFC 9000 Sections 12.3, 13.2).
//!
//! Each of the three spaces owns its send counter, the in-flight map of sent
//! packets, the interval set of received packet numbers awaiting
//! acknowledgement, the acked-or-lost set that makes ACK processing
//! idempotent, frame-type bitsets, and ECN counters.

#![forbid(unsafe_code)]

use crate::diet::Diet;
use crate::frames::{AckFrame, AckRange, EcnCounts, FrameTypeSet};
use crate::packet::meta::SentPacket;
use crate::types::{EcnCodepoint, Epoch, Instant, PacketNumber, DEFAULT_MAX_ACK_DELAY};
use std::collections::BTreeMap;
use tinyvec::TinyVec;

/// ACK-frequency policy: acknowledge immediately after this many
/// ack-eliciting packets (RFC 9000 Section 13.2.2).
const ACK_ELICITING_THRESHOLD: u8 = 2;

/// Upper bound on ranges per ACK frame, keeping the frame well inside one
/// datagram. Older ranges beyond the cap wait for the next ACK.
const MAX_ACK_RANGES: usize = 32;

/// One packet number space: Initial, Handshake or Application.
#[derive(Debug)]
pub struct PacketNumberSpace {
    pub epoch: Epoch,

    /// Next packet number to assign.
    next_pn: PacketNumber,

    /// Largest packet number the peer has acknowledged.
    pub largest_acked: Option<PacketNumber>,

    /// Largest packet number received from the peer.
    pub largest_received: Option<PacketNumber>,

    /// In-flight sent packets by number.
    pub sent: BTreeMap<PacketNumber, SentPacket>,

    /// Received packet numbers awaiting acknowledgement, with receive
    /// timestamps on the interval upper ends.
    pub recv: Diet,

    /// Packet numbers already acknowledged by the peer or declared lost.
    /// Consulted before processing an ACK'd number a second time.
    pub acked_or_lost: Diet,

    /// Frame types received since the last ACK we sent.
    pub rx_frames: FrameTypeSet,

    /// Frame types we have transmitted in this space.
    pub tx_frames: FrameTypeSet,

    /// ECN marks observed on received datagrams, reported in our ACK_ECN.
    pub ecn_counts: EcnCounts,

    /// High-water mark of the CE count the peer has reported to us.
    pub peer_ce_seen: u64,

    /// Ack-eliciting packets received since the last ACK was sent.
    ack_eliciting_since_ack: u8,

    /// An ACK must go out at the next transmit opportunity.
    immediate_ack: bool,

    /// Deadline for a delayed ACK.
    ack_alarm: Option<Instant>,

    /// When the last ack-eliciting packet was sent (arms the PTO).
    pub time_of_last_ack_eliciting: Option<Instant>,

    /// Earliest time a tracked packet crosses the loss time threshold.
    pub loss_time: Option<Instant>,

    /// Space abandoned (keys discarded); nothing is tracked or acked.
    pub discarded: bool,
}

impl PacketNumberSpace {
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            next_pn: 0,
            largest_acked: None,
            largest_received: None,
            sent: BTreeMap::new(),
            recv: Diet::new(),
            acked_or_lost: Diet::new(),
            rx_frames: FrameTypeSet::new(),
            tx_frames: FrameTypeSet::new(),
            ecn_counts: EcnCounts::default(),
            peer_ce_seen: 0,
            ack_eliciting_since_ack: 0,
            immediate_ack: false,
            ack_alarm: None,
            time_of_last_ack_eliciting: None,
            loss_time: None,
            discarded: false,
        }
    }

    /// Allocate the next packet number. Monotone per space.
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    /// Largest packet number assigned so far, if any.
    pub fn largest_sent(&self) -> Option<PacketNumber> {
        self.next_pn.checked_sub(1)
    }

    /// Packet numbers at or above this were never sent; an ACK naming one is
    /// a protocol violation.
    pub fn next_unsent(&self) -> PacketNumber {
        self.next_pn
    }

    /// Record a transmitted packet.
    pub fn on_sent(&mut self, meta: SentPacket, now: Instant) {
        if meta.ack_eliciting {
            self.time_of_last_ack_eliciting = Some(now);
        }
        self.tx_frames.union(meta.frames);
        self.sent.insert(meta.packet_number, meta);
    }

    /// Record a received packet number and schedule acknowledgement.
    ///
    /// Returns `false` for duplicates, which change no state and schedule
    /// nothing.
    pub fn on_received(
        &mut self,
        pn: PacketNumber,
        now: Instant,
        ack_eliciting: bool,
        ecn: Option<EcnCodepoint>,
        immediate: bool,
    ) -> bool {
        if self.discarded || self.recv.contains(pn) || self.acked_or_lost.contains(pn) {
            return false;
        }

        // A gap below an ack-eliciting packet means the peer may be waiting
        // on loss detection; acknowledge at once.
        let creates_gap = self
            .largest_received
            .is_some_and(|largest| pn > largest && pn != largest + 1);

        self.recv.insert_at(pn, now);
        if self.largest_received.map_or(true, |l| pn > l) {
            self.largest_received = Some(pn);
        }

        match ecn {
            Some(EcnCodepoint::Ect0) => self.ecn_counts.ect0 += 1,
            Some(EcnCodepoint::Ect1) => self.ecn_counts.ect1 += 1,
            Some(EcnCodepoint::Ce) => self.ecn_counts.ce += 1,
            None => {}
        }

        if ack_eliciting {
            self.ack_eliciting_since_ack = self.ack_eliciting_since_ack.saturating_add(1);
            if immediate
                || creates_gap
                || self.ack_eliciting_since_ack >= ACK_ELICITING_THRESHOLD
                || self.epoch != Epoch::Application
            {
                self.immediate_ack = true;
            } else if self.ack_alarm.is_none() {
                self.ack_alarm = Some(now + DEFAULT_MAX_ACK_DELAY);
            }
        } else if immediate {
            self.immediate_ack = true;
        }
        true
    }

    /// Force an immediate acknowledgement at the next transmit opportunity.
    pub fn request_immediate_ack(&mut self) {
        if !self.recv.is_empty() {
            self.immediate_ack = true;
        }
    }

    /// Whether an ACK should be included in a packet sent at `now`.
    pub fn ack_due(&self, now: Instant) -> bool {
        if self.discarded || self.recv.is_empty() {
            return false;
        }
        self.immediate_ack || self.ack_alarm.is_some_and(|t| now >= t)
    }

    /// Deadline of the delayed-ACK timer, if armed.
    pub fn ack_deadline(&self) -> Option<Instant> {
        if self.discarded || self.recv.is_empty() {
            return None;
        }
        if self.immediate_ack {
            // Already due; report an immediate deadline.
            return Some(Instant::ZERO);
        }
        self.ack_alarm
    }

    /// Build an ACK frame from the received set and clear the ACK alarm.
    ///
    /// The delay field is the time since the largest packet number arrived,
    /// in microseconds right-shifted by `ack_delay_exponent`. ACK_ECN is
    /// chosen iff any ECN counter is nonzero.
    pub fn build_ack(&mut self, now: Instant, ack_delay_exponent: u64) -> Option<AckFrame> {
        let largest = self.recv.max()?;

        let delay_micros = self
            .recv
            .timestamp(largest)
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        let ack_delay = delay_micros >> ack_delay_exponent;

        let mut iter = self.recv.iter().rev();
        let (first_lo, first_hi) = iter.next()?;
        let first_range = first_hi - first_lo;

        let mut ranges: TinyVec<[AckRange; 8]> = TinyVec::new();
        let mut prev_lo = first_lo;
        for (lo, hi) in iter {
            if ranges.len() == MAX_ACK_RANGES {
                break;
            }
            debug_assert!(prev_lo > hi + 1, "recv intervals must be disjoint");
            ranges.push(AckRange {
                gap: prev_lo - hi - 2,
                length: hi - lo,
            });
            prev_lo = lo;
        }

        self.immediate_ack = false;
        self.ack_alarm = None;
        self.ack_eliciting_since_ack = 0;
        self.rx_frames.clear();

        Some(AckFrame {
            largest_acked: largest,
            ack_delay,
            first_range,
            ranges,
            ecn: (!self.ecn_counts.is_zero()).then_some(self.ecn_counts),
        })
    }

    /// Look up an in-flight packet.
    pub fn find_sent(&self, pn: PacketNumber) -> Option<&SentPacket> {
        self.sent.get(&pn)
    }

    /// Ack-eliciting bytes currently tracked in this space.
    pub fn bytes_in_flight(&self) -> u64 {
        self.sent
            .values()
            .filter(|p| p.in_flight)
            .map(|p| p.size as u64)
            .sum()
    }

    pub fn has_in_flight(&self) -> bool {
        !self.discarded && self.sent.values().any(|p| p.in_flight)
    }

    /// Abandon the space when its keys are discarded. Returns the packets
    /// that were still tracked so congestion accounting can release them.
    pub fn discard(&mut self) -> Vec<SentPacket> {
        self.discarded = true;
        self.recv = Diet::new();
        self.ack_alarm = None;
        self.immediate_ack = false;
        self.loss_time = None;
        self.time_of_last_ack_eliciting = None;
        let sent = std::mem::take(&mut self.sent);
        sent.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> PacketNumberSpace {
        PacketNumberSpace::new(Epoch::Application)
    }

    #[test]
    fn test_packet_numbers_monotone() {
        let mut s = space();
        assert_eq!(s.next_packet_number(), 0);
        assert_eq!(s.next_packet_number(), 1);
        assert_eq!(s.largest_sent(), Some(1));
        assert_eq!(s.next_unsent(), 2);
    }

    #[test]
    fn test_delayed_ack_then_threshold() {
        let mut s = space();
        let t0 = Instant::from_millis(100);

        assert!(s.on_received(0, t0, true, None, false));
        assert!(!s.ack_due(t0));
        assert_eq!(s.ack_deadline(), Some(t0 + DEFAULT_MAX_ACK_DELAY));
        assert!(s.ack_due(t0 + DEFAULT_MAX_ACK_DELAY));

        // Second ack-eliciting packet forces an immediate ACK.
        assert!(s.on_received(1, t0, true, None, false));
        assert!(s.ack_due(t0));
    }

    #[test]
    fn test_gap_forces_immediate_ack() {
        let mut s = space();
        let t0 = Instant::from_millis(100);
        s.on_received(0, t0, true, None, false);
        s.build_ack(t0, 3).unwrap();

        s.on_received(3, t0, true, None, false);
        assert!(s.ack_due(t0), "gap must trigger an immediate ACK");
    }

    #[test]
    fn test_duplicate_changes_nothing() {
        let mut s = space();
        let t0 = Instant::from_millis(100);
        s.on_received(0, t0, true, None, false);
        s.build_ack(t0, 3).unwrap();

        assert!(!s.on_received(0, t0, true, None, false));
        assert!(!s.ack_due(t0));
        assert_eq!(s.recv.len(), 1);
    }

    #[test]
    fn test_build_ack_ranges_and_delay() {
        let mut s = space();
        let t0 = Instant::from_millis(100);
        for pn in [1, 2, 3, 5, 7, 8, 9] {
            s.on_received(pn, t0, true, None, false);
        }

        // 60ms after the largest arrived, exponent 3: 60000us >> 3 = 7500.
        let ack = s.build_ack(t0 + core::time::Duration::from_millis(60), 3).unwrap();
        assert_eq!(ack.largest_acked, 9);
        assert_eq!(ack.ack_delay, 7500);
        assert_eq!(ack.first_range, 2);
        assert_eq!(ack.ranges.len(), 2);
        assert_eq!(ack.ranges[0], AckRange { gap: 0, length: 0 });
        assert_eq!(ack.ranges[1], AckRange { gap: 0, length: 2 });
        assert!(ack.ecn.is_none());

        // Building the ACK clears the alarm state.
        assert!(!s.ack_due(t0 + core::time::Duration::from_secs(1)));
    }

    #[test]
    fn test_build_ack_reports_ecn() {
        let mut s = space();
        let t0 = Instant::from_millis(1);
        s.on_received(0, t0, true, Some(EcnCodepoint::Ect0), false);
        s.on_received(1, t0, true, Some(EcnCodepoint::Ce), false);
        let ack = s.build_ack(t0, 3).unwrap();
        let ecn = ack.ecn.expect("nonzero counters select ACK_ECN");
        assert_eq!((ecn.ect0, ecn.ect1, ecn.ce), (1, 0, 1));
    }

    #[test]
    fn test_initial_space_always_acks_immediately() {
        let mut s = PacketNumberSpace::new(Epoch::Initial);
        let t0 = Instant::from_millis(1);
        s.on_received(0, t0, true, None, false);
        assert!(s.ack_due(t0));
    }
}
