//! QUIC frame types (RFC 9000 Section 19).
//!
//! Frames are the unit of meaning inside a packet payload. Parsing lives in
//! [`parse`], serialization in [`encode`]; this module defines the typed
//! vocabulary plus the classification helpers (ACK-eliciting, epoch
//! permission, frame-type bitsets) the rest of the endpoint keys off.

#![forbid(unsafe_code)]

pub mod encode;
pub mod parse;

use crate::types::{Epoch, StreamId, VarInt};
use bytes::Bytes;
use core::time::Duration;
use tinyvec::TinyVec;

pub use encode::FrameSerializer;
pub use parse::FrameIter;

// ============================================================================
// Frame Type Constants (RFC 9000 Section 19)
// ============================================================================

pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_PING: u8 = 0x01;
pub const FRAME_TYPE_ACK: u8 = 0x02;
pub const FRAME_TYPE_ACK_ECN: u8 = 0x03;
pub const FRAME_TYPE_RESET_STREAM: u8 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u8 = 0x05;
pub const FRAME_TYPE_CRYPTO: u8 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u8 = 0x07;
pub const FRAME_TYPE_STREAM_BASE: u8 = 0x08; // 0x08-0x0f carry flag bits
pub const FRAME_TYPE_MAX_DATA: u8 = 0x10;
pub const FRAME_TYPE_MAX_STREAM_DATA: u8 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u8 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u8 = 0x13;
pub const FRAME_TYPE_DATA_BLOCKED: u8 = 0x14;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u8 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u8 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u8 = 0x17;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u8 = 0x18;
pub const FRAME_TYPE_RETIRE_CONNECTION_ID: u8 = 0x19;
pub const FRAME_TYPE_PATH_CHALLENGE: u8 = 0x1a;
pub const FRAME_TYPE_PATH_RESPONSE: u8 = 0x1b;
pub const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u8 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u8 = 0x1e;

/// Highest frame type code this endpoint understands.
pub const FRAME_TYPE_MAX: u8 = FRAME_TYPE_HANDSHAKE_DONE;

/// STREAM frame flag bits, OR'd into the 0x08 base type.
pub const STREAM_FRAME_BIT_FIN: u8 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u8 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u8 = 0x04;

// ============================================================================
// Frame Structs
// ============================================================================

/// ACK frame (RFC 9000 Section 19.3). ECN counts present iff type 0x03.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Largest packet number acknowledged.
    pub largest_acked: u64,

    /// Delay since the largest was received, in microseconds right-shifted
    /// by the sender's ack_delay_exponent.
    pub ack_delay: VarInt,

    /// Packets acknowledged contiguously below `largest_acked`.
    pub first_range: VarInt,

    /// Further (gap, length) pairs, descending.
    pub ranges: TinyVec<[AckRange; 8]>,

    /// ECN counters (ACK_ECN only).
    pub ecn: Option<EcnCounts>,
}

impl AckFrame {
    /// Decoded ACK delay given the peer's ack_delay_exponent.
    pub fn delay(&self, ack_delay_exponent: u64) -> Duration {
        Duration::from_micros(self.ack_delay.saturating_shl(ack_delay_exponent))
    }

    /// Iterate acknowledged blocks as `(lo, hi)` pairs, largest first.
    ///
    /// Assumes the range arithmetic was validated at parse time (the parser
    /// rejects underflow); on a hand-built frame this debug-asserts instead.
    pub fn blocks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        let largest = self.largest_acked;
        let first_range = self.first_range;
        let mut ranges = self.ranges.iter();
        let mut prev_lo: Option<u64> = None;
        core::iter::from_fn(move || {
            let (lo, hi) = match prev_lo {
                None => (largest.saturating_sub(first_range), largest),
                Some(p) => {
                    let r = ranges.next()?;
                    debug_assert!(p >= r.gap + 2, "ack range underflow");
                    let hi = p.saturating_sub(r.gap).saturating_sub(2);
                    debug_assert!(hi >= r.length, "ack range underflow");
                    (hi.saturating_sub(r.length), hi)
                }
            };
            prev_lo = Some(lo);
            Some((lo, hi))
        })
    }

    /// Smallest packet number acknowledged by this frame.
    pub fn smallest(&self) -> u64 {
        self.blocks().last().map(|(lo, _)| lo).unwrap_or(self.largest_acked)
    }
}

trait SaturatingShl {
    fn saturating_shl(self, shift: u64) -> u64;
}

impl SaturatingShl for u64 {
    fn saturating_shl(self, shift: u64) -> u64 {
        if shift >= 64 || self > u64::MAX >> shift {
            u64::MAX
        } else {
            self << shift
        }
    }
}

/// One (gap, length) pair in an ACK frame (RFC 9000 Section 19.3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckRange {
    /// Unacknowledged packets below the previous block, minus one.
    pub gap: VarInt,

    /// Acknowledged packets in this block, minus one.
    pub length: VarInt,
}

/// ECN counters reported in ACK_ECN frames (RFC 9000 Section 19.3.2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

impl EcnCounts {
    pub fn is_zero(&self) -> bool {
        self.ect0 == 0 && self.ect1 == 0 && self.ce == 0
    }
}

/// RESET_STREAM frame (RFC 9000 Section 19.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
    pub final_size: VarInt,
}

/// STOP_SENDING frame (RFC 9000 Section 19.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,
    pub error_code: VarInt,
}

/// CRYPTO frame (RFC 9000 Section 19.6). The epoch is implied by the packet
/// carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoFrame {
    pub offset: VarInt,
    pub data: Bytes,
}

/// NEW_TOKEN frame (RFC 9000 Section 19.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTokenFrame {
    pub token: Bytes,
}

/// STREAM frame (RFC 9000 Sections 19.8).
///
/// OFF/LEN/FIN flags live in the wire type byte; offset and data length are
/// explicit here and the serializer re-derives the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: VarInt,
    pub fin: bool,
    pub data: Bytes,
}

/// MAX_DATA frame (RFC 9000 Section 19.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxDataFrame {
    pub maximum_data: VarInt,
}

/// MAX_STREAM_DATA frame (RFC 9000 Section 19.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,
    pub maximum_stream_data: VarInt,
}

/// MAX_STREAMS frame, both directions (RFC 9000 Section 19.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    pub maximum_streams: VarInt,
    pub bidirectional: bool,
}

/// DATA_BLOCKED frame (RFC 9000 Section 19.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockedFrame {
    pub data_limit: VarInt,
}

/// STREAM_DATA_BLOCKED frame (RFC 9000 Section 19.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,
    pub stream_data_limit: VarInt,
}

/// STREAMS_BLOCKED frame, both directions (RFC 9000 Section 19.14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    pub stream_limit: VarInt,
    pub bidirectional: bool,
}

/// NEW_CONNECTION_ID frame (RFC 9000 Section 19.15).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionIdFrame {
    pub sequence_number: VarInt,
    pub retire_prior_to: VarInt,
    pub connection_id: crate::types::ConnectionId,
    pub stateless_reset_token: [u8; 16],
}

/// RETIRE_CONNECTION_ID frame (RFC 9000 Section 19.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetireConnectionIdFrame {
    pub sequence_number: VarInt,
}

/// CONNECTION_CLOSE frame, both variants (RFC 9000 Section 19.19).
///
/// `frame_type` is `Some` for the transport variant (0x1c) and `None` for
/// the application variant (0x1d).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: Bytes,
}

impl ConnectionCloseFrame {
    pub fn is_application(&self) -> bool {
        self.frame_type.is_none()
    }
}

// ============================================================================
// Unified Frame Enum
// ============================================================================

/// Every frame this endpoint speaks, as one discriminated union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A run of PADDING bytes, coalesced into one record.
    Padding { len: usize },
    Ping,
    Ack(AckFrame),
    ResetStream(ResetStreamFrame),
    StopSending(StopSendingFrame),
    Crypto(CryptoFrame),
    NewToken(NewTokenFrame),
    Stream(StreamFrame),
    MaxData(MaxDataFrame),
    MaxStreamData(MaxStreamDataFrame),
    MaxStreams(MaxStreamsFrame),
    DataBlocked(DataBlockedFrame),
    StreamDataBlocked(StreamDataBlockedFrame),
    StreamsBlocked(StreamsBlockedFrame),
    NewConnectionId(NewConnectionIdFrame),
    RetireConnectionId(RetireConnectionIdFrame),
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose(ConnectionCloseFrame),
    HandshakeDone,
}

impl Frame {
    /// Canonical type code for this frame (STREAM collapses to 0x08; the
    /// wire byte may carry OFF/LEN/FIN flags on top).
    pub fn code(&self) -> u8 {
        match self {
            Frame::Padding { .. } => FRAME_TYPE_PADDING,
            Frame::Ping => FRAME_TYPE_PING,
            Frame::Ack(ack) => {
                if ack.ecn.is_some() {
                    FRAME_TYPE_ACK_ECN
                } else {
                    FRAME_TYPE_ACK
                }
            }
            Frame::ResetStream(_) => FRAME_TYPE_RESET_STREAM,
            Frame::StopSending(_) => FRAME_TYPE_STOP_SENDING,
            Frame::Crypto(_) => FRAME_TYPE_CRYPTO,
            Frame::NewToken(_) => FRAME_TYPE_NEW_TOKEN,
            Frame::Stream(_) => FRAME_TYPE_STREAM_BASE,
            Frame::MaxData(_) => FRAME_TYPE_MAX_DATA,
            Frame::MaxStreamData(_) => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams(f) => {
                if f.bidirectional {
                    FRAME_TYPE_MAX_STREAMS_BIDI
                } else {
                    FRAME_TYPE_MAX_STREAMS_UNI
                }
            }
            Frame::DataBlocked(_) => FRAME_TYPE_DATA_BLOCKED,
            Frame::StreamDataBlocked(_) => FRAME_TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked(f) => {
                if f.bidirectional {
                    FRAME_TYPE_STREAMS_BLOCKED_BIDI
                } else {
                    FRAME_TYPE_STREAMS_BLOCKED_UNI
                }
            }
            Frame::NewConnectionId(_) => FRAME_TYPE_NEW_CONNECTION_ID,
            Frame::RetireConnectionId(_) => FRAME_TYPE_RETIRE_CONNECTION_ID,
            Frame::PathChallenge(_) => FRAME_TYPE_PATH_CHALLENGE,
            Frame::PathResponse(_) => FRAME_TYPE_PATH_RESPONSE,
            Frame::ConnectionClose(f) => {
                if f.is_application() {
                    FRAME_TYPE_CONNECTION_CLOSE_APP
                } else {
                    FRAME_TYPE_CONNECTION_CLOSE
                }
            }
            Frame::HandshakeDone => FRAME_TYPE_HANDSHAKE_DONE,
        }
    }

    /// ACK-eliciting frames require the peer to acknowledge the packet
    /// (RFC 9000 Section 13.2). PADDING, ACK and CONNECTION_CLOSE are not.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    /// Whether this frame may appear in a packet of the given epoch
    /// (RFC 9000 Section 12.4, Table 3). Initial and Handshake packets are
    /// restricted to handshake plumbing and transport-level closure.
    pub fn permitted_in(&self, epoch: Epoch) -> bool {
        if epoch == Epoch::Application {
            return true;
        }
        match self {
            Frame::Padding { .. } | Frame::Ping | Frame::Ack(_) | Frame::Crypto(_) => true,
            Frame::ConnectionClose(close) => !close.is_application(),
            _ => false,
        }
    }
}

// ============================================================================
// Frame-Type Bitset
// ============================================================================

/// Fixed-size bit vector keyed by canonical frame-type code.
///
/// Tracks which frame types a packet contained (per-packet metadata) and
/// which types a space has seen since its last ACK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTypeSet(u64);

impl FrameTypeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: u8) {
        debug_assert!(code <= FRAME_TYPE_MAX);
        self.0 |= 1 << code;
    }

    pub fn contains(self, code: u8) -> bool {
        self.0 & (1 << code) != 0
    }

    pub fn union(&mut self, other: FrameTypeSet) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_eliciting_classification() {
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(!Frame::Padding { len: 3 }.is_ack_eliciting());
        let ack = AckFrame {
            largest_acked: 9,
            ack_delay: 0,
            first_range: 0,
            ranges: TinyVec::new(),
            ecn: None,
        };
        assert!(!Frame::Ack(ack).is_ack_eliciting());
        assert!(Frame::HandshakeDone.is_ack_eliciting());
    }

    #[test]
    fn test_epoch_permission() {
        let stream = Frame::Stream(StreamFrame {
            stream_id: StreamId::new(0),
            offset: 0,
            fin: false,
            data: Bytes::new(),
        });
        assert!(!stream.permitted_in(Epoch::Initial));
        assert!(!stream.permitted_in(Epoch::Handshake));
        assert!(stream.permitted_in(Epoch::Application));

        assert!(Frame::Ping.permitted_in(Epoch::Initial));
        assert!(Frame::Crypto(CryptoFrame { offset: 0, data: Bytes::new() })
            .permitted_in(Epoch::Handshake));

        let transport_close = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 0x0a,
            frame_type: Some(0),
            reason: Bytes::new(),
        });
        let app_close = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: 7,
            frame_type: None,
            reason: Bytes::new(),
        });
        assert!(transport_close.permitted_in(Epoch::Initial));
        assert!(!app_close.permitted_in(Epoch::Initial));
        assert!(app_close.permitted_in(Epoch::Application));
    }

    #[test]
    fn test_ack_blocks() {
        // recv = {[1,3], [5,5], [7,9]} encoded largest=9 first_range=2,
        // then (gap=0, range=0) for [5,5] and (gap=0, range=2) for [1,3].
        let mut ranges = TinyVec::new();
        ranges.push(AckRange { gap: 0, length: 0 });
        ranges.push(AckRange { gap: 0, length: 2 });
        let ack = AckFrame {
            largest_acked: 9,
            ack_delay: 0,
            first_range: 2,
            ranges,
            ecn: None,
        };
        let blocks: Vec<_> = ack.blocks().collect();
        assert_eq!(blocks, vec![(7, 9), (5, 5), (1, 3)]);
        assert_eq!(ack.smallest(), 1);
    }

    #[test]
    fn test_frame_type_set() {
        let mut set = FrameTypeSet::new();
        assert!(set.is_empty());
        set.insert(FRAME_TYPE_PING);
        set.insert(FRAME_TYPE_HANDSHAKE_DONE);
        assert!(set.contains(FRAME_TYPE_PING));
        assert!(!set.contains(FRAME_TYPE_ACK));
        set.clear();
        assert!(set.is_empty());
    }
}
