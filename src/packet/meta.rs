//! Per-packet metadata for in-flight tracking.
//!
//! One [`SentPacket`] exists per transmitted packet until it is acked or
//! declared lost. It records what the packet carried in two forms: a
//! frame-type bitset for quick classification, and [`RetransmitFrame`]
//! records pointing at the stream/crypto ranges and control frames that must
//! be re-queued if the packet is lost.

#![forbid(unsafe_code)]

use crate::frames::FrameTypeSet;
use crate::types::{Epoch, Instant, StreamId};

/// What a lost packet forces us to retransmit.
///
/// Stream and crypto records reference offsets rather than bytes; the data
/// itself stays owned by the stream until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitFrame {
    Stream {
        stream_id: StreamId,
        offset: u64,
        len: u64,
        fin: bool,
    },
    Crypto {
        epoch: Epoch,
        offset: u64,
        len: u64,
    },
    MaxData,
    MaxStreamData { stream_id: StreamId },
    MaxStreams { bidirectional: bool },
    DataBlocked,
    StreamDataBlocked { stream_id: StreamId },
    StreamsBlocked { bidirectional: bool },
    ResetStream { stream_id: StreamId },
    StopSending { stream_id: StreamId, error_code: u64 },
    NewConnectionId { sequence_number: u64 },
    RetireConnectionId { sequence_number: u64 },
    NewToken { token: bytes::Bytes },
    HandshakeDone,
    PathResponse { data: [u8; 8] },
    Ping,
}

/// Metadata for one in-flight sent packet.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Packet number within its space.
    pub packet_number: u64,

    /// Transmission time.
    pub time_sent: Instant,

    /// Size on the wire in bytes.
    pub size: usize,

    /// Carries at least one ACK-eliciting frame.
    pub ack_eliciting: bool,

    /// Counts toward `bytes_in_flight`.
    pub in_flight: bool,

    /// Frame types the packet contained.
    pub frames: FrameTypeSet,

    /// Content to re-queue on loss.
    pub retransmits: Vec<RetransmitFrame>,

    /// Largest packet number acknowledged by an ACK frame in this packet,
    /// if it carried one. When this packet is itself acknowledged we can
    /// stop re-acknowledging everything at or below that number.
    pub acked_up_to: Option<u64>,

    /// Packet number of the earlier transmission this packet retransmits.
    /// The newest node owns the chain; older incarnations back-reference
    /// through it.
    pub retransmission_of: Option<u64>,
}

impl SentPacket {
    pub fn new(packet_number: u64, time_sent: Instant, size: usize) -> Self {
        Self {
            packet_number,
            time_sent,
            size,
            ack_eliciting: false,
            in_flight: false,
            frames: FrameTypeSet::new(),
            retransmits: Vec::new(),
            acked_up_to: None,
            retransmission_of: None,
        }
    }
}
