//! Frame serialization (RFC 9000 Section 19).
//!
//! Buffer-injection style: frames are appended to a caller-provided
//! `BytesMut`. `frame_size` reports the exact on-wire size so the packet
//! assembler can budget a datagram before committing bytes.

#![forbid(unsafe_code)]

use super::*;
use crate::varint;
use bytes::{BufMut, BytesMut};

/// Serializes frames into outgoing packet payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSerializer;

impl FrameSerializer {
    /// Append `frame` to `buf`, returning the bytes written.
    ///
    /// STREAM frames always carry an explicit length here; the packet
    /// assembler uses [`Self::serialize_stream_frame`] directly when the
    /// frame is the last in a datagram and may omit it.
    pub fn serialize_frame(&self, frame: &Frame, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        match frame {
            Frame::Padding { len } => {
                buf.put_bytes(0x00, *len);
            }

            Frame::Ping => varint::encode(buf, FRAME_TYPE_PING as u64),

            Frame::Ack(ack) => self.serialize_ack(ack, buf),

            Frame::ResetStream(f) => {
                varint::encode(buf, FRAME_TYPE_RESET_STREAM as u64);
                varint::encode(buf, f.stream_id.value());
                varint::encode(buf, f.error_code);
                varint::encode(buf, f.final_size);
            }

            Frame::StopSending(f) => {
                varint::encode(buf, FRAME_TYPE_STOP_SENDING as u64);
                varint::encode(buf, f.stream_id.value());
                varint::encode(buf, f.error_code);
            }

            Frame::Crypto(f) => {
                varint::encode(buf, FRAME_TYPE_CRYPTO as u64);
                varint::encode(buf, f.offset);
                varint::encode(buf, f.data.len() as u64);
                buf.put_slice(&f.data);
            }

            Frame::NewToken(f) => {
                varint::encode(buf, FRAME_TYPE_NEW_TOKEN as u64);
                varint::encode(buf, f.token.len() as u64);
                buf.put_slice(&f.token);
            }

            Frame::Stream(f) => self.serialize_stream_frame(f, buf, false),

            Frame::MaxData(f) => {
                varint::encode(buf, FRAME_TYPE_MAX_DATA as u64);
                varint::encode(buf, f.maximum_data);
            }

            Frame::MaxStreamData(f) => {
                varint::encode(buf, FRAME_TYPE_MAX_STREAM_DATA as u64);
                varint::encode(buf, f.stream_id.value());
                varint::encode(buf, f.maximum_stream_data);
            }

            Frame::MaxStreams(f) => {
                varint::encode(buf, frame.code() as u64);
                varint::encode(buf, f.maximum_streams);
            }

            Frame::DataBlocked(f) => {
                varint::encode(buf, FRAME_TYPE_DATA_BLOCKED as u64);
                varint::encode(buf, f.data_limit);
            }

            Frame::StreamDataBlocked(f) => {
                varint::encode(buf, FRAME_TYPE_STREAM_DATA_BLOCKED as u64);
                varint::encode(buf, f.stream_id.value());
                varint::encode(buf, f.stream_data_limit);
            }

            Frame::StreamsBlocked(f) => {
                varint::encode(buf, frame.code() as u64);
                varint::encode(buf, f.stream_limit);
            }

            Frame::NewConnectionId(f) => {
                varint::encode(buf, FRAME_TYPE_NEW_CONNECTION_ID as u64);
                varint::encode(buf, f.sequence_number);
                varint::encode(buf, f.retire_prior_to);
                buf.put_u8(f.connection_id.len() as u8);
                buf.put_slice(f.connection_id.as_bytes());
                buf.put_slice(&f.stateless_reset_token);
            }

            Frame::RetireConnectionId(f) => {
                varint::encode(buf, FRAME_TYPE_RETIRE_CONNECTION_ID as u64);
                varint::encode(buf, f.sequence_number);
            }

            Frame::PathChallenge(data) => {
                varint::encode(buf, FRAME_TYPE_PATH_CHALLENGE as u64);
                buf.put_slice(data);
            }

            Frame::PathResponse(data) => {
                varint::encode(buf, FRAME_TYPE_PATH_RESPONSE as u64);
                buf.put_slice(data);
            }

            Frame::ConnectionClose(f) => {
                varint::encode(buf, frame.code() as u64);
                varint::encode(buf, f.error_code);
                if let Some(ft) = f.frame_type {
                    varint::encode(buf, ft);
                }
                varint::encode(buf, f.reason.len() as u64);
                buf.put_slice(&f.reason);
            }

            Frame::HandshakeDone => varint::encode(buf, FRAME_TYPE_HANDSHAKE_DONE as u64),
        }
        buf.len() - start
    }

    /// Serialize a STREAM frame. With `omit_len` the LEN bit is cleared and
    /// the data implicitly extends to the end of the datagram, saving the
    /// length prefix on the final frame.
    pub fn serialize_stream_frame(&self, f: &StreamFrame, buf: &mut BytesMut, omit_len: bool) {
        let mut wire_type = FRAME_TYPE_STREAM_BASE;
        if f.fin {
            wire_type |= STREAM_FRAME_BIT_FIN;
        }
        if f.offset != 0 {
            wire_type |= STREAM_FRAME_BIT_OFF;
        }
        if !omit_len {
            wire_type |= STREAM_FRAME_BIT_LEN;
        }

        buf.put_u8(wire_type);
        varint::encode(buf, f.stream_id.value());
        if f.offset != 0 {
            varint::encode(buf, f.offset);
        }
        if !omit_len {
            varint::encode(buf, f.data.len() as u64);
        }
        buf.put_slice(&f.data);
    }

    fn serialize_ack(&self, ack: &AckFrame, buf: &mut BytesMut) {
        varint::encode(
            buf,
            if ack.ecn.is_some() {
                FRAME_TYPE_ACK_ECN as u64
            } else {
                FRAME_TYPE_ACK as u64
            },
        );
        varint::encode(buf, ack.largest_acked);
        varint::encode(buf, ack.ack_delay);
        varint::encode(buf, ack.ranges.len() as u64);
        varint::encode(buf, ack.first_range);
        for r in &ack.ranges {
            varint::encode(buf, r.gap);
            varint::encode(buf, r.length);
        }
        if let Some(ecn) = &ack.ecn {
            varint::encode(buf, ecn.ect0);
            varint::encode(buf, ecn.ect1);
            varint::encode(buf, ecn.ce);
        }
    }

    /// Exact serialized size of `frame` (with the LEN bit set on STREAM).
    pub fn frame_size(&self, frame: &Frame) -> usize {
        match frame {
            Frame::Padding { len } => *len,
            Frame::Ping | Frame::HandshakeDone => 1,
            Frame::Ack(ack) => {
                let mut size = 1
                    + varint::size(ack.largest_acked)
                    + varint::size(ack.ack_delay)
                    + varint::size(ack.ranges.len() as u64)
                    + varint::size(ack.first_range);
                for r in &ack.ranges {
                    size += varint::size(r.gap) + varint::size(r.length);
                }
                if let Some(ecn) = &ack.ecn {
                    size += varint::size(ecn.ect0) + varint::size(ecn.ect1) + varint::size(ecn.ce);
                }
                size
            }
            Frame::ResetStream(f) => {
                1 + varint::size(f.stream_id.value())
                    + varint::size(f.error_code)
                    + varint::size(f.final_size)
            }
            Frame::StopSending(f) => {
                1 + varint::size(f.stream_id.value()) + varint::size(f.error_code)
            }
            Frame::Crypto(f) => {
                1 + varint::size(f.offset) + varint::size(f.data.len() as u64) + f.data.len()
            }
            Frame::NewToken(f) => 1 + varint::size(f.token.len() as u64) + f.token.len(),
            Frame::Stream(f) => {
                1 + varint::size(f.stream_id.value())
                    + if f.offset != 0 { varint::size(f.offset) } else { 0 }
                    + varint::size(f.data.len() as u64)
                    + f.data.len()
            }
            Frame::MaxData(f) => 1 + varint::size(f.maximum_data),
            Frame::MaxStreamData(f) => {
                1 + varint::size(f.stream_id.value()) + varint::size(f.maximum_stream_data)
            }
            Frame::MaxStreams(f) => 1 + varint::size(f.maximum_streams),
            Frame::DataBlocked(f) => 1 + varint::size(f.data_limit),
            Frame::StreamDataBlocked(f) => {
                1 + varint::size(f.stream_id.value()) + varint::size(f.stream_data_limit)
            }
            Frame::StreamsBlocked(f) => 1 + varint::size(f.stream_limit),
            Frame::NewConnectionId(f) => {
                1 + varint::size(f.sequence_number)
                    + varint::size(f.retire_prior_to)
                    + 1
                    + f.connection_id.len()
                    + 16
            }
            Frame::RetireConnectionId(f) => 1 + varint::size(f.sequence_number),
            Frame::PathChallenge(_) | Frame::PathResponse(_) => 9,
            Frame::ConnectionClose(f) => {
                1 + varint::size(f.error_code)
                    + f.frame_type.map_or(0, varint::size)
                    + varint::size(f.reason.len() as u64)
                    + f.reason.len()
            }
        }
    }
}
