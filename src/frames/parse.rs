//! Frame parsing (RFC 9000 Section 12.4).
//!
//! [`FrameIter`] walks a decrypted packet payload in wire order, yielding
//! typed frames. Payload-bearing frames (STREAM, CRYPTO, NEW_TOKEN) slice
//! the input `Bytes` so each frame's data can be owned by its stream without
//! copying. A malformed frame stops iteration; the offending type byte stays
//! available for the CONNECTION_CLOSE the caller will emit.

#![forbid(unsafe_code)]

use super::*;
use crate::error::{Error, Result};
use crate::types::{ConnectionId, Epoch, StreamId};
use crate::varint;
use bytes::Bytes;

/// Iterator over the frames of one packet payload.
pub struct FrameIter {
    payload: Bytes,
    epoch: Epoch,
    pos: usize,
    failed: bool,
    last_type: u8,
}

impl FrameIter {
    pub fn new(payload: Bytes, epoch: Epoch) -> Self {
        Self {
            payload,
            epoch,
            pos: 0,
            failed: false,
            last_type: 0,
        }
    }

    /// Type byte of the frame where parsing stopped. Meaningful after an
    /// `Err` item; feeds the frame-type field of CONNECTION_CLOSE.
    pub fn offending_type(&self) -> u8 {
        self.last_type
    }
}

impl Iterator for FrameIter {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.payload.len() {
            return None;
        }
        self.last_type = self.payload[self.pos];
        match parse_frame(&self.payload, &mut self.pos, self.epoch) {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Whether a frame type code may appear in a packet of the given epoch.
///
/// Initial and Handshake packets carry only PADDING, PING, ACK, CRYPTO and
/// transport-variant CONNECTION_CLOSE (RFC 9000 Section 12.4 Table 3).
fn type_permitted(code: u8, epoch: Epoch) -> bool {
    if epoch == Epoch::Application {
        return true;
    }
    matches!(
        code,
        FRAME_TYPE_PADDING
            | FRAME_TYPE_PING
            | FRAME_TYPE_ACK
            | FRAME_TYPE_ACK_ECN
            | FRAME_TYPE_CRYPTO
            | FRAME_TYPE_CONNECTION_CLOSE
    )
}

/// Parse one frame from `payload[*pos..]`, advancing the cursor on success.
pub fn parse_frame(payload: &Bytes, pos: &mut usize, epoch: Epoch) -> Result<Frame> {
    let start = *pos;
    let frame_type = varint::decode(payload, pos)?;
    if frame_type > FRAME_TYPE_MAX as u64 {
        *pos = start;
        return Err(Error::FrameEncodingError);
    }
    let code = frame_type as u8;
    if !type_permitted(code, epoch) {
        *pos = start;
        return Err(Error::ProtocolViolation);
    }

    let result = match code {
        FRAME_TYPE_PADDING => {
            // Coalesce the whole run into a single record.
            let mut len = 1;
            while *pos < payload.len() && payload[*pos] == 0x00 {
                *pos += 1;
                len += 1;
            }
            Ok(Frame::Padding { len })
        }

        FRAME_TYPE_PING => Ok(Frame::Ping),

        FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
            parse_ack(payload, pos, code == FRAME_TYPE_ACK_ECN).map(Frame::Ack)
        }

        FRAME_TYPE_RESET_STREAM => {
            let stream_id = StreamId::new(varint::decode(payload, pos)?);
            let error_code = varint::decode(payload, pos)?;
            let final_size = varint::decode(payload, pos)?;
            Ok(Frame::ResetStream(ResetStreamFrame {
                stream_id,
                error_code,
                final_size,
            }))
        }

        FRAME_TYPE_STOP_SENDING => {
            let stream_id = StreamId::new(varint::decode(payload, pos)?);
            let error_code = varint::decode(payload, pos)?;
            Ok(Frame::StopSending(StopSendingFrame { stream_id, error_code }))
        }

        FRAME_TYPE_CRYPTO => {
            let offset = varint::decode(payload, pos)?;
            let len = varint::decode(payload, pos)?;
            let data = varint::decode_bytes(payload, pos, len as usize)?;
            Ok(Frame::Crypto(CryptoFrame { offset, data }))
        }

        FRAME_TYPE_NEW_TOKEN => {
            let len = varint::decode(payload, pos)?;
            if len == 0 {
                return fail(pos, start, Error::FrameEncodingError);
            }
            let token = varint::decode_bytes(payload, pos, len as usize)?;
            Ok(Frame::NewToken(NewTokenFrame { token }))
        }

        t if (FRAME_TYPE_STREAM_BASE..=0x0f).contains(&t) => parse_stream(payload, pos, t),

        FRAME_TYPE_MAX_DATA => {
            let maximum_data = varint::decode(payload, pos)?;
            Ok(Frame::MaxData(MaxDataFrame { maximum_data }))
        }

        FRAME_TYPE_MAX_STREAM_DATA => {
            let stream_id = StreamId::new(varint::decode(payload, pos)?);
            let maximum_stream_data = varint::decode(payload, pos)?;
            Ok(Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id,
                maximum_stream_data,
            }))
        }

        FRAME_TYPE_MAX_STREAMS_BIDI | FRAME_TYPE_MAX_STREAMS_UNI => {
            let maximum_streams = varint::decode(payload, pos)?;
            Ok(Frame::MaxStreams(MaxStreamsFrame {
                maximum_streams,
                bidirectional: code == FRAME_TYPE_MAX_STREAMS_BIDI,
            }))
        }

        FRAME_TYPE_DATA_BLOCKED => {
            let data_limit = varint::decode(payload, pos)?;
            Ok(Frame::DataBlocked(DataBlockedFrame { data_limit }))
        }

        FRAME_TYPE_STREAM_DATA_BLOCKED => {
            let stream_id = StreamId::new(varint::decode(payload, pos)?);
            let stream_data_limit = varint::decode(payload, pos)?;
            Ok(Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id,
                stream_data_limit,
            }))
        }

        FRAME_TYPE_STREAMS_BLOCKED_BIDI | FRAME_TYPE_STREAMS_BLOCKED_UNI => {
            let stream_limit = varint::decode(payload, pos)?;
            Ok(Frame::StreamsBlocked(StreamsBlockedFrame {
                stream_limit,
                bidirectional: code == FRAME_TYPE_STREAMS_BLOCKED_BIDI,
            }))
        }

        FRAME_TYPE_NEW_CONNECTION_ID => parse_new_connection_id(payload, pos),

        FRAME_TYPE_RETIRE_CONNECTION_ID => {
            let sequence_number = varint::decode(payload, pos)?;
            Ok(Frame::RetireConnectionId(RetireConnectionIdFrame { sequence_number }))
        }

        FRAME_TYPE_PATH_CHALLENGE => {
            Ok(Frame::PathChallenge(varint::decode_array(payload, pos)?))
        }

        FRAME_TYPE_PATH_RESPONSE => {
            Ok(Frame::PathResponse(varint::decode_array(payload, pos)?))
        }

        FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
            let error_code = varint::decode(payload, pos)?;
            let frame_type = if code == FRAME_TYPE_CONNECTION_CLOSE {
                Some(varint::decode(payload, pos)?)
            } else {
                None
            };
            let reason_len = varint::decode(payload, pos)?;
            let reason = varint::decode_bytes(payload, pos, reason_len as usize)?;
            Ok(Frame::ConnectionClose(ConnectionCloseFrame {
                error_code,
                frame_type,
                reason,
            }))
        }

        FRAME_TYPE_HANDSHAKE_DONE => Ok(Frame::HandshakeDone),

        _ => Err(Error::FrameEncodingError),
    };

    if result.is_err() {
        *pos = start;
    }
    result
}

fn fail<T>(pos: &mut usize, start: usize, e: Error) -> Result<T> {
    *pos = start;
    Err(e)
}

fn parse_stream(payload: &Bytes, pos: &mut usize, wire_type: u8) -> Result<Frame> {
    let has_off = wire_type & STREAM_FRAME_BIT_OFF != 0;
    let has_len = wire_type & STREAM_FRAME_BIT_LEN != 0;
    let fin = wire_type & STREAM_FRAME_BIT_FIN != 0;

    let stream_id = StreamId::new(varint::decode(payload, pos)?);
    let offset = if has_off {
        varint::decode(payload, pos)?
    } else {
        0
    };

    let data = if has_len {
        let len = varint::decode(payload, pos)?;
        varint::decode_bytes(payload, pos, len as usize)?
    } else {
        // Data extends to the end of the packet.
        let data = payload.slice(*pos..);
        *pos = payload.len();
        data
    };

    // A stream cannot exceed the varint offset space.
    if offset.checked_add(data.len() as u64).map_or(true, |end| end > crate::types::VARINT_MAX) {
        return Err(Error::FrameEncodingError);
    }

    Ok(Frame::Stream(StreamFrame { stream_id, offset, fin, data }))
}

fn parse_ack(payload: &Bytes, pos: &mut usize, ecn: bool) -> Result<AckFrame> {
    let largest_acked = varint::decode(payload, pos)?;
    let ack_delay = varint::decode(payload, pos)?;
    let range_count = varint::decode(payload, pos)?;
    let first_range = varint::decode(payload, pos)?;

    if first_range > largest_acked {
        return Err(Error::FrameEncodingError);
    }

    // Walk the (gap, length) pairs, checking the descending block bounds do
    // not underflow: each block needs gap + 2 below the previous low, plus
    // room for its own length.
    let mut ranges = tinyvec::TinyVec::new();
    let mut lo = largest_acked - first_range;
    for _ in 0..range_count {
        let gap = varint::decode(payload, pos)?;
        let length = varint::decode(payload, pos)?;
        let hi = lo
            .checked_sub(gap)
            .and_then(|v| v.checked_sub(2))
            .ok_or(Error::FrameEncodingError)?;
        lo = hi.checked_sub(length).ok_or(Error::FrameEncodingError)?;
        ranges.push(AckRange { gap, length });
    }

    let ecn = if ecn {
        Some(EcnCounts {
            ect0: varint::decode(payload, pos)?,
            ect1: varint::decode(payload, pos)?,
            ce: varint::decode(payload, pos)?,
        })
    } else {
        None
    };

    Ok(AckFrame {
        largest_acked,
        ack_delay,
        first_range,
        ranges,
        ecn,
    })
}

fn parse_new_connection_id(payload: &Bytes, pos: &mut usize) -> Result<Frame> {
    let sequence_number = varint::decode(payload, pos)?;
    let retire_prior_to = varint::decode(payload, pos)?;
    if retire_prior_to > sequence_number {
        return Err(Error::FrameEncodingError);
    }

    let cid_len = varint::decode_u8(payload, pos)? as usize;
    if cid_len == 0 || cid_len > crate::types::MAX_CID_LENGTH {
        return Err(Error::FrameEncodingError);
    }
    let cid_bytes = varint::decode_bytes(payload, pos, cid_len)?;
    let connection_id = ConnectionId::new(cid_bytes).ok_or(Error::FrameEncodingError)?;
    let stateless_reset_token = varint::decode_array(payload, pos)?;

    Ok(Frame::NewConnectionId(NewConnectionIdFrame {
        sequence_number,
        retire_prior_to,
        connection_id,
        stateless_reset_token,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(bytes: &[u8]) -> Result<Frame> {
        let payload = Bytes::copy_from_slice(bytes);
        let mut pos = 0;
        let frame = parse_frame(&payload, &mut pos, Epoch::Application)?;
        assert_eq!(pos, bytes.len(), "frame did not consume full input");
        Ok(frame)
    }

    #[test]
    fn test_parse_padding_run_coalesced() {
        let payload = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01]);
        let mut iter = FrameIter::new(payload, Epoch::Application);
        assert_eq!(iter.next().unwrap().unwrap(), Frame::Padding { len: 3 });
        assert_eq!(iter.next().unwrap().unwrap(), Frame::Ping);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_parse_stream_frame_with_all_flags() {
        // type 0x0f = STREAM | OFF | LEN | FIN, sid 4, offset 100, "hello"
        let frame = parse_one(&[
            0x0f, 0x04, 0x40, 0x64, 0x05, b'h', b'e', b'l', b'l', b'o',
        ])
        .unwrap();
        match frame {
            Frame::Stream(s) => {
                assert_eq!(s.stream_id, StreamId::new(4));
                assert_eq!(s.offset, 100);
                assert!(s.fin);
                assert_eq!(&s.data[..], b"hello");
            }
            other => panic!("expected STREAM, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stream_frame_without_len_takes_rest() {
        let frame = parse_one(&[0x08, 0x00, b'a', b'b', b'c']).unwrap();
        match frame {
            Frame::Stream(s) => {
                assert_eq!(s.offset, 0);
                assert!(!s.fin);
                assert_eq!(&s.data[..], b"abc");
            }
            other => panic!("expected STREAM, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ack_with_ranges() {
        // largest=9 delay=0 count=2 first=2 (0,0) (0,2) => {[1,3],[5,5],[7,9]}
        let frame = parse_one(&[0x02, 0x09, 0x00, 0x02, 0x02, 0x00, 0x00, 0x00, 0x02]).unwrap();
        match frame {
            Frame::Ack(ack) => {
                assert_eq!(ack.largest_acked, 9);
                let blocks: Vec<_> = ack.blocks().collect();
                assert_eq!(blocks, vec![(7, 9), (5, 5), (1, 3)]);
                assert!(ack.ecn.is_none());
            }
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ack_range_underflow_rejected() {
        // largest=9 first=2 -> lo=7; gap=5 underflows (7 - 5 - 2 = 0, then
        // length 1 pushes below zero).
        let r = parse_one(&[0x02, 0x09, 0x00, 0x01, 0x02, 0x05, 0x01]);
        assert_eq!(r.unwrap_err(), Error::FrameEncodingError);

        // Boundary case that just fits: gap=5 length=0 -> block [0,0].
        let frame = parse_one(&[0x02, 0x09, 0x00, 0x01, 0x02, 0x05, 0x00]).unwrap();
        match frame {
            Frame::Ack(ack) => assert_eq!(ack.blocks().last(), Some((0, 0))),
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_ack_first_range_exceeding_largest_rejected() {
        let r = parse_one(&[0x02, 0x03, 0x00, 0x00, 0x04]);
        assert_eq!(r.unwrap_err(), Error::FrameEncodingError);
    }

    #[test]
    fn test_parse_ack_ecn_counts() {
        let frame = parse_one(&[0x03, 0x05, 0x00, 0x00, 0x00, 0x01, 0x02, 0x03]).unwrap();
        match frame {
            Frame::Ack(ack) => {
                let ecn = ack.ecn.unwrap();
                assert_eq!((ecn.ect0, ecn.ect1, ecn.ce), (1, 2, 3));
            }
            other => panic!("expected ACK_ECN, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_connection_close_variants() {
        // Transport variant carries the offending frame type.
        let frame = parse_one(&[0x1c, 0x0a, 0x08, 0x02, b'n', b'o']).unwrap();
        match frame {
            Frame::ConnectionClose(c) => {
                assert_eq!(c.error_code, 0x0a);
                assert_eq!(c.frame_type, Some(0x08));
                assert_eq!(&c.reason[..], b"no");
                assert!(!c.is_application());
            }
            other => panic!("expected CONNECTION_CLOSE, got {other:?}"),
        }

        let frame = parse_one(&[0x1d, 0x07, 0x00]).unwrap();
        match frame {
            Frame::ConnectionClose(c) => {
                assert!(c.is_application());
                assert!(c.reason.is_empty());
            }
            other => panic!("expected CONNECTION_CLOSE, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_new_connection_id() {
        let mut bytes = vec![0x18, 0x02, 0x01, 0x04, 0xaa, 0xbb, 0xcc, 0xdd];
        bytes.extend_from_slice(&[0x11; 16]);
        let frame = parse_one(&bytes).unwrap();
        match frame {
            Frame::NewConnectionId(f) => {
                assert_eq!(f.sequence_number, 2);
                assert_eq!(f.retire_prior_to, 1);
                assert_eq!(f.connection_id.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd]);
                assert_eq!(f.stateless_reset_token, [0x11; 16]);
            }
            other => panic!("expected NEW_CONNECTION_ID, got {other:?}"),
        }

        // retire_prior_to > sequence_number is malformed.
        let mut bad = vec![0x18, 0x01, 0x02, 0x01, 0xaa];
        bad.extend_from_slice(&[0x00; 16]);
        assert_eq!(parse_one(&bad).unwrap_err(), Error::FrameEncodingError);
    }

    #[test]
    fn test_epoch_restrictions() {
        let stream = Bytes::from_static(&[0x08, 0x00, b'x']);
        let mut pos = 0;
        let r = parse_frame(&stream, &mut pos, Epoch::Initial);
        assert_eq!(r.unwrap_err(), Error::ProtocolViolation);
        assert_eq!(pos, 0);

        // CRYPTO is fine in Initial.
        let crypto = Bytes::from_static(&[0x06, 0x00, 0x01, 0xab]);
        let mut pos = 0;
        assert!(parse_frame(&crypto, &mut pos, Epoch::Initial).is_ok());

        // Application-variant close is not.
        let app_close = Bytes::from_static(&[0x1d, 0x00, 0x00]);
        let mut pos = 0;
        assert_eq!(
            parse_frame(&app_close, &mut pos, Epoch::Handshake).unwrap_err(),
            Error::ProtocolViolation
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(parse_one(&[0x1f]).unwrap_err(), Error::FrameEncodingError);
        assert_eq!(parse_one(&[0x40, 0x42]).unwrap_err(), Error::FrameEncodingError);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let payload = Bytes::from_static(&[0x06, 0x00, 0x05, 0xab]); // len 5, 1 byte present
        let mut iter = FrameIter::new(payload, Epoch::Application);
        assert!(iter.next().unwrap().is_err());
        assert_eq!(iter.offending_type(), 0x06);
        assert!(iter.next().is_none());
    }
}
