//! Stream delivery scenarios driven through the connection surface:
//! in-order, reordered, duplicated and overlapping STREAM frames, plus the
//! flow-control violation path.

use bytes::{Bytes, BytesMut};
use quicore::frames::{Frame, FrameSerializer, StreamFrame};
use quicore::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, Epoch, Error, Instant,
    PacketInput, StreamId, StubHandshake,
};

fn server(config: ConnectionConfig) -> Connection {
    Connection::new_server(
        quicore::ConnectionId::from_slice(&[1; 8]).unwrap(),
        quicore::ConnectionId::from_slice(&[2; 8]).unwrap(),
        config,
        Box::new(StubHandshake::new()),
    )
}

fn payload(frames: &[Frame]) -> Bytes {
    let mut buf = BytesMut::new();
    for frame in frames {
        FrameSerializer.serialize_frame(frame, &mut buf);
    }
    buf.freeze()
}

fn app_packet(pn: u64, frames: &[Frame], at_millis: u64) -> PacketInput {
    PacketInput {
        epoch: Epoch::Application,
        packet_number: pn,
        payload: payload(frames),
        recv_time: Instant::from_millis(at_millis),
        ecn: None,
    }
}

fn stream_frame(sid: u64, offset: u64, data: &'static [u8], fin: bool) -> Frame {
    Frame::Stream(StreamFrame {
        stream_id: StreamId::new(sid),
        offset,
        fin,
        data: Bytes::from_static(data),
    })
}

fn read_all(conn: &mut Connection, sid: u64) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut finished = false;
    while let Some((chunk, fin)) = conn.read_stream(StreamId::new(sid)).unwrap() {
        out.extend_from_slice(&chunk);
        if fin {
            finished = true;
            break;
        }
    }
    (out, finished)
}

#[test]
fn in_order_delivery() {
    let mut conn = server(ConnectionConfig::default());

    conn.recv(app_packet(0, &[stream_frame(0, 0, b"ABCD", false)], 10)).unwrap();
    conn.recv(app_packet(1, &[stream_frame(0, 4, b"EFGH", false)], 11)).unwrap();
    conn.recv(app_packet(2, &[stream_frame(0, 8, b"IJ", true)], 12)).unwrap();

    let (data, finished) = read_all(&mut conn, 0);
    assert_eq!(data, b"ABCDEFGHIJ");
    assert!(finished);

    let events: Vec<_> = std::iter::from_fn(|| conn.poll_event()).collect();
    assert!(events.contains(&ConnectionEvent::StreamOpened(StreamId::new(0))));
    assert!(events.contains(&ConnectionEvent::StreamFinished(StreamId::new(0))));
}

#[test]
fn reordered_delivery() {
    let mut conn = server(ConnectionConfig::default());

    // Second frame first: nothing readable yet.
    conn.recv(app_packet(0, &[stream_frame(0, 4, b"EFGH", false)], 10)).unwrap();
    assert!(conn.read_stream(StreamId::new(0)).unwrap().is_none());

    // First frame: everything through EFGH drains in order.
    conn.recv(app_packet(1, &[stream_frame(0, 0, b"ABCD", false)], 11)).unwrap();
    let (data, _) = read_all(&mut conn, 0);
    assert_eq!(data, b"ABCDEFGH");

    // Tail with FIN.
    conn.recv(app_packet(2, &[stream_frame(0, 8, b"IJ", true)], 12)).unwrap();
    let (data, finished) = read_all(&mut conn, 0);
    assert_eq!(data, b"IJ");
    assert!(finished);
}

#[test]
fn duplicate_frame_ignored() {
    let mut conn = server(ConnectionConfig::default());

    conn.recv(app_packet(0, &[stream_frame(0, 0, b"ABCD", false)], 10)).unwrap();
    // Same bytes again in a new packet: complete duplicate, dropped.
    conn.recv(app_packet(1, &[stream_frame(0, 0, b"ABCD", false)], 11)).unwrap();
    // Whole-packet replay: dropped by packet-number dedup.
    conn.recv(app_packet(0, &[stream_frame(0, 0, b"ABCD", false)], 12)).unwrap();

    let (data, _) = read_all(&mut conn, 0);
    assert_eq!(data, b"ABCD");
    assert!(conn.read_stream(StreamId::new(0)).unwrap().is_none());
}

#[test]
fn head_overlap_trimmed() {
    let mut conn = server(ConnectionConfig::default());

    conn.recv(app_packet(0, &[stream_frame(0, 0, b"AAAAA", false)], 10)).unwrap();
    // Overlapping frame [3, 9): the first two bytes are already delivered.
    conn.recv(app_packet(1, &[stream_frame(0, 3, b"xxBCDE", false)], 11)).unwrap();

    let (data, _) = read_all(&mut conn, 0);
    assert_eq!(data, b"AAAAABCDE");
}

#[test]
fn flow_control_violation_closes_connection() {
    let mut config = ConnectionConfig::default();
    config.local_params.initial_max_stream_data_bidi_remote = 100;
    let mut conn = server(config);

    let err = conn
        .recv(app_packet(0, &[stream_frame(0, 98, &[0u8; 10], false)], 10))
        .unwrap_err();
    assert_eq!(err, Error::FlowControlError);
    assert_eq!(conn.state(), ConnectionState::Closing);

    // The close must go out as a transport CONNECTION_CLOSE carrying the
    // flow control code and the offending frame type.
    let out = conn.poll_transmit(Instant::from_millis(11)).expect("close packet");
    let frames: Vec<Frame> = quicore::FrameIter::new(out.payload, out.epoch)
        .collect::<quicore::Result<_>>()
        .unwrap();
    match &frames[..] {
        [Frame::ConnectionClose(close)] => {
            assert_eq!(close.error_code, 0x03);
            assert_eq!(close.frame_type, Some(0x08));
            assert!(!close.is_application());
        }
        other => panic!("expected CONNECTION_CLOSE, got {other:?}"),
    }

    // Stream and connection state did not advance.
    assert!(conn.read_stream(StreamId::new(0)).unwrap().is_none());
}

#[test]
fn stream_frames_rejected_in_handshake_epochs() {
    let mut conn = server(ConnectionConfig::default());
    let packet = PacketInput {
        epoch: Epoch::Initial,
        packet_number: 0,
        payload: payload(&[stream_frame(0, 0, b"nope", false)]),
        recv_time: Instant::from_millis(1),
        ecn: None,
    };
    assert_eq!(conn.recv(packet).unwrap_err(), Error::ProtocolViolation);
    assert_eq!(conn.state(), ConnectionState::Closing);
}

#[test]
fn frame_for_closed_stream_is_silently_ignored() {
    let mut conn = server(ConnectionConfig::default());

    // Open and finish a unidirectional peer stream (id 2).
    conn.recv(app_packet(0, &[stream_frame(2, 0, b"done", true)], 10)).unwrap();
    let (data, finished) = read_all(&mut conn, 2);
    assert_eq!(data, b"done");
    assert!(finished);

    // The stream id is retired; late frames for it change nothing and
    // cause no error.
    conn.recv(app_packet(1, &[stream_frame(2, 0, b"late", false)], 11)).unwrap();
    assert!(conn.read_stream(StreamId::new(2)).unwrap().is_none());
    assert_ne!(conn.state(), ConnectionState::Closing);
}

#[test]
fn fin_reordered_before_data() {
    let mut conn = server(ConnectionConfig::default());

    conn.recv(app_packet(0, &[stream_frame(0, 4, b"EF", true)], 10)).unwrap();
    assert!(conn.read_stream(StreamId::new(0)).unwrap().is_none());

    conn.recv(app_packet(1, &[stream_frame(0, 0, b"ABCD", false)], 11)).unwrap();
    let (data, finished) = read_all(&mut conn, 0);
    assert_eq!(data, b"ABCDEF");
    assert!(finished);
}
