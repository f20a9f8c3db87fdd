//! Connection state machine (RFC 9000 Sections 5, 10).
//!
//! A [`Connection`] is a pure state machine: the embedding event loop feeds
//! it decrypted packet payloads (`recv`), time (`handle_timeout` at the
//! deadline from `next_timeout`), and application calls; it produces packet
//! payloads (`poll_transmit`) and application events (`poll_event`). No
//! sockets, no clocks, no threads.

#![forbid(unsafe_code)]

pub mod cid;
pub mod tls;


pub use cid::CidManager;
pub use tls::{CryptoStream, HandshakeDriver, StubHandshake, TlsEvent};

use crate::error::{Error, Result};
use crate::flow_control::{RecvWindow, SendWindow};
use crate::frames::{
    ConnectionCloseFrame, DataBlockedFrame, Frame, FrameIter, FrameSerializer, MaxDataFrame,
    MaxStreamDataFrame, MaxStreamsFrame, NewTokenFrame, ResetStreamFrame, StopSendingFrame,
    StreamDataBlockedFrame, StreamsBlockedFrame, CryptoFrame,
};
use crate::packet::{PacketNumberSpace, RetransmitFrame, SentPacket};
use crate::recovery::{Recovery, TimerAction};
use crate::stream::{StreamLookup, StreamMap, StreamsConfig};
use crate::transport::TransportParameters;
use crate::types::{
    ConnectionId, EcnCodepoint, Epoch, Instant, Side, StreamId, DEFAULT_ACK_DELAY_EXPONENT,
    MAX_DATAGRAM_SIZE,
};
use bytes::{Bytes, BytesMut};
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace, warn};

/// Wire code for "application error surfaced before the handshake finished"
/// (RFC 9000 Section 10.2.3).
const APPLICATION_ERROR_CODE: u64 = 0x0c;

/// Headroom reserved when sizing a STREAM/CRYPTO chunk against the packet
/// budget: type byte plus worst-case id/offset/length varints.
const FRAME_HEADER_MARGIN: usize = 16;

// ============================================================================
// Public Types
// ============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing exchanged yet.
    Idle,
    /// Handshake in progress.
    Opening,
    /// Handshake complete, data flows.
    Established,
    /// We sent CONNECTION_CLOSE and linger to re-send it.
    Closing,
    /// Peer sent CONNECTION_CLOSE; we only wait.
    Draining,
    /// Fully terminated.
    Closed,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub error_code: u64,
    pub frame_type: Option<u64>,
    pub reason: Bytes,
    pub is_application: bool,
    /// True if the peer initiated the close.
    pub remote: bool,
}

impl CloseReason {
    fn local_transport(error: Error, frame_type: u8, reason: &str) -> Self {
        Self {
            error_code: error.to_wire(),
            frame_type: Some(frame_type as u64),
            reason: Bytes::copy_from_slice(reason.as_bytes()),
            is_application: false,
            remote: false,
        }
    }
}

/// One decrypted packet in. Header parsing and packet protection happen
/// outside the core; what arrives is the authenticated plaintext payload
/// plus the facts the header carried.
#[derive(Debug, Clone)]
pub struct PacketInput {
    pub epoch: Epoch,
    pub packet_number: u64,
    pub payload: Bytes,
    pub recv_time: Instant,
    pub ecn: Option<EcnCodepoint>,
}

/// One plaintext packet payload out, for the protection layer to seal and
/// address.
#[derive(Debug)]
pub struct PacketOutput {
    pub epoch: Epoch,
    pub packet_number: u64,
    pub payload: Bytes,
    pub ack_eliciting: bool,

    /// ECN codepoint to set on the datagram. `None` until the embedding
    /// layer has validated the path for ECN marking.
    pub ecn: Option<EcnCodepoint>,
}

/// Application-visible happenings, drained via [`Connection::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected,
    /// Peer opened a stream.
    StreamOpened(StreamId),
    /// In-order data (or a FIN) is waiting to be read.
    StreamReadable(StreamId),
    /// The peer finished its direction cleanly.
    StreamFinished(StreamId),
    /// The peer abandoned its direction.
    StreamReset { stream_id: StreamId, error_code: u64 },
    /// The peer asked us to stop sending.
    StopSending { stream_id: StreamId, error_code: u64 },
    /// Address-validation token for future connections (client only).
    NewToken(Bytes),
    /// The connection is going away; all blocked calls should fail.
    Closed(CloseReason),
}

/// Configuration fixed at connection creation.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Transport parameters we advertise.
    pub local_params: TransportParameters,

    /// Maximum packet payload we assemble.
    pub max_packet_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let mut local_params = TransportParameters::default();
        local_params.initial_max_data = 1 << 20;
        local_params.initial_max_stream_data_bidi_local = 1 << 19;
        local_params.initial_max_stream_data_bidi_remote = 1 << 19;
        local_params.initial_max_stream_data_uni = 1 << 19;
        local_params.initial_max_streams_bidi = 100;
        local_params.initial_max_streams_uni = 100;
        local_params.max_idle_timeout = 30_000;
        Self {
            local_params,
            max_packet_size: MAX_DATAGRAM_SIZE,
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub smoothed_rtt: Duration,
    pub congestion_window: u64,
    pub bytes_in_flight: u64,
}

// ============================================================================
// Pending Control Frames
// ============================================================================

/// Control frames owed to the peer, set by state changes and loss feedback,
/// drained by packet assembly.
#[derive(Debug, Default)]
struct Pending {
    max_data: bool,
    max_stream_data: BTreeSet<u64>,
    max_streams_bidi: bool,
    max_streams_uni: bool,
    streams_blocked_bidi: Option<u64>,
    streams_blocked_uni: Option<u64>,
    handshake_done: bool,
    path_response: VecDeque<[u8; 8]>,
    reset_stream: BTreeSet<u64>,
    stop_sending: BTreeMap<u64, u64>,
    new_token: VecDeque<Bytes>,
    ping: bool,
}

// ============================================================================
// Connection
// ============================================================================

pub struct Connection {
    side: Side,
    state: ConnectionState,
    config: ConnectionConfig,

    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,

    tls: Box<dyn HandshakeDriver>,
    crypto: [CryptoStream; Epoch::COUNT],
    spaces: [PacketNumberSpace; Epoch::COUNT],

    streams: StreamMap,
    flow_rx: RecvWindow,
    flow_tx: SendWindow,

    recovery: Recovery,
    cids: CidManager,

    pending: Pending,
    events: VecDeque<ConnectionEvent>,

    close: Option<CloseReason>,
    close_needs_tx: bool,
    closing_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,

    probe_epoch: Option<Epoch>,
    probes_pending: u32,

    handshake_confirmed: bool,
    stats: ConnectionStats,
}

impl Connection {
    pub fn new_client(
        scid: ConnectionId,
        dcid: ConnectionId,
        config: ConnectionConfig,
        tls: Box<dyn HandshakeDriver>,
    ) -> Self {
        Self::new(Side::Client, scid, dcid, config, tls)
    }

    pub fn new_server(
        scid: ConnectionId,
        dcid: ConnectionId,
        config: ConnectionConfig,
        tls: Box<dyn HandshakeDriver>,
    ) -> Self {
        Self::new(Side::Server, scid, dcid, config, tls)
    }

    fn new(
        side: Side,
        scid: ConnectionId,
        dcid: ConnectionId,
        config: ConnectionConfig,
        mut tls: Box<dyn HandshakeDriver>,
    ) -> Self {
        let local_params = config.local_params.clone();

        let mut raw_params = BytesMut::new();
        local_params.encode(&mut raw_params);
        tls.set_transport_parameters(raw_params.freeze());

        let streams_config = StreamsConfig {
            local_max_streams_bidi: local_params.initial_max_streams_bidi,
            local_max_streams_uni: local_params.initial_max_streams_uni,
            local_max_stream_data_bidi_local: local_params.initial_max_stream_data_bidi_local,
            local_max_stream_data_bidi_remote: local_params.initial_max_stream_data_bidi_remote,
            local_max_stream_data_uni: local_params.initial_max_stream_data_uni,
            // Peer limits stay zero until its transport parameters arrive.
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            peer_max_stream_data_bidi_local: 0,
            peer_max_stream_data_bidi_remote: 0,
            peer_max_stream_data_uni: 0,
        };

        let mut cids = CidManager::new(scid, local_params.active_connection_id_limit);
        cids.set_initial_remote(dcid);

        Self {
            side,
            state: ConnectionState::Opening,
            flow_rx: RecvWindow::new(local_params.initial_max_data),
            flow_tx: SendWindow::new(0),
            streams: StreamMap::new(side, streams_config),
            local_params,
            peer_params: None,
            tls,
            crypto: [CryptoStream::new(), CryptoStream::new(), CryptoStream::new()],
            spaces: [
                PacketNumberSpace::new(Epoch::Initial),
                PacketNumberSpace::new(Epoch::Handshake),
                PacketNumberSpace::new(Epoch::Application),
            ],
            recovery: Recovery::new(),
            cids,
            pending: Pending::default(),
            events: VecDeque::new(),
            close: None,
            close_needs_tx: false,
            closing_deadline: None,
            idle_deadline: None,
            probe_epoch: None,
            probes_pending: 0,
            handshake_confirmed: false,
            stats: ConnectionStats::default(),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// An active local CID, or `None` once the connection has closed.
    pub fn local_cid(&self) -> Option<&ConnectionId> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.cids.active_local()
    }

    /// Closure record, if the connection is (or is becoming) closed.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close.as_ref()
    }

    /// Snapshot of connection counters.
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.smoothed_rtt = self.recovery.rtt.smoothed_rtt();
        stats.congestion_window = self.recovery.cc.window();
        stats.bytes_in_flight = self.recovery.cc.bytes_in_flight();
        stats
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Process one decrypted packet payload.
    ///
    /// Frames are handled in wire order. Any wire or state-machine error
    /// closes the connection with the offending frame type and surfaces the
    /// same error here.
    pub fn recv(&mut self, packet: PacketInput) -> Result<()> {
        let now = packet.recv_time;
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.payload.len() as u64;

        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => return Ok(()),
            ConnectionState::Closing => {
                // Keep answering with CONNECTION_CLOSE until the peer goes
                // quiet or answers in kind.
                self.close_needs_tx = true;
                for frame in FrameIter::new(packet.payload, packet.epoch).flatten() {
                    if let Frame::ConnectionClose(f) = frame {
                        self.enter_draining(f, now);
                        break;
                    }
                }
                return Ok(());
            }
            _ => {}
        }

        self.refresh_idle(now);

        let idx = packet.epoch.index();
        if self.spaces[idx].discarded || self.spaces[idx].recv.contains(packet.packet_number) {
            trace!(pn = packet.packet_number, epoch = ?packet.epoch, "duplicate or stale packet");
            return Ok(());
        }

        // Decode the whole payload first: a malformed frame poisons the
        // packet and no partial state change survives.
        let mut frames = Vec::new();
        let mut iter = FrameIter::new(packet.payload.clone(), packet.epoch);
        loop {
            match iter.next() {
                Some(Ok(frame)) => frames.push(frame),
                Some(Err(e)) => {
                    let offending = iter.offending_type();
                    warn!(?e, frame_type = offending, "frame decode failed");
                    self.err_close(e, offending, "frame decode failed", now);
                    return Err(e);
                }
                None => break,
            }
        }

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let immediate_ack = frames.iter().any(|f| match f {
            Frame::Stream(s) => s.fin,
            Frame::HandshakeDone | Frame::ResetStream(_) | Frame::ConnectionClose(_) => true,
            _ => false,
        });
        self.spaces[idx].on_received(
            packet.packet_number,
            now,
            ack_eliciting,
            packet.ecn,
            immediate_ack,
        );

        for frame in frames {
            let code = frame.code();
            self.spaces[idx].rx_frames.insert(code);
            if let Err(e) = self.handle_frame(packet.epoch, frame, now) {
                warn!(?e, frame_type = code, "frame processing failed");
                self.err_close(e, code, "frame processing failed", now);
                return Err(e);
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, epoch: Epoch, frame: Frame, now: Instant) -> Result<()> {
        let idx = epoch.index();
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack(ack) => {
                let exponent = if epoch == Epoch::Application {
                    self.peer_params
                        .as_ref()
                        .map_or(DEFAULT_ACK_DELAY_EXPONENT, |p| p.ack_delay_exponent)
                } else {
                    DEFAULT_ACK_DELAY_EXPONENT
                };
                let outcome =
                    self.recovery
                        .on_ack_received(&mut self.spaces[idx], &ack, exponent, now)?;

                // ECN-CE growth reported by the peer is a congestion event
                // anchored at the largest acked packet's send time.
                if let Some(ecn) = ack.ecn {
                    let space = &mut self.spaces[idx];
                    if ecn.ce > space.peer_ce_seen {
                        space.peer_ce_seen = ecn.ce;
                        let at = outcome.largest_acked_sent_time.unwrap_or(now);
                        self.recovery.cc.on_congestion_event(at, now);
                    }
                }

                for meta in &outcome.newly_acked {
                    self.on_packet_acked(meta);
                }
                for meta in &outcome.lost {
                    self.stats.packets_lost += 1;
                    self.on_packet_lost(epoch, meta);
                }
            }

            Frame::Crypto(f) => {
                self.crypto[idx].recv(f.offset, f.data);
                while let Some(chunk) = self.crypto[idx].take_recv() {
                    self.tls.crypto_received(epoch, &chunk)?;
                }
                self.pump_tls(now)?;
            }

            Frame::Stream(f) => {
                let existed = self.streams.get(f.stream_id).is_some();
                match self.streams.get_or_create(f.stream_id, true)? {
                    StreamLookup::Closed => {
                        trace!(sid = %f.stream_id, "frame for closed stream ignored");
                    }
                    StreamLookup::Stream(stream) => {
                        let recv = stream.recv.as_mut().ok_or(Error::StreamStateError)?;
                        let update = recv.on_frame(f.offset, f.data, f.fin, &mut self.flow_rx)?;

                        if !existed {
                            self.events.push_back(ConnectionEvent::StreamOpened(f.stream_id));
                        }
                        if update.readable {
                            self.events
                                .push_back(ConnectionEvent::StreamReadable(f.stream_id));
                        }
                        if update.finished {
                            self.events
                                .push_back(ConnectionEvent::StreamFinished(f.stream_id));
                        }
                        self.after_stream_activity(f.stream_id);
                    }
                }
            }

            Frame::ResetStream(f) => {
                match self.streams.get_or_create(f.stream_id, true)? {
                    StreamLookup::Closed => {}
                    StreamLookup::Stream(stream) => {
                        let recv = stream.recv.as_mut().ok_or(Error::StreamStateError)?;
                        if recv.on_reset(f.error_code, f.final_size, &mut self.flow_rx)? {
                            self.events.push_back(ConnectionEvent::StreamReset {
                                stream_id: f.stream_id,
                                error_code: f.error_code,
                            });
                        }
                        self.after_stream_activity(f.stream_id);
                    }
                }
            }

            Frame::StopSending(f) => {
                match self.streams.get_or_create(f.stream_id, false)? {
                    StreamLookup::Closed => {}
                    StreamLookup::Stream(stream) => {
                        let send = stream.send.as_mut().ok_or(Error::StreamStateError)?;
                        if send.reset(f.error_code).is_some() {
                            self.pending.reset_stream.insert(f.stream_id.value());
                            self.events.push_back(ConnectionEvent::StopSending {
                                stream_id: f.stream_id,
                                error_code: f.error_code,
                            });
                        }
                    }
                }
            }

            Frame::MaxData(f) => self.flow_tx.on_max_data(f.maximum_data),

            Frame::MaxStreamData(f) => match self.streams.get_or_create(f.stream_id, false)? {
                StreamLookup::Closed => {}
                StreamLookup::Stream(stream) => {
                    let send = stream.send.as_mut().ok_or(Error::StreamStateError)?;
                    send.flow.on_max_data(f.maximum_stream_data);
                }
            },

            Frame::MaxStreams(f) => {
                self.streams.on_peer_max_streams(f.bidirectional, f.maximum_streams);
            }

            Frame::DataBlocked(_) => {
                // Peer claims our limit pinches; answer with MAX_DATA even
                // if the window has not moved.
                self.flow_rx.force_update();
                self.pending.max_data = true;
            }

            Frame::StreamDataBlocked(f) => match self.streams.get_or_create(f.stream_id, true)? {
                StreamLookup::Closed => {}
                StreamLookup::Stream(stream) => {
                    let recv = stream.recv.as_mut().ok_or(Error::StreamStateError)?;
                    recv.flow.force_update();
                    self.pending.max_stream_data.insert(f.stream_id.value());
                }
            },

            Frame::StreamsBlocked(f) => {
                if f.bidirectional {
                    self.pending.max_streams_bidi = true;
                } else {
                    self.pending.max_streams_uni = true;
                }
            }

            Frame::NewConnectionId(f) => self.cids.on_new_cid(&f)?,

            Frame::RetireConnectionId(f) => self.cids.on_retire(f.sequence_number)?,

            Frame::PathChallenge(data) => {
                self.pending.path_response.push_back(data);
            }

            Frame::PathResponse(_) => {
                // We never initiate path validation; stray responses are
                // ignorable.
            }

            Frame::ConnectionClose(f) => {
                self.enter_draining(f, now);
            }

            Frame::HandshakeDone => {
                if self.side == Side::Server {
                    return Err(Error::ProtocolViolation);
                }
                self.confirm_handshake(now);
            }

            Frame::NewToken(f) => {
                if self.side == Side::Server {
                    return Err(Error::ProtocolViolation);
                }
                self.events.push_back(ConnectionEvent::NewToken(f.token));
            }
        }
        Ok(())
    }

    /// Complete stream/crypto bookkeeping for a newly acknowledged packet.
    fn on_packet_acked(&mut self, meta: &SentPacket) {
        for item in &meta.retransmits {
            match item {
                RetransmitFrame::Stream { stream_id, offset, len, fin } => {
                    if let Some(send) = self
                        .streams
                        .get_mut(*stream_id)
                        .and_then(|s| s.send.as_mut())
                    {
                        send.on_ack(*offset, *len, *fin);
                    }
                    self.after_stream_activity(*stream_id);
                }
                RetransmitFrame::Crypto { epoch, offset, len } => {
                    self.crypto[epoch.index()].on_ack(*offset, *len);
                }
                RetransmitFrame::ResetStream { stream_id } => {
                    if let Some(send) = self
                        .streams
                        .get_mut(*stream_id)
                        .and_then(|s| s.send.as_mut())
                    {
                        send.on_reset_acked();
                    }
                    self.after_stream_activity(*stream_id);
                }
                _ => {}
            }
        }
    }

    /// Re-queue the retransmittable content of a lost packet.
    fn on_packet_lost(&mut self, epoch: Epoch, meta: &SentPacket) {
        debug!(pn = meta.packet_number, ?epoch, "requeueing lost packet content");
        for item in &meta.retransmits {
            match item {
                RetransmitFrame::Stream { stream_id, offset, len, fin } => {
                    if let Some(send) = self
                        .streams
                        .get_mut(*stream_id)
                        .and_then(|s| s.send.as_mut())
                    {
                        send.on_loss(*offset, *len, *fin);
                    }
                }
                RetransmitFrame::Crypto { epoch, offset, len } => {
                    self.crypto[epoch.index()].on_loss(*offset, *len);
                }
                RetransmitFrame::MaxData => self.pending.max_data = true,
                RetransmitFrame::MaxStreamData { stream_id } => {
                    if self.streams.get(*stream_id).is_some() {
                        self.pending.max_stream_data.insert(stream_id.value());
                    }
                }
                RetransmitFrame::MaxStreams { bidirectional } => {
                    if *bidirectional {
                        self.pending.max_streams_bidi = true;
                    } else {
                        self.pending.max_streams_uni = true;
                    }
                }
                RetransmitFrame::ResetStream { stream_id } => {
                    if self.streams.get(*stream_id).is_some() {
                        self.pending.reset_stream.insert(stream_id.value());
                    }
                }
                RetransmitFrame::StopSending { stream_id, error_code } => {
                    if self.streams.get(*stream_id).is_some() {
                        self.pending.stop_sending.insert(stream_id.value(), *error_code);
                    }
                }
                RetransmitFrame::NewConnectionId { sequence_number } => {
                    self.cids.requeue_new_cid(*sequence_number);
                }
                RetransmitFrame::RetireConnectionId { sequence_number } => {
                    self.cids.requeue_retire(*sequence_number);
                }
                RetransmitFrame::NewToken { token } => {
                    self.pending.new_token.push_back(token.clone());
                }
                RetransmitFrame::HandshakeDone => self.pending.handshake_done = true,
                // Path responses answer a specific challenge; a lost one is
                // re-elicited by the peer, not by us.
                RetransmitFrame::PathResponse { .. } => {}
                RetransmitFrame::DataBlocked
                | RetransmitFrame::StreamDataBlocked { .. }
                | RetransmitFrame::StreamsBlocked { .. }
                | RetransmitFrame::Ping => {}
            }
        }
    }

    /// Retire fully-closed streams and keep limit advertisements flowing.
    fn after_stream_activity(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get(id) else {
            return;
        };
        if stream.is_closed() && stream.is_drained() {
            debug!(sid = %id, "stream closed");
            self.streams.retire(id);
            if id.initiator() != self.side {
                if id.is_bidirectional() {
                    self.pending.max_streams_bidi = true;
                } else {
                    self.pending.max_streams_uni = true;
                }
            }
            return;
        }
        if let Some(recv) = &stream.recv {
            if recv.flow.wants_update() {
                self.pending.max_stream_data.insert(id.value());
            }
        }
        if self.flow_rx.wants_update() {
            self.pending.max_data = true;
        }
    }

    // ------------------------------------------------------------------
    // TLS plumbing
    // ------------------------------------------------------------------

    fn pump_tls(&mut self, now: Instant) -> Result<()> {
        while let Some(event) = self.tls.poll_event() {
            match event {
                TlsEvent::HandshakeComplete => self.on_handshake_complete(now),
                TlsEvent::EarlyDataAccepted => {
                    debug!("early data accepted");
                }
                TlsEvent::NewSessionTicket(_) | TlsEvent::KeyUpdate => {}
            }
        }

        if self.peer_params.is_none() {
            if let Some(raw) = self.tls.peer_transport_parameters() {
                let params = TransportParameters::decode(raw)?;
                self.apply_peer_params(params);
            }
        }

        for epoch in Epoch::ALL {
            while let Some(bytes) = self.tls.poll_crypto(epoch) {
                self.crypto[epoch.index()].write(bytes);
            }
        }
        Ok(())
    }

    fn apply_peer_params(&mut self, params: TransportParameters) {
        debug!("peer transport parameters applied");
        self.flow_tx.on_max_data(params.initial_max_data);
        self.streams.set_peer_limits(
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
            params.initial_max_stream_data_bidi_local,
            params.initial_max_stream_data_bidi_remote,
            params.initial_max_stream_data_uni,
        );
        self.recovery
            .set_max_ack_delay(Duration::from_millis(params.max_ack_delay));
        self.cids.set_peer_cid_limit(params.active_connection_id_limit);
        self.peer_params = Some(params);
    }

    fn on_handshake_complete(&mut self, now: Instant) {
        if self.state != ConnectionState::Opening && self.state != ConnectionState::Idle {
            return;
        }
        debug!(side = ?self.side, "handshake complete");
        self.state = ConnectionState::Established;
        self.events.push_back(ConnectionEvent::Connected);
        self.discard_space(Epoch::Initial);
        if self.side == Side::Server {
            // The server confirms; HANDSHAKE_DONE tells the client to.
            self.pending.handshake_done = true;
            self.confirm_handshake(now);
        }
        self.cids.replenish();
        self.refresh_idle(now);
    }

    fn confirm_handshake(&mut self, _now: Instant) {
        if !self.handshake_confirmed {
            self.handshake_confirmed = true;
            self.discard_space(Epoch::Initial);
            self.discard_space(Epoch::Handshake);
        }
    }

    fn discard_space(&mut self, epoch: Epoch) {
        let space = &mut self.spaces[epoch.index()];
        if space.discarded {
            return;
        }
        debug!(?epoch, "discarding packet number space");
        for meta in space.discard() {
            if meta.in_flight {
                self.recovery.cc.on_packet_removed(meta.size);
            }
        }
    }

    // ------------------------------------------------------------------
    // Stream API
    // ------------------------------------------------------------------

    /// Open a locally-initiated stream. At the peer's stream limit this
    /// fails with STREAM_LIMIT_ERROR and queues STREAMS_BLOCKED.
    pub fn open_stream(&mut self, bidi: bool) -> Result<StreamId> {
        if !self.is_active() {
            return Err(Error::InternalError);
        }
        match self.streams.open(bidi) {
            Ok(id) => Ok(id),
            Err(limit) => {
                if bidi {
                    self.pending.streams_blocked_bidi = Some(limit);
                } else {
                    self.pending.streams_blocked_uni = Some(limit);
                }
                Err(Error::StreamLimitError)
            }
        }
    }

    /// Append data (and optionally FIN) to a stream's send queue.
    pub fn write(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        if !self.is_active() {
            return Err(Error::InternalError);
        }
        let stream = self.streams.get_mut(id).ok_or(Error::StreamStateError)?;
        let send = stream.send.as_mut().ok_or(Error::StreamStateError)?;
        send.write(data, fin)
    }

    /// First stream with data (or a FIN/reset) waiting for the application.
    pub fn readable_stream(&self) -> Option<StreamId> {
        self.streams.first_readable()
    }

    /// Drain one chunk from a stream's receive queue. The bool reports
    /// end-of-stream.
    pub fn read_stream(&mut self, id: StreamId) -> Result<Option<(Bytes, bool)>> {
        let Some(stream) = self.streams.get_mut(id) else {
            // Reading a retired stream is not an error, just empty.
            return Ok(None);
        };
        let recv = stream.recv.as_mut().ok_or(Error::StreamStateError)?;
        let Some((chunk, fin)) = recv.read() else {
            return Ok(None);
        };
        self.flow_rx.on_consumed(chunk.len() as u64);
        self.after_stream_activity(id);
        Ok(Some((chunk, fin)))
    }

    /// Abort our sending direction (RESET_STREAM).
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        let stream = self.streams.get_mut(id).ok_or(Error::StreamStateError)?;
        let send = stream.send.as_mut().ok_or(Error::StreamStateError)?;
        if send.reset(error_code).is_some() {
            self.pending.reset_stream.insert(id.value());
        }
        Ok(())
    }

    /// Ask the peer to stop sending (STOP_SENDING).
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) -> Result<()> {
        let stream = self.streams.get(id).ok_or(Error::StreamStateError)?;
        if stream.recv.is_none() {
            return Err(Error::StreamStateError);
        }
        self.pending.stop_sending.insert(id.value(), error_code);
        Ok(())
    }

    /// Queue a PING, e.g. as a keep-alive.
    pub fn ping(&mut self) {
        if self.is_active() {
            self.pending.ping = true;
        }
    }

    /// Hand the client a token for future address validation (server API).
    pub fn send_token(&mut self, token: Bytes) -> Result<()> {
        if self.side != Side::Server {
            return Err(Error::InternalError);
        }
        self.pending.new_token.push_back(token);
        Ok(())
    }

    /// Close gracefully with an application error.
    pub fn close(&mut self, error_code: u64, reason: &[u8], now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Opening | ConnectionState::Established
        ) {
            return;
        }
        let reason = CloseReason {
            error_code,
            frame_type: None,
            reason: Bytes::copy_from_slice(reason),
            is_application: true,
            remote: false,
        };
        self.begin_closing(reason, now);
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Established
        )
    }

    // ------------------------------------------------------------------
    // Closure
    // ------------------------------------------------------------------

    /// Local error close: record, transition to Closing, arm the 3xPTO
    /// closing timer, and schedule CONNECTION_CLOSE.
    fn err_close(&mut self, error: Error, frame_type: u8, reason: &str, now: Instant) {
        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Opening | ConnectionState::Established
        ) {
            return;
        }
        warn!(?error, frame_type, reason, "closing connection");
        self.begin_closing(CloseReason::local_transport(error, frame_type, reason), now);
    }

    fn begin_closing(&mut self, reason: CloseReason, now: Instant) {
        self.state = ConnectionState::Closing;
        self.close_needs_tx = true;
        self.closing_deadline = Some(now + self.recovery.pto(Epoch::Application) * 3);
        self.events.push_back(ConnectionEvent::Closed(reason.clone()));
        self.close = Some(reason);
    }

    /// Peer-initiated close: transition to Draining; we send nothing more.
    fn enter_draining(&mut self, frame: ConnectionCloseFrame, now: Instant) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        debug!(code = frame.error_code, "peer closed the connection");
        let reason = CloseReason {
            error_code: frame.error_code,
            frame_type: frame.frame_type,
            reason: frame.reason,
            is_application: frame.frame_type.is_none(),
            remote: true,
        };
        self.state = ConnectionState::Draining;
        self.close_needs_tx = false;
        self.closing_deadline = Some(now + self.recovery.pto(Epoch::Application) * 3);
        self.events.push_back(ConnectionEvent::Closed(reason.clone()));
        self.close = Some(reason);
    }

    fn refresh_idle(&mut self, now: Instant) {
        let local = self.local_params.max_idle_timeout;
        let peer = self.peer_params.as_ref().map_or(0, |p| p.max_idle_timeout);
        let effective = match (local, peer) {
            (0, 0) => return,
            (0, p) => p,
            (l, 0) => l,
            (l, p) => l.min(p),
        };
        self.idle_deadline = Some(now + Duration::from_millis(effective));
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Earliest deadline at which [`Self::handle_timeout`] needs to run.
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Closed => None,
            ConnectionState::Closing | ConnectionState::Draining => self.closing_deadline,
            _ => {
                let mut deadline: Option<Instant> = None;
                let mut consider = |t: Option<Instant>| {
                    deadline = match (deadline, t) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                };
                for space in &self.spaces {
                    consider(space.ack_deadline());
                }
                consider(self.recovery.loss_detection_timer(&self.spaces));
                consider(self.idle_deadline);
                deadline
            }
        }
    }

    /// Drive expired timers: closing/draining completion, idle timeout,
    /// loss detection and PTO.
    pub fn handle_timeout(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Closed => {}
            ConnectionState::Closing | ConnectionState::Draining => {
                if self.closing_deadline.is_some_and(|t| t <= now) {
                    debug!("closing period over");
                    self.state = ConnectionState::Closed;
                }
            }
            _ => {
                if self.idle_deadline.is_some_and(|t| t <= now) {
                    // Idle timeout closes silently: no CONNECTION_CLOSE.
                    debug!("idle timeout");
                    self.state = ConnectionState::Closed;
                    self.close = Some(CloseReason {
                        error_code: Error::NoError.to_wire(),
                        frame_type: None,
                        reason: Bytes::from_static(b"idle timeout"),
                        is_application: false,
                        remote: false,
                    });
                    self.events
                        .push_back(ConnectionEvent::Closed(self.close.clone().expect("just set")));
                    return;
                }

                if self
                    .recovery
                    .loss_detection_timer(&self.spaces)
                    .is_some_and(|t| t <= now)
                {
                    match self.recovery.on_loss_detection_timeout(&mut self.spaces, now) {
                        TimerAction::Lost(epoch, lost) => {
                            for meta in &lost {
                                self.stats.packets_lost += 1;
                                self.on_packet_lost(epoch, meta);
                            }
                        }
                        TimerAction::Probe { epoch, count } => {
                            self.probe_epoch = Some(epoch);
                            self.probes_pending = count;
                        }
                        TimerAction::None => {}
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    /// Assemble the next outgoing packet payload, or `None` when idle.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<PacketOutput> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => None,
            ConnectionState::Closing => self.emit_close(now),
            _ => {
                if let Err(e) = self.pump_tls(now) {
                    self.err_close(e, 0, "handshake failure", now);
                    return self.emit_close(now);
                }
                self.assemble(now)
            }
        }
    }

    fn emit_close(&mut self, _now: Instant) -> Option<PacketOutput> {
        if !self.close_needs_tx {
            return None;
        }
        self.close_needs_tx = false;
        let close = self.close.as_ref()?;

        let epoch = if self.spaces[Epoch::Application.index()].largest_received.is_some()
            || self.is_established()
        {
            Epoch::Application
        } else if self.spaces[Epoch::Handshake.index()].largest_received.is_some() {
            Epoch::Handshake
        } else {
            Epoch::Initial
        };

        // An application close cannot appear before the Application epoch;
        // it degrades to APPLICATION_ERROR (RFC 9000 Section 10.2.3).
        let frame = if close.is_application && epoch != Epoch::Application {
            ConnectionCloseFrame {
                error_code: APPLICATION_ERROR_CODE,
                frame_type: Some(0),
                reason: Bytes::new(),
            }
        } else {
            ConnectionCloseFrame {
                error_code: close.error_code,
                frame_type: if close.is_application {
                    None
                } else {
                    close.frame_type.or(Some(0))
                },
                reason: close.reason.clone(),
            }
        };

        let mut buf = BytesMut::with_capacity(self.config.max_packet_size);
        FrameSerializer.serialize_frame(&Frame::ConnectionClose(frame), &mut buf);
        let pn = self.spaces[epoch.index()].next_packet_number();
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        Some(PacketOutput {
            epoch,
            packet_number: pn,
            payload: buf.freeze(),
            ack_eliciting: false,
            ecn: None,
        })
    }

    fn choose_epoch(&self, now: Instant) -> Option<Epoch> {
        for epoch in Epoch::ALL {
            let idx = epoch.index();
            if self.spaces[idx].discarded {
                continue;
            }
            if self.crypto[idx].has_pending()
                || self.spaces[idx].ack_due(now)
                || (self.probe_epoch == Some(epoch) && self.probes_pending > 0)
            {
                return Some(epoch);
            }
            if epoch == Epoch::Application && self.app_has_content() {
                return Some(epoch);
            }
        }
        None
    }

    fn app_has_content(&self) -> bool {
        let p = &self.pending;
        p.max_data
            || !p.max_stream_data.is_empty()
            || p.max_streams_bidi
            || p.max_streams_uni
            || p.streams_blocked_bidi.is_some()
            || p.streams_blocked_uni.is_some()
            || p.handshake_done
            || !p.path_response.is_empty()
            || !p.reset_stream.is_empty()
            || !p.stop_sending.is_empty()
            || !p.new_token.is_empty()
            || p.ping
            || self.cids.has_pending()
            || self.flow_rx.wants_update()
            || self.streams_have_data()
    }

    fn streams_have_data(&self) -> bool {
        // Retransmissions always qualify; fresh data needs window room.
        self.streams
            .iter()
            .any(|s| s.send.as_ref().is_some_and(|send| send.has_pending()))
    }

    fn assemble(&mut self, now: Instant) -> Option<PacketOutput> {
        let epoch = self.choose_epoch(now)?;
        let idx = epoch.index();
        let serializer = FrameSerializer;
        let budget = self.config.max_packet_size;
        let mut buf = BytesMut::with_capacity(budget);
        let mut meta = SentPacket::new(0, now, 0);

        // ACK first; it rides for free and must not be starved by data.
        if self.spaces[idx].ack_due(now) {
            let exponent = if epoch == Epoch::Application {
                self.local_params.ack_delay_exponent
            } else {
                DEFAULT_ACK_DELAY_EXPONENT
            };
            if let Some(ack) = self.spaces[idx].build_ack(now, exponent) {
                meta.acked_up_to = Some(ack.largest_acked);
                let frame = Frame::Ack(ack);
                meta.frames.insert(frame.code());
                serializer.serialize_frame(&frame, &mut buf);
            }
        }

        let probing = self.probe_epoch == Some(epoch) && self.probes_pending > 0;
        let congestion_room = probing || self.recovery.cc.available() > 0;

        if congestion_room {
            // CRYPTO data.
            while budget.saturating_sub(buf.len()) > FRAME_HEADER_MARGIN {
                let room = budget - buf.len() - FRAME_HEADER_MARGIN;
                let Some((offset, data)) = self.crypto[idx].poll_transmit(room) else {
                    break;
                };
                let len = data.len() as u64;
                let frame = Frame::Crypto(CryptoFrame { offset, data });
                meta.frames.insert(frame.code());
                meta.retransmits.push(RetransmitFrame::Crypto { epoch, offset, len });
                meta.ack_eliciting = true;
                serializer.serialize_frame(&frame, &mut buf);
            }

            if epoch == Epoch::Application {
                self.assemble_control(&mut buf, &mut meta, budget);
                self.assemble_stream_data(&mut buf, &mut meta, budget);
            }
        }

        // PTO probe: PING if the packet would otherwise not elicit an ACK.
        if probing {
            if !meta.ack_eliciting && budget - buf.len() >= 1 {
                let frame = Frame::Ping;
                meta.frames.insert(frame.code());
                meta.retransmits.push(RetransmitFrame::Ping);
                meta.ack_eliciting = true;
                serializer.serialize_frame(&frame, &mut buf);
            }
            self.probes_pending = self.probes_pending.saturating_sub(1);
            if self.probes_pending == 0 {
                self.probe_epoch = None;
            }
        } else if self.pending.ping && budget - buf.len() >= 1 {
            self.pending.ping = false;
            let frame = Frame::Ping;
            meta.frames.insert(frame.code());
            meta.ack_eliciting = true;
            serializer.serialize_frame(&frame, &mut buf);
        }

        if buf.is_empty() {
            return None;
        }

        let pn = self.spaces[idx].next_packet_number();
        meta.packet_number = pn;
        meta.size = buf.len();
        meta.in_flight = meta.ack_eliciting;
        let ack_eliciting = meta.ack_eliciting;
        self.recovery.on_packet_sent(&mut self.spaces[idx], meta, now);

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        trace!(pn, ?epoch, len = buf.len(), ack_eliciting, "packet assembled");

        Some(PacketOutput {
            epoch,
            packet_number: pn,
            payload: buf.freeze(),
            ack_eliciting,
            ecn: None,
        })
    }

    /// Emit pending control frames into `buf`, budget permitting. Anything
    /// that does not fit stays queued for the next packet.
    fn assemble_control(&mut self, buf: &mut BytesMut, meta: &mut SentPacket, budget: usize) {
        let serializer = FrameSerializer;
        let push = |frame: Frame,
                    retransmit: Option<RetransmitFrame>,
                    buf: &mut BytesMut,
                    meta: &mut SentPacket|
         -> bool {
            if serializer.frame_size(&frame) > budget - buf.len() {
                return false;
            }
            meta.frames.insert(frame.code());
            if let Some(r) = retransmit {
                meta.retransmits.push(r);
            }
            meta.ack_eliciting |= frame.is_ack_eliciting();
            serializer.serialize_frame(&frame, buf);
            true
        };

        if self.pending.handshake_done {
            if push(Frame::HandshakeDone, Some(RetransmitFrame::HandshakeDone), buf, meta) {
                self.pending.handshake_done = false;
            }
        }

        while let Some(&data) = self.pending.path_response.front() {
            let frame = Frame::PathResponse(data);
            if !push(frame, Some(RetransmitFrame::PathResponse { data }), buf, meta) {
                break;
            }
            self.pending.path_response.pop_front();
        }

        // RESET_STREAM / STOP_SENDING.
        let reset_ids: Vec<u64> = self.pending.reset_stream.iter().copied().collect();
        for sid in reset_ids {
            let id = StreamId::new(sid);
            let Some((error_code, final_size)) = self
                .streams
                .get(id)
                .and_then(|s| s.send.as_ref())
                .and_then(|send| send.reset_state())
            else {
                self.pending.reset_stream.remove(&sid);
                continue;
            };
            let frame = Frame::ResetStream(ResetStreamFrame {
                stream_id: id,
                error_code,
                final_size,
            });
            if push(frame, Some(RetransmitFrame::ResetStream { stream_id: id }), buf, meta) {
                self.pending.reset_stream.remove(&sid);
            }
        }

        let stop_ids: Vec<(u64, u64)> = self
            .pending
            .stop_sending
            .iter()
            .map(|(&sid, &code)| (sid, code))
            .collect();
        for (sid, error_code) in stop_ids {
            let id = StreamId::new(sid);
            let frame = Frame::StopSending(StopSendingFrame { stream_id: id, error_code });
            if push(
                frame,
                Some(RetransmitFrame::StopSending { stream_id: id, error_code }),
                buf,
                meta,
            ) {
                self.pending.stop_sending.remove(&sid);
            }
        }

        // Connection and stream flow-control updates.
        if self.pending.max_data || self.flow_rx.wants_update() {
            let maximum_data = self.flow_rx.commit_update();
            let frame = Frame::MaxData(MaxDataFrame { maximum_data });
            if push(frame, Some(RetransmitFrame::MaxData), buf, meta) {
                self.pending.max_data = false;
            }
        }

        let msd_ids: Vec<u64> = self.pending.max_stream_data.iter().copied().collect();
        for sid in msd_ids {
            let id = StreamId::new(sid);
            let Some(recv) = self.streams.get_mut(id).and_then(|s| s.recv.as_mut()) else {
                self.pending.max_stream_data.remove(&sid);
                continue;
            };
            if !recv.flow.wants_update() {
                self.pending.max_stream_data.remove(&sid);
                continue;
            }
            let maximum_stream_data = recv.flow.commit_update();
            let frame = Frame::MaxStreamData(MaxStreamDataFrame {
                stream_id: id,
                maximum_stream_data,
            });
            if push(frame, Some(RetransmitFrame::MaxStreamData { stream_id: id }), buf, meta) {
                self.pending.max_stream_data.remove(&sid);
            }
        }

        if self.pending.max_streams_bidi {
            let frame = Frame::MaxStreams(MaxStreamsFrame {
                maximum_streams: self.streams.local_max_streams(true),
                bidirectional: true,
            });
            if push(frame, Some(RetransmitFrame::MaxStreams { bidirectional: true }), buf, meta) {
                self.pending.max_streams_bidi = false;
            }
        }
        if self.pending.max_streams_uni {
            let frame = Frame::MaxStreams(MaxStreamsFrame {
                maximum_streams: self.streams.local_max_streams(false),
                bidirectional: false,
            });
            if push(frame, Some(RetransmitFrame::MaxStreams { bidirectional: false }), buf, meta) {
                self.pending.max_streams_uni = false;
            }
        }

        // Blocked signals.
        if let Some(limit) = self.flow_tx.take_blocked() {
            let frame = Frame::DataBlocked(DataBlockedFrame { data_limit: limit });
            push(frame, None, buf, meta);
        }
        if let Some(limit) = self.pending.streams_blocked_bidi.take() {
            let frame = Frame::StreamsBlocked(StreamsBlockedFrame {
                stream_limit: limit,
                bidirectional: true,
            });
            push(frame, None, buf, meta);
        }
        if let Some(limit) = self.pending.streams_blocked_uni.take() {
            let frame = Frame::StreamsBlocked(StreamsBlockedFrame {
                stream_limit: limit,
                bidirectional: false,
            });
            push(frame, None, buf, meta);
        }

        // CID lifecycle.
        while let Some(ncid) = self.cids.poll_new_cid() {
            let seq = ncid.sequence_number;
            let frame = Frame::NewConnectionId(ncid);
            if !push(
                frame,
                Some(RetransmitFrame::NewConnectionId { sequence_number: seq }),
                buf,
                meta,
            ) {
                self.cids.requeue_new_cid(seq);
                break;
            }
        }
        while let Some(seq) = self.cids.poll_retire() {
            let frame = Frame::RetireConnectionId(crate::frames::RetireConnectionIdFrame {
                sequence_number: seq,
            });
            if !push(
                frame,
                Some(RetransmitFrame::RetireConnectionId { sequence_number: seq }),
                buf,
                meta,
            ) {
                self.cids.requeue_retire(seq);
                break;
            }
        }

        // Tokens (server-issued).
        while let Some(token) = self.pending.new_token.front().cloned() {
            let frame = Frame::NewToken(NewTokenFrame { token: token.clone() });
            if !push(frame, Some(RetransmitFrame::NewToken { token }), buf, meta) {
                break;
            }
            self.pending.new_token.pop_front();
        }

        // Per-stream blocked signals surface as data is polled; sweep any
        // recorded in the meantime.
        let blocked: Vec<(u64, u64)> = self
            .streams
            .iter_mut()
            .filter_map(|s| {
                let send = s.send.as_mut()?;
                send.flow.take_blocked().map(|limit| (s.id.value(), limit))
            })
            .collect();
        for (sid, limit) in blocked {
            let frame = Frame::StreamDataBlocked(StreamDataBlockedFrame {
                stream_id: StreamId::new(sid),
                stream_data_limit: limit,
            });
            push(frame, None, buf, meta);
        }
    }

    /// Fill the remaining budget with STREAM frames. The last frame in the
    /// datagram omits its length field when it runs exactly to the end.
    fn assemble_stream_data(&mut self, buf: &mut BytesMut, meta: &mut SentPacket, budget: usize) {
        let serializer = FrameSerializer;
        let ids: Vec<u64> = self
            .streams
            .iter_mut()
            .filter(|s| s.send.as_ref().is_some_and(|send| send.has_pending()))
            .map(|s| s.id.value())
            .collect();

        'outer: for sid in ids {
            let id = StreamId::new(sid);
            loop {
                let used = buf.len();
                if budget.saturating_sub(used) <= FRAME_HEADER_MARGIN {
                    break 'outer;
                }
                let room = budget - used - FRAME_HEADER_MARGIN;
                let Some(send) = self.streams.get_mut(id).and_then(|s| s.send.as_mut()) else {
                    continue 'outer;
                };
                let Some(frame) = send.poll_transmit(room, &mut self.flow_tx) else {
                    continue 'outer;
                };

                meta.retransmits.push(RetransmitFrame::Stream {
                    stream_id: id,
                    offset: frame.offset,
                    len: frame.data.len() as u64,
                    fin: frame.fin,
                });
                meta.ack_eliciting = true;
                meta.frames.insert(crate::frames::FRAME_TYPE_STREAM_BASE);

                // LEN may be dropped iff the data runs to the end of the
                // datagram.
                let with_len = serializer.frame_size(&Frame::Stream(frame.clone()));
                let without_len = with_len - crate::varint::size(frame.data.len() as u64);
                let omit_len = without_len == budget - buf.len();
                serializer.serialize_stream_frame(&frame, buf, omit_len);
                if omit_len {
                    break 'outer;
                }
            }
        }
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("state", &self.state)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}
