//! TLS boundary and per-epoch crypto streams.
//!
//! The handshake engine lives outside the core (RFC 9001 is someone else's
//! problem); this module defines the narrow surface we drive it through:
//! CRYPTO-stream bytes per epoch in and out, a handful of events, the
//! transport-parameter extension passthrough, and secret export.

#![forbid(unsafe_code)]

use crate::error::Result;
use crate::types::Epoch;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Signals surfaced by the handshake engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsEvent {
    HandshakeComplete,
    EarlyDataAccepted,
    NewSessionTicket(Bytes),
    KeyUpdate,
}

/// The handshake engine as the transport core sees it.
///
/// The driver consumes reassembled CRYPTO bytes, produces CRYPTO bytes to
/// transmit per epoch, reports progress via [`TlsEvent`]s, and carries the
/// transport-parameters extension in both directions. Packet protection is
/// not its business here: payloads reach the core already decrypted.
pub trait HandshakeDriver: Send {
    /// Feed reassembled handshake bytes received at `epoch`.
    fn crypto_received(&mut self, epoch: Epoch, data: &[u8]) -> Result<()>;

    /// Outbound handshake bytes to transmit at `epoch`, if any.
    fn poll_crypto(&mut self, epoch: Epoch) -> Option<Bytes>;

    /// Next pending handshake event.
    fn poll_event(&mut self) -> Option<TlsEvent>;

    /// Raw transport-parameters extension received from the peer, once the
    /// handshake has carried it.
    fn peer_transport_parameters(&self) -> Option<Bytes>;

    /// Install our transport-parameters extension before the handshake
    /// flight that carries it.
    fn set_transport_parameters(&mut self, raw: Bytes);

    /// Export keying material (RFC 8446 Section 7.5).
    fn export_secret(&self, label: &str, context: &[u8], len: usize) -> Result<Vec<u8>>;
}

// ============================================================================
// Crypto Streams
// ============================================================================

/// Per-epoch CRYPTO stream: offset-based reassembly on receive, offset-keyed
/// retransmission on send. Like a stream with no id, no FIN and no flow
/// control.
#[derive(Debug, Default)]
pub struct CryptoStream {
    // Receive side.
    recv_off: u64,
    ooo: BTreeMap<u64, Bytes>,
    assembled: VecDeque<Bytes>,

    // Send side.
    pending: VecDeque<Bytes>,
    pending_offset: u64,
    write_offset: u64,
    sent: BTreeMap<u64, Bytes>,
    rtx: BTreeSet<u64>,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place received crypto bytes; duplicates and already-covered prefixes
    /// are trimmed, out-of-order spans parked.
    pub fn recv(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        if end <= self.recv_off {
            return;
        }
        if offset <= self.recv_off {
            let chunk = data.slice((self.recv_off - offset) as usize..);
            self.recv_off = end;
            self.assembled.push_back(chunk);
            self.drain_ooo();
        } else if !self.ooo.contains_key(&offset) {
            self.ooo.insert(offset, data);
        }
    }

    fn drain_ooo(&mut self) {
        while let Some((&off, _)) = self.ooo.first_key_value() {
            if off > self.recv_off {
                break;
            }
            let chunk = self.ooo.remove(&off).unwrap_or_default();
            let end = off + chunk.len() as u64;
            if end <= self.recv_off {
                continue;
            }
            let chunk = chunk.slice((self.recv_off - off) as usize..);
            self.recv_off = end;
            self.assembled.push_back(chunk);
        }
    }

    /// Next reassembled in-order span for the handshake driver.
    pub fn take_recv(&mut self) -> Option<Bytes> {
        self.assembled.pop_front()
    }

    /// Queue outbound handshake bytes.
    pub fn write(&mut self, data: Bytes) {
        self.write_offset += data.len() as u64;
        if !data.is_empty() {
            self.pending.push_back(data);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.rtx.is_empty()
    }

    /// Next CRYPTO span to transmit, retransmissions first.
    /// Returns `(offset, data)`.
    pub fn poll_transmit(&mut self, max_len: usize) -> Option<(u64, Bytes)> {
        if max_len == 0 {
            return None;
        }

        if let Some(&off) = self.rtx.iter().next() {
            self.rtx.remove(&off);
            let mut chunk = self.sent.remove(&off)?;
            if chunk.len() > max_len {
                let rest = chunk.split_off(max_len);
                self.sent.insert(off + max_len as u64, rest);
                self.rtx.insert(off + max_len as u64);
            }
            self.sent.insert(off, chunk.clone());
            return Some((off, chunk));
        }

        let front = self.pending.front_mut()?;
        let take = front.len().min(max_len);
        let chunk = front.split_to(take);
        if front.is_empty() {
            self.pending.pop_front();
        }
        let offset = self.pending_offset;
        self.pending_offset += take as u64;
        self.sent.insert(offset, chunk.clone());
        Some((offset, chunk))
    }

    pub fn on_ack(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = offset + len;
        let doomed: Vec<u64> = self
            .sent
            .range(..end)
            .filter(|(&off, chunk)| off >= offset && off + chunk.len() as u64 <= end)
            .map(|(&off, _)| off)
            .collect();
        for off in doomed {
            self.sent.remove(&off);
            self.rtx.remove(&off);
        }
    }

    pub fn on_loss(&mut self, offset: u64, len: u64) {
        let end = offset + len;
        let candidates: Vec<u64> = self
            .sent
            .range(..end)
            .filter(|(&off, chunk)| off + chunk.len() as u64 > offset)
            .map(|(&off, _)| off)
            .collect();
        for off in candidates {
            self.rtx.insert(off);
        }
    }
}

// ============================================================================
// In-Memory Handshake (tests, loopback)
// ============================================================================

/// A scriptable handshake driver for tests and loopback wiring.
///
/// It hands out whatever flights were queued with [`Self::queue_flight`],
/// completes when told to, and performs no cryptography: real deployments
/// plug a TLS stack in behind [`HandshakeDriver`] instead.
#[derive(Debug, Default)]
pub struct StubHandshake {
    outbound: VecDeque<(Epoch, Bytes)>,
    events: VecDeque<TlsEvent>,
    received: Vec<(Epoch, Bytes)>,
    peer_params: Option<Bytes>,
    local_params: Option<Bytes>,
    complete_on_any_input: bool,
}

impl StubHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the handshake (and emit `HandshakeComplete`) as soon as any
    /// crypto bytes arrive.
    pub fn complete_on_input(mut self) -> Self {
        self.complete_on_any_input = true;
        self
    }

    pub fn queue_flight(&mut self, epoch: Epoch, data: Bytes) {
        self.outbound.push_back((epoch, data));
    }

    pub fn set_peer_params(&mut self, raw: Bytes) {
        self.peer_params = Some(raw);
    }

    pub fn finish(&mut self) {
        self.events.push_back(TlsEvent::HandshakeComplete);
    }

    pub fn received(&self) -> &[(Epoch, Bytes)] {
        &self.received
    }
}

impl HandshakeDriver for StubHandshake {
    fn crypto_received(&mut self, epoch: Epoch, data: &[u8]) -> Result<()> {
        self.received.push((epoch, Bytes::copy_from_slice(data)));
        if self.complete_on_any_input {
            self.complete_on_any_input = false;
            self.events.push_back(TlsEvent::HandshakeComplete);
        }
        Ok(())
    }

    fn poll_crypto(&mut self, epoch: Epoch) -> Option<Bytes> {
        if self.outbound.front()?.0 != epoch {
            return None;
        }
        self.outbound.pop_front().map(|(_, data)| data)
    }

    fn poll_event(&mut self) -> Option<TlsEvent> {
        self.events.pop_front()
    }

    fn peer_transport_parameters(&self) -> Option<Bytes> {
        self.peer_params.clone()
    }

    fn set_transport_parameters(&mut self, raw: Bytes) {
        self.local_params = Some(raw);
    }

    fn export_secret(&self, _label: &str, _context: &[u8], len: usize) -> Result<Vec<u8>> {
        Ok(vec![0u8; len])
    }
}
