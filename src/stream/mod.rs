//! Stream state machines and data buffers (RFC 9000 Sections 2-4).

#![forbid(unsafe_code)]

pub mod map;
pub mod recv;
pub mod send;

pub use map::{StreamLookup, StreamMap, StreamsConfig};
pub use recv::{RecvState, RecvStream};
pub use send::{SendState, SendStream};

use crate::types::StreamId;

/// Combined stream state, derived from the two halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// Peer's direction is finished (FIN delivered or reset received).
    HalfClosedRemote,
    /// Our direction is finished (all data and FIN acknowledged, or reset).
    HalfClosedLocal,
    Closed,
}

/// One stream: a send half, a receive half, or both, depending on
/// directionality and initiator.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub send: Option<SendStream>,
    pub recv: Option<RecvStream>,
}

impl Stream {
    pub fn new(id: StreamId, send: Option<SendStream>, recv: Option<RecvStream>) -> Self {
        Self { id, send, recv }
    }

    /// Whether the local endpoint may write on this stream.
    pub fn is_writable(&self) -> bool {
        self.send.as_ref().is_some_and(|s| s.is_writable())
    }

    /// Combined state per the transition tables: a missing half counts as
    /// finished, so a unidirectional stream closes when its one half does.
    pub fn state(&self) -> StreamState {
        let send_done = self.send.as_ref().map_or(true, |s| s.is_finished());
        let recv_done = self.recv.as_ref().map_or(true, |r| r.is_finished());
        let touched = self.send.as_ref().map_or(false, |s| s.is_started())
            || self.recv.as_ref().map_or(false, |r| r.is_started());

        match (send_done, recv_done) {
            (true, true) => StreamState::Closed,
            (false, true) if touched => StreamState::HalfClosedRemote,
            (true, false) if touched => StreamState::HalfClosedLocal,
            _ if touched => StreamState::Open,
            _ => StreamState::Idle,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// No buffered data left for the application. Closed streams are only
    /// retired once drained, so a FIN cannot out-race the final read.
    pub fn is_drained(&self) -> bool {
        self.recv.as_ref().map_or(true, |r| !r.has_readable())
    }
}
