//! Connection stream table: creation, stream-id limits, closed-id tracking.
//!
//! Streams come into being on the first frame referencing them (inbound) or
//! via `open` (outbound). A stream id never reappears: on exit it joins the
//! closed interval set and later frames naming it are silently ignored.

#![forbid(unsafe_code)]

use super::{RecvStream, SendStream, Stream};
use crate::diet::Diet;
use crate::error::{Error, Result};
use crate::types::{Side, StreamId};
use std::collections::BTreeMap;

/// Per-direction initial limits, assembled from both endpoints' transport
/// parameters once the handshake delivers them.
#[derive(Debug, Clone)]
pub struct StreamsConfig {
    /// How many bidi/uni streams the peer may open.
    pub local_max_streams_bidi: u64,
    pub local_max_streams_uni: u64,

    /// How many bidi/uni streams the peer lets us open.
    pub peer_max_streams_bidi: u64,
    pub peer_max_streams_uni: u64,

    /// Receive windows we grant per stream.
    pub local_max_stream_data_bidi_local: u64,
    pub local_max_stream_data_bidi_remote: u64,
    pub local_max_stream_data_uni: u64,

    /// Send windows the peer granted per stream.
    pub peer_max_stream_data_bidi_local: u64,
    pub peer_max_stream_data_bidi_remote: u64,
    pub peer_max_stream_data_uni: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            local_max_streams_bidi: 100,
            local_max_streams_uni: 100,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            local_max_stream_data_bidi_local: 1 << 20,
            local_max_stream_data_bidi_remote: 1 << 20,
            local_max_stream_data_uni: 1 << 20,
            peer_max_stream_data_bidi_local: 0,
            peer_max_stream_data_bidi_remote: 0,
            peer_max_stream_data_uni: 0,
        }
    }
}

/// Outcome of resolving an inbound frame's stream id.
#[derive(Debug)]
pub enum StreamLookup<'a> {
    Stream(&'a mut Stream),
    /// Stream already closed; the frame is silently ignored.
    Closed,
}

#[derive(Debug)]
pub struct StreamMap {
    side: Side,
    streams: BTreeMap<u64, Stream>,

    /// Stream ids that have finished; never reused, never recreated.
    closed: Diet,

    config: StreamsConfig,

    /// Highest ordinal + 1 the peer has opened, per directionality.
    peer_opened_bidi: u64,
    peer_opened_uni: u64,

    /// Next ordinal for locally-opened streams.
    next_local_bidi: u64,
    next_local_uni: u64,

    /// Closed peer-initiated streams, for sliding the MAX_STREAMS limits.
    released_bidi: u64,
    released_uni: u64,
}

impl StreamMap {
    pub fn new(side: Side, config: StreamsConfig) -> Self {
        Self {
            side,
            streams: BTreeMap::new(),
            closed: Diet::new(),
            config,
            peer_opened_bidi: 0,
            peer_opened_uni: 0,
            next_local_bidi: 0,
            next_local_uni: 0,
            released_bidi: 0,
            released_uni: 0,
        }
    }

    /// Apply the peer's transport parameters once they arrive.
    pub fn set_peer_limits(
        &mut self,
        max_streams_bidi: u64,
        max_streams_uni: u64,
        msd_bidi_local: u64,
        msd_bidi_remote: u64,
        msd_uni: u64,
    ) {
        self.config.peer_max_streams_bidi = max_streams_bidi;
        self.config.peer_max_streams_uni = max_streams_uni;
        self.config.peer_max_stream_data_bidi_local = msd_bidi_local;
        self.config.peer_max_stream_data_bidi_remote = msd_bidi_remote;
        self.config.peer_max_stream_data_uni = msd_uni;
    }

    pub fn on_peer_max_streams(&mut self, bidi: bool, limit: u64) {
        let slot = if bidi {
            &mut self.config.peer_max_streams_bidi
        } else {
            &mut self.config.peer_max_streams_uni
        };
        *slot = (*slot).max(limit);
    }

    /// Current limit we advertise to the peer: the initial allowance slides
    /// forward as peer-initiated streams close.
    pub fn local_max_streams(&self, bidi: bool) -> u64 {
        if bidi {
            self.config.local_max_streams_bidi + self.released_bidi
        } else {
            self.config.local_max_streams_uni + self.released_uni
        }
    }

    /// Open a locally-initiated stream, or report the applicable limit if
    /// the peer's MAX_STREAMS does not allow another one.
    pub fn open(&mut self, bidi: bool) -> core::result::Result<StreamId, u64> {
        let (next, limit) = if bidi {
            (&mut self.next_local_bidi, self.config.peer_max_streams_bidi)
        } else {
            (&mut self.next_local_uni, self.config.peer_max_streams_uni)
        };
        if *next >= limit {
            return Err(limit);
        }
        let ordinal = *next;
        *next += 1;

        let id = StreamId::from_parts(self.side, bidi, ordinal);
        let send_limit = if bidi {
            // Our outgoing half of a bidi stream is "remote" from the
            // peer's point of view.
            self.config.peer_max_stream_data_bidi_remote
        } else {
            self.config.peer_max_stream_data_uni
        };
        let send = Some(SendStream::new(id, send_limit));
        let recv = bidi.then(|| RecvStream::new(id, self.config.local_max_stream_data_bidi_local));
        self.streams.insert(id.value(), Stream::new(id, send, recv));
        Ok(id)
    }

    /// Resolve an inbound frame's stream id, creating peer-initiated
    /// streams on first reference.
    ///
    /// `needs_recv` is set for data-bearing frames (STREAM, RESET_STREAM,
    /// STREAM_DATA_BLOCKED): referencing a receive half we do not have is a
    /// STREAM_STATE_ERROR.
    pub fn get_or_create(&mut self, id: StreamId, needs_recv: bool) -> Result<StreamLookup<'_>> {
        if self.closed.contains(id.value()) {
            return Ok(StreamLookup::Closed);
        }
        if self.streams.contains_key(&id.value()) {
            let stream = self.streams.get_mut(&id.value()).expect("checked above");
            if needs_recv && stream.recv.is_none() {
                return Err(Error::StreamStateError);
            }
            return Ok(StreamLookup::Stream(stream));
        }

        if id.initiator() == self.side {
            // A frame for a local stream we never opened.
            return Err(Error::StreamStateError);
        }

        // Peer-initiated: enforce the advertised stream-count limit.
        let bidi = id.is_bidirectional();
        if id.ordinal() >= self.local_max_streams(bidi) {
            return Err(Error::StreamLimitError);
        }

        let recv_limit = if bidi {
            self.config.local_max_stream_data_bidi_remote
        } else {
            self.config.local_max_stream_data_uni
        };
        let send = bidi.then(|| {
            SendStream::new(id, self.config.peer_max_stream_data_bidi_local)
        });
        let stream = Stream::new(id, send, Some(RecvStream::new(id, recv_limit)));

        let opened = if bidi {
            &mut self.peer_opened_bidi
        } else {
            &mut self.peer_opened_uni
        };
        *opened = (*opened).max(id.ordinal() + 1);

        self.streams.insert(id.value(), stream);
        Ok(StreamLookup::Stream(
            self.streams.get_mut(&id.value()).expect("just inserted"),
        ))
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id.value())
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id.value())
    }

    pub fn is_closed_id(&self, id: StreamId) -> bool {
        self.closed.contains(id.value())
    }

    /// Retire a fully-closed stream. Closing a peer-initiated stream frees
    /// a slot in the corresponding MAX_STREAMS allowance; the caller should
    /// check [`Self::local_max_streams`] afterwards and advertise.
    pub fn retire(&mut self, id: StreamId) {
        if self.streams.remove(&id.value()).is_some() {
            self.closed.insert(id.value());
            if id.initiator() != self.side {
                if id.is_bidirectional() {
                    self.released_bidi += 1;
                } else {
                    self.released_uni += 1;
                }
            }
        }
    }

    /// Streams with data ready for the application, lowest id first.
    pub fn first_readable(&self) -> Option<StreamId> {
        self.streams
            .values()
            .find(|s| s.recv.as_ref().is_some_and(|r| r.has_readable()))
            .map(|s| s.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
