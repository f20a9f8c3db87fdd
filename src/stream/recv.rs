//! Receive-side stream half (RFC 9000 Section 3.2): in-order delivery with
//! out-of-order reassembly.
//!
//! Arriving frames are placed by offset against `in_data_off`, the next byte
//! the application is owed. Frames entirely below it are duplicates and are
//! dropped; frames straddling it are trimmed and appended to the in-order
//! receive queue, which then drains any out-of-order buffers that became
//! contiguous; frames beyond it wait in an offset-keyed index. Buffers in
//! the out-of-order index never overlap: an arriving frame that would
//! overlap an indexed one is ignored wholesale.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::flow_control::RecvWindow;
use crate::types::StreamId;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

/// Receive-half state (RFC 9000 Figure 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

/// What a frame arrival changed, for event generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecvUpdate {
    /// New in-order bytes became readable.
    pub readable: bool,

    /// The FIN reached the tail of the receive queue.
    pub finished: bool,
}

#[derive(Debug)]
pub struct RecvStream {
    id: StreamId,

    /// In-order data ready for the application.
    queue: VecDeque<Bytes>,
    queued_bytes: usize,

    /// Out-of-order buffers by stream offset, pairwise disjoint.
    ooo: BTreeMap<u64, Bytes>,

    /// Next byte expected in order; monotonically non-decreasing.
    in_data_off: u64,

    /// Highest offset seen (data or final size).
    highest: u64,

    /// Stream-level receive window.
    pub flow: RecvWindow,

    final_size: Option<u64>,
    fin_delivered: bool,
    fin_read: bool,

    /// RESET_STREAM received: application error code.
    reset: Option<u64>,
    reset_read: bool,
}

impl RecvStream {
    pub fn new(id: StreamId, max_stream_data: u64) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            queued_bytes: 0,
            ooo: BTreeMap::new(),
            in_data_off: 0,
            highest: 0,
            flow: RecvWindow::new(max_stream_data),
            final_size: None,
            fin_delivered: false,
            fin_read: false,
            reset: None,
            reset_read: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next byte expected in order.
    pub fn in_data_off(&self) -> u64 {
        self.in_data_off
    }

    pub fn is_started(&self) -> bool {
        self.highest > 0 || self.final_size.is_some() || self.reset.is_some()
    }

    /// The half is done: FIN delivered in order, or the stream was reset.
    pub fn is_finished(&self) -> bool {
        self.fin_delivered || self.reset.is_some()
    }

    pub fn state(&self) -> RecvState {
        if self.reset.is_some() {
            return if self.reset_read {
                RecvState::ResetRead
            } else {
                RecvState::ResetRecvd
            };
        }
        if self.fin_read {
            return RecvState::DataRead;
        }
        if self.fin_delivered {
            return RecvState::DataRecvd;
        }
        if self.final_size.is_some() {
            RecvState::SizeKnown
        } else {
            RecvState::Recv
        }
    }

    pub fn has_readable(&self) -> bool {
        self.queued_bytes > 0 || (self.fin_delivered && !self.fin_read)
    }

    /// Place an arriving STREAM frame. `conn_flow` is the connection-level
    /// receive window, charged for any new high-water bytes this frame
    /// claims. All checks run before any state is touched.
    pub fn on_frame(
        &mut self,
        offset: u64,
        data: Bytes,
        fin: bool,
        conn_flow: &mut RecvWindow,
    ) -> Result<RecvUpdate> {
        if self.reset.is_some() {
            // Data after a reset is moot.
            return Ok(RecvUpdate::default());
        }

        let len = data.len() as u64;
        let end = offset.checked_add(len).ok_or(Error::FrameEncodingError)?;

        // Final size consistency (RFC 9000 Section 4.5).
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::FinalSizeError);
            }
        }
        if fin && end < self.highest {
            return Err(Error::FinalSizeError);
        }

        // Flow control, stream then connection, charged only for new bytes.
        let delta = end.saturating_sub(self.highest);
        if delta > 0 {
            if !conn_flow.can_claim(delta) {
                return Err(Error::FlowControlError);
            }
            self.flow.claim(delta)?;
            conn_flow.claim(delta)?;
            self.highest = end;
        }
        if fin {
            self.final_size = Some(end);
        }

        let mut update = RecvUpdate::default();
        let expected = self.in_data_off;

        if end <= expected {
            // Complete duplicate; a bare FIN at the edge still lands below.
        } else if offset <= expected {
            // In-order or head overlap: trim what we already have.
            let chunk = data.slice((expected - offset) as usize..);
            self.push_in_order(chunk);
            update.readable = true;
            self.drain_ooo();
        } else {
            // Out of order. Ignore anything overlapping an indexed buffer.
            if !self.overlaps_ooo(offset, end) {
                self.ooo.insert(offset, data);
            }
        }

        if self.final_size == Some(self.in_data_off) && !self.fin_delivered {
            self.fin_delivered = true;
            update.finished = true;
        }
        Ok(update)
    }

    fn push_in_order(&mut self, chunk: Bytes) {
        self.in_data_off += chunk.len() as u64;
        self.queued_bytes += chunk.len();
        if !chunk.is_empty() {
            self.queue.push_back(chunk);
        }
    }

    /// Deliver out-of-order buffers that became contiguous, trimming or
    /// dropping entries the advancing edge has overtaken.
    fn drain_ooo(&mut self) {
        while let Some((&off, _)) = self.ooo.first_key_value() {
            if off > self.in_data_off {
                break;
            }
            let chunk = self.ooo.remove(&off).unwrap_or_default();
            let end = off + chunk.len() as u64;
            if end <= self.in_data_off {
                continue; // stale
            }
            let chunk = chunk.slice((self.in_data_off - off) as usize..);
            self.push_in_order(chunk);
        }
    }

    fn overlaps_ooo(&self, offset: u64, end: u64) -> bool {
        if let Some((&lo, chunk)) = self.ooo.range(..=offset).next_back() {
            if lo + chunk.len() as u64 > offset {
                return true;
            }
        }
        self.ooo.range(offset..).next().is_some_and(|(&lo, _)| lo < end)
    }

    /// Drain the next chunk of in-order data. The second element reports
    /// whether the FIN has now been fully read.
    pub fn read(&mut self) -> Option<(Bytes, bool)> {
        match self.queue.pop_front() {
            Some(chunk) => {
                self.queued_bytes -= chunk.len();
                self.flow.on_consumed(chunk.len() as u64);
                let at_fin = self.queue.is_empty() && self.fin_delivered;
                if at_fin {
                    self.fin_read = true;
                }
                Some((chunk, at_fin))
            }
            None if self.fin_delivered && !self.fin_read => {
                self.fin_read = true;
                Some((Bytes::new(), true))
            }
            None => None,
        }
    }

    /// Handle RESET_STREAM: validate the final size, release buffers, and
    /// surface the error code. Returns `Ok(false)` for a duplicate reset.
    pub fn on_reset(
        &mut self,
        error_code: u64,
        final_size: u64,
        conn_flow: &mut RecvWindow,
    ) -> Result<bool> {
        if self.reset.is_some() {
            return Ok(false);
        }
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(Error::FinalSizeError);
            }
        }
        if final_size < self.highest {
            return Err(Error::FinalSizeError);
        }

        let delta = final_size - self.highest;
        if delta > 0 {
            if !conn_flow.can_claim(delta) {
                return Err(Error::FlowControlError);
            }
            self.flow.claim(delta)?;
            conn_flow.claim(delta)?;
            self.highest = final_size;
        }

        self.final_size = Some(final_size);
        self.reset = Some(error_code);
        self.queue.clear();
        self.queued_bytes = 0;
        self.ooo.clear();
        Ok(true)
    }

    pub fn reset_code(&mut self) -> Option<u64> {
        let code = self.reset?;
        self.reset_read = true;
        Some(code)
    }

    /// Number of distinct buffers waiting out of order (test hook).
    #[cfg(test)]
    pub fn ooo_len(&self) -> usize {
        self.ooo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (RecvStream, RecvWindow) {
        (RecvStream::new(StreamId::new(0), 1000), RecvWindow::new(10_000))
    }

    fn recv(
        s: &mut RecvStream,
        conn: &mut RecvWindow,
        off: u64,
        data: &'static [u8],
        fin: bool,
    ) -> Result<RecvUpdate> {
        s.on_frame(off, Bytes::from_static(data), fin, conn)
    }

    fn read_all(s: &mut RecvStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((chunk, fin)) = s.read() {
            out.extend_from_slice(&chunk);
            if fin {
                break;
            }
        }
        out
    }

    #[test]
    fn test_in_order_delivery() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"ABCD", false).unwrap();
        recv(&mut s, &mut conn, 4, b"EFGH", false).unwrap();
        let u = recv(&mut s, &mut conn, 8, b"IJ", true).unwrap();
        assert!(u.finished);

        assert_eq!(read_all(&mut s), b"ABCDEFGHIJ");
        assert_eq!(s.state(), RecvState::DataRead);
        assert!(s.is_finished());
    }

    #[test]
    fn test_reordered_delivery() {
        let (mut s, mut conn) = stream();

        // Frame 2 first: parked out of order.
        let u = recv(&mut s, &mut conn, 4, b"EFGH", false).unwrap();
        assert!(!u.readable);
        assert_eq!(s.ooo_len(), 1);
        assert_eq!(s.in_data_off(), 0);

        // Frame 1 arrives: both become readable.
        let u = recv(&mut s, &mut conn, 0, b"ABCD", false).unwrap();
        assert!(u.readable);
        assert_eq!(s.ooo_len(), 0);
        assert_eq!(s.in_data_off(), 8);

        // Frame 3 finishes the stream.
        let u = recv(&mut s, &mut conn, 8, b"IJ", true).unwrap();
        assert!(u.finished);
        assert_eq!(read_all(&mut s), b"ABCDEFGHIJ");
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"ABCD", false).unwrap();
        let before = conn.claimed();

        let u = recv(&mut s, &mut conn, 0, b"ABCD", false).unwrap();
        assert!(!u.readable);
        assert_eq!(s.in_data_off(), 4);
        assert_eq!(conn.claimed(), before, "duplicates claim no window");
        assert_eq!(read_all(&mut s), b"ABCD");
    }

    #[test]
    fn test_head_overlap_trims() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"AAAAA", false).unwrap();
        assert_eq!(s.in_data_off(), 5);

        // Offsets [3, 9) with in_data_off 5: first two bytes are stale.
        let u = recv(&mut s, &mut conn, 3, b"XXdddd", false).unwrap();
        assert!(u.readable);
        assert_eq!(s.in_data_off(), 9);
        assert_eq!(read_all(&mut s), b"AAAAAdddd");
    }

    #[test]
    fn test_flow_control_violation() {
        let mut s = RecvStream::new(StreamId::new(0), 100);
        let mut conn = RecvWindow::new(10_000);
        let err = s
            .on_frame(98, Bytes::from_static(&[0u8; 10]), false, &mut conn)
            .unwrap_err();
        assert_eq!(err, Error::FlowControlError);
        assert_eq!(s.in_data_off(), 0);
        assert_eq!(conn.claimed(), 0);
    }

    #[test]
    fn test_connection_flow_control_violation() {
        let mut s = RecvStream::new(StreamId::new(0), 10_000);
        let mut conn = RecvWindow::new(100);
        let err = s
            .on_frame(0, Bytes::from_static(&[0u8; 101]), false, &mut conn)
            .unwrap_err();
        assert_eq!(err, Error::FlowControlError);
    }

    #[test]
    fn test_ooo_overlap_ignored() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 10, b"abcdef", false).unwrap();
        assert_eq!(s.ooo_len(), 1);

        // Overlaps the indexed buffer from below and within: ignored.
        recv(&mut s, &mut conn, 8, b"zzzz", false).unwrap();
        recv(&mut s, &mut conn, 12, b"zz", false).unwrap();
        assert_eq!(s.ooo_len(), 1);

        // Disjoint buffer is accepted.
        recv(&mut s, &mut conn, 20, b"gh", false).unwrap();
        assert_eq!(s.ooo_len(), 2);
    }

    #[test]
    fn test_stale_ooo_dropped_on_drain() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 6, b"gh", false).unwrap();
        recv(&mut s, &mut conn, 4, b"ef", false).unwrap();

        // One frame covers everything up to 8; the parked copies of [4,8)
        // are now stale and must be discarded, not redelivered.
        recv(&mut s, &mut conn, 0, b"abcdefgh", false).unwrap();
        assert_eq!(s.ooo_len(), 0);
        assert_eq!(read_all(&mut s), b"abcdefgh");
    }

    #[test]
    fn test_final_size_violations() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"abcd", true).unwrap();

        assert_eq!(
            recv(&mut s, &mut conn, 4, b"x", false).unwrap_err(),
            Error::FinalSizeError
        );
        assert_eq!(
            recv(&mut s, &mut conn, 0, b"ab", true).unwrap_err(),
            Error::FinalSizeError
        );
    }

    #[test]
    fn test_bare_fin_after_data() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"abcd", false).unwrap();
        let u = recv(&mut s, &mut conn, 4, b"", true).unwrap();
        assert!(u.finished);
        assert_eq!(read_all(&mut s), b"abcd");
        assert_eq!(s.state(), RecvState::DataRead);
    }

    #[test]
    fn test_fin_out_of_order_waits_for_gap() {
        let (mut s, mut conn) = stream();
        let u = recv(&mut s, &mut conn, 4, b"ef", true).unwrap();
        assert!(!u.finished, "FIN known but gap outstanding");
        assert_eq!(s.state(), RecvState::SizeKnown);

        let u = recv(&mut s, &mut conn, 0, b"abcd", false).unwrap();
        assert!(u.finished);
        assert_eq!(read_all(&mut s), b"abcdef");
    }

    #[test]
    fn test_reset_releases_stream() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"abcd", false).unwrap();

        assert!(s.on_reset(9, 10, &mut conn).unwrap());
        assert_eq!(s.state(), RecvState::ResetRecvd);
        assert!(s.is_finished());
        assert!(s.read().is_none());
        assert_eq!(s.reset_code(), Some(9));
        assert_eq!(s.state(), RecvState::ResetRead);

        // Reset claims the gap up to the final size on the connection.
        assert_eq!(conn.claimed(), 10);
        assert!(!s.on_reset(9, 10, &mut conn).unwrap());
    }

    #[test]
    fn test_reset_final_size_mismatch() {
        let (mut s, mut conn) = stream();
        recv(&mut s, &mut conn, 0, b"abcd", true).unwrap();
        assert_eq!(s.on_reset(1, 3, &mut conn).unwrap_err(), Error::FinalSizeError);
    }
}
