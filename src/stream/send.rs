//! Send-side stream half (RFC 9000 Section 3.1).
//!
//! Application writes land in a pending queue; transmitted chunks move to an
//! in-flight map keyed by stream offset until acknowledged, so loss can put
//! them back on the wire without copying. Acknowledged byte ranges accumulate
//! in an interval set; the half is finished once every byte up to the final
//! size, and the FIN itself, are acknowledged.

#![forbid(unsafe_code)]

use crate::diet::Diet;
use crate::error::{Error, Result};
use crate::flow_control::SendWindow;
use crate::frames::StreamFrame;
use crate::types::StreamId;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Send-half state (RFC 9000 Figure 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

#[derive(Debug)]
pub struct SendStream {
    id: StreamId,

    /// Data accepted from the application, not yet transmitted.
    pending: VecDeque<Bytes>,

    /// Stream offset of the front of `pending`.
    pending_offset: u64,

    /// Total bytes accepted from the application.
    write_offset: u64,

    /// Transmitted, unacknowledged chunks by stream offset.
    sent: BTreeMap<u64, Bytes>,

    /// Offsets in `sent` that were declared lost and await retransmission.
    rtx: BTreeSet<u64>,

    /// Acknowledged byte ranges.
    acked: Diet,

    /// Peer's stream-level flow control grant.
    pub flow: SendWindow,

    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,
    fin_lost: bool,

    /// RESET_STREAM queued or sent: (error code, final size).
    reset: Option<(u64, u64)>,
    reset_acked: bool,
}

impl SendStream {
    pub fn new(id: StreamId, max_stream_data: u64) -> Self {
        Self {
            id,
            pending: VecDeque::new(),
            pending_offset: 0,
            write_offset: 0,
            sent: BTreeMap::new(),
            rtx: BTreeSet::new(),
            acked: Diet::new(),
            flow: SendWindow::new(max_stream_data),
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            fin_lost: false,
            reset: None,
            reset_acked: false,
        }
    }

    /// Queue data (and optionally FIN) for transmission.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<()> {
        if self.fin_queued || self.reset.is_some() {
            return Err(Error::StreamStateError);
        }
        self.write_offset += data.len() as u64;
        if !data.is_empty() {
            self.pending.push_back(data);
        }
        self.fin_queued = fin;
        Ok(())
    }

    /// Whether the application may still write.
    pub fn is_writable(&self) -> bool {
        !self.fin_queued && self.reset.is_none()
    }

    pub fn is_started(&self) -> bool {
        self.write_offset > 0 || self.fin_queued || self.reset.is_some()
    }

    /// The half is done: everything acknowledged, or the reset was.
    pub fn is_finished(&self) -> bool {
        match self.state() {
            SendState::DataRecvd | SendState::ResetRecvd => true,
            _ => false,
        }
    }

    pub fn state(&self) -> SendState {
        if self.reset.is_some() {
            return if self.reset_acked {
                SendState::ResetRecvd
            } else {
                SendState::ResetSent
            };
        }
        if self.fin_acked && self.sent.is_empty() && self.pending.is_empty() {
            return SendState::DataRecvd;
        }
        if self.fin_sent {
            return SendState::DataSent;
        }
        if self.is_started() {
            SendState::Send
        } else {
            SendState::Ready
        }
    }

    /// Anything to put on the wire (windows permitting)?
    pub fn has_pending(&self) -> bool {
        if self.reset.is_some() {
            return false;
        }
        !self.rtx.is_empty()
            || self.fin_lost
            || !self.pending.is_empty()
            || (self.fin_queued && !self.fin_sent)
    }

    /// Produce the next STREAM frame, at most `max_len` payload bytes.
    ///
    /// Retransmissions go first and consume no flow-control credit (those
    /// bytes were counted when first sent). New data is clipped to the
    /// stream and connection send windows; running into either records the
    /// corresponding blocked signal.
    pub fn poll_transmit(
        &mut self,
        max_len: usize,
        conn_flow: &mut SendWindow,
    ) -> Option<StreamFrame> {
        if self.reset.is_some() || max_len == 0 {
            return None;
        }

        // Lost data first.
        if let Some(&off) = self.rtx.iter().next() {
            self.rtx.remove(&off);
            let mut chunk = self.sent.remove(&off)?;
            if chunk.len() > max_len {
                let rest = chunk.split_off(max_len);
                self.sent.insert(off + max_len as u64, rest);
                self.rtx.insert(off + max_len as u64);
            }
            let end = off + chunk.len() as u64;
            self.sent.insert(off, chunk.clone());
            let fin = self.fin_sent && self.fin_queued && end == self.write_offset;
            return Some(StreamFrame {
                stream_id: self.id,
                offset: off,
                fin,
                data: chunk,
            });
        }

        // A lost FIN with no data attached.
        if self.fin_lost && self.pending.is_empty() {
            self.fin_lost = false;
            return Some(StreamFrame {
                stream_id: self.id,
                offset: self.write_offset,
                fin: true,
                data: Bytes::new(),
            });
        }

        // New data.
        if let Some(front) = self.pending.front_mut() {
            let want = front.len().min(max_len) as u64;
            let allowed = want.min(self.flow.available()).min(conn_flow.available());
            if allowed == 0 {
                // Record who blocked us so the *_BLOCKED frames go out.
                if self.flow.available() == 0 {
                    self.flow.mark_blocked();
                }
                if conn_flow.available() == 0 {
                    conn_flow.mark_blocked();
                }
                return None;
            }
            self.flow.consume(allowed);
            conn_flow.consume(allowed);

            let chunk = front.split_to(allowed as usize);
            if front.is_empty() {
                self.pending.pop_front();
            }
            let offset = self.pending_offset;
            self.pending_offset += allowed;
            self.sent.insert(offset, chunk.clone());

            let fin = self.fin_queued && self.pending.is_empty() && self.pending_offset == self.write_offset;
            if fin {
                self.fin_sent = true;
                self.fin_lost = false;
            }
            return Some(StreamFrame {
                stream_id: self.id,
                offset,
                fin,
                data: chunk,
            });
        }

        // Pure FIN.
        if self.fin_queued && !self.fin_sent {
            self.fin_sent = true;
            return Some(StreamFrame {
                stream_id: self.id,
                offset: self.write_offset,
                fin: true,
                data: Bytes::new(),
            });
        }

        None
    }

    /// Acknowledge the byte range (and FIN) a sent frame carried.
    pub fn on_ack(&mut self, offset: u64, len: u64, fin: bool) {
        if len > 0 {
            self.acked.insert_range(offset, offset + len - 1);
            let doomed: Vec<u64> = self
                .sent
                .range(..offset.saturating_add(len))
                .filter(|(&off, chunk)| {
                    off + chunk.len() as u64 > offset
                        && !chunk.is_empty()
                        && self.acked.contains_range(off, off + chunk.len() as u64 - 1)
                })
                .map(|(&off, _)| off)
                .collect();
            for off in doomed {
                self.sent.remove(&off);
                self.rtx.remove(&off);
            }
        }
        if fin {
            self.fin_acked = true;
            self.fin_lost = false;
        }
    }

    /// A frame carrying this range (and FIN) was declared lost.
    pub fn on_loss(&mut self, offset: u64, len: u64, fin: bool) {
        if len > 0 {
            let candidates: Vec<u64> = self
                .sent
                .range(..offset.saturating_add(len))
                .filter(|(&off, chunk)| off + chunk.len() as u64 > offset)
                .map(|(&off, _)| off)
                .collect();
            for off in candidates {
                self.rtx.insert(off);
            }
        }
        if fin && !self.fin_acked {
            self.fin_lost = true;
        }
    }

    /// Abort sending. Drops buffered data and returns the (error code,
    /// final size) for the RESET_STREAM frame, or `None` if already reset.
    pub fn reset(&mut self, error_code: u64) -> Option<(u64, u64)> {
        if self.reset.is_some() {
            return None;
        }
        self.pending.clear();
        self.rtx.clear();
        self.fin_lost = false;
        let final_size = self.pending_offset;
        self.reset = Some((error_code, final_size));
        Some((error_code, final_size))
    }

    /// Our RESET_STREAM was acknowledged.
    pub fn on_reset_acked(&mut self) {
        if self.reset.is_some() {
            self.reset_acked = true;
        }
    }

    pub fn reset_state(&self) -> Option<(u64, u64)> {
        self.reset
    }
}
