//! Connection ID lifecycle (RFC 9000 Sections 5.1, 19.15-19.16).
//!
//! Tracks both directions: the sequence-numbered CIDs we have issued to the
//! peer (NEW_CONNECTION_ID) and the ones the peer has issued to us, with
//! retirement bookkeeping on both sides.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::frames::NewConnectionIdFrame;
use crate::types::{ConnectionId, StatelessResetToken};
use std::collections::{BTreeMap, BTreeSet};

/// How many CIDs we keep issued to the peer, within its advertised limit.
const ISSUE_TARGET: u64 = 4;

#[derive(Debug, Clone)]
struct LocalCid {
    cid: ConnectionId,
    reset_token: StatelessResetToken,
}

#[derive(Debug)]
pub struct CidManager {
    /// CIDs we issued, by sequence number.
    local: BTreeMap<u64, LocalCid>,
    next_local_seq: u64,

    /// CIDs the peer issued to us, by sequence number.
    remote: BTreeMap<u64, (ConnectionId, StatelessResetToken)>,

    /// Highest retire_prior_to the peer has demanded.
    remote_retire_prior_to: u64,

    /// How many peer CIDs we are willing to track (our
    /// active_connection_id_limit).
    local_cid_limit: u64,

    /// How many of our CIDs the peer tracks (its limit).
    peer_cid_limit: u64,

    /// Local sequence numbers not yet advertised (or lost and re-queued).
    pending_new: BTreeSet<u64>,

    /// Remote sequence numbers to retire (or lost and re-queued).
    pending_retire: BTreeSet<u64>,

    cid_len: usize,
}

impl CidManager {
    /// Seed with the handshake-negotiated CID pair at sequence 0.
    pub fn new(local_initial: ConnectionId, local_cid_limit: u64) -> Self {
        let mut local = BTreeMap::new();
        let cid_len = local_initial.len().max(4);
        local.insert(
            0,
            LocalCid {
                cid: local_initial,
                reset_token: rand::random(),
            },
        );
        Self {
            local,
            next_local_seq: 1,
            remote: BTreeMap::new(),
            remote_retire_prior_to: 0,
            local_cid_limit,
            peer_cid_limit: 2,
            pending_new: BTreeSet::new(),
            pending_retire: BTreeSet::new(),
            cid_len,
        }
    }

    pub fn set_peer_cid_limit(&mut self, limit: u64) {
        self.peer_cid_limit = limit;
        self.replenish();
    }

    pub fn set_initial_remote(&mut self, cid: ConnectionId) {
        self.remote.entry(0).or_insert((cid, [0u8; 16]));
    }

    /// A local CID is held while any remains unretired.
    pub fn active_local(&self) -> Option<&ConnectionId> {
        self.local.values().next().map(|c| &c.cid)
    }

    /// Issue fresh CIDs up to the peer's limit (capped at a small target).
    pub fn replenish(&mut self) {
        let target = self.peer_cid_limit.min(ISSUE_TARGET);
        while (self.local.len() as u64) < target {
            let seq = self.next_local_seq;
            self.next_local_seq += 1;
            self.local.insert(
                seq,
                LocalCid {
                    cid: ConnectionId::random(self.cid_len),
                    reset_token: rand::random(),
                },
            );
            self.pending_new.insert(seq);
        }
    }

    /// Handle NEW_CONNECTION_ID from the peer.
    pub fn on_new_cid(&mut self, frame: &NewConnectionIdFrame) -> Result<()> {
        // A reused sequence number must carry identical content.
        if let Some((cid, token)) = self.remote.get(&frame.sequence_number) {
            if *cid != frame.connection_id || *token != frame.stateless_reset_token {
                return Err(Error::ProtocolViolation);
            }
            return Ok(());
        }

        if frame.sequence_number >= self.remote_retire_prior_to {
            self.remote.insert(
                frame.sequence_number,
                (frame.connection_id.clone(), frame.stateless_reset_token),
            );
        } else {
            // Arrived already retired; acknowledge the retirement.
            self.pending_retire.insert(frame.sequence_number);
        }

        if frame.retire_prior_to > self.remote_retire_prior_to {
            self.remote_retire_prior_to = frame.retire_prior_to;
            let doomed: Vec<u64> = self
                .remote
                .range(..frame.retire_prior_to)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in doomed {
                self.remote.remove(&seq);
                self.pending_retire.insert(seq);
            }
        }

        if self.remote.len() as u64 > self.local_cid_limit {
            return Err(Error::ConnectionIdLimitError);
        }
        Ok(())
    }

    /// Handle RETIRE_CONNECTION_ID from the peer.
    pub fn on_retire(&mut self, sequence_number: u64) -> Result<()> {
        if sequence_number >= self.next_local_seq {
            // Retiring a CID we never issued.
            return Err(Error::ProtocolViolation);
        }
        self.local.remove(&sequence_number);
        self.pending_new.remove(&sequence_number);
        self.replenish();
        Ok(())
    }

    /// Next NEW_CONNECTION_ID frame to advertise.
    pub fn poll_new_cid(&mut self) -> Option<NewConnectionIdFrame> {
        let seq = *self.pending_new.iter().next()?;
        self.pending_new.remove(&seq);
        let entry = self.local.get(&seq)?;
        Some(NewConnectionIdFrame {
            sequence_number: seq,
            retire_prior_to: 0,
            connection_id: entry.cid.clone(),
            stateless_reset_token: entry.reset_token,
        })
    }

    /// Next RETIRE_CONNECTION_ID sequence number to send.
    pub fn poll_retire(&mut self) -> Option<u64> {
        let seq = *self.pending_retire.iter().next()?;
        self.pending_retire.remove(&seq);
        Some(seq)
    }

    /// Loss feedback: put the frame back in the queue.
    pub fn requeue_new_cid(&mut self, seq: u64) {
        if self.local.contains_key(&seq) {
            self.pending_new.insert(seq);
        }
    }

    pub fn requeue_retire(&mut self, seq: u64) {
        self.pending_retire.insert(seq);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_new.is_empty() || !self.pending_retire.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64, retire_prior_to: u64, cid: &[u8]) -> NewConnectionIdFrame {
        NewConnectionIdFrame {
            sequence_number: seq,
            retire_prior_to,
            connection_id: ConnectionId::from_slice(cid).unwrap(),
            stateless_reset_token: [seq as u8; 16],
        }
    }

    fn mgr() -> CidManager {
        CidManager::new(ConnectionId::from_slice(&[9, 9, 9, 9]).unwrap(), 4)
    }

    #[test]
    fn test_replenish_respects_peer_limit() {
        let mut m = mgr();
        m.set_peer_cid_limit(3);
        let mut issued = Vec::new();
        while let Some(f) = m.poll_new_cid() {
            issued.push(f.sequence_number);
        }
        assert_eq!(issued, vec![1, 2], "seq 0 existed, two more fill the limit");
    }

    #[test]
    fn test_retire_prior_to_prunes_remote() {
        let mut m = mgr();
        m.on_new_cid(&frame(0, 0, &[1])).unwrap();
        m.on_new_cid(&frame(1, 0, &[2])).unwrap();
        m.on_new_cid(&frame(2, 2, &[3])).unwrap();

        // Sequences 0 and 1 must now be retired.
        assert_eq!(m.poll_retire(), Some(0));
        assert_eq!(m.poll_retire(), Some(1));
        assert_eq!(m.poll_retire(), None);
    }

    #[test]
    fn test_cid_limit_enforced() {
        let mut m = CidManager::new(ConnectionId::from_slice(&[9]).unwrap(), 2);
        m.on_new_cid(&frame(0, 0, &[1])).unwrap();
        m.on_new_cid(&frame(1, 0, &[2])).unwrap();
        assert_eq!(
            m.on_new_cid(&frame(2, 0, &[3])).unwrap_err(),
            Error::ConnectionIdLimitError
        );
    }

    #[test]
    fn test_sequence_reuse_with_different_cid() {
        let mut m = mgr();
        m.on_new_cid(&frame(0, 0, &[1])).unwrap();
        m.on_new_cid(&frame(0, 0, &[1])).unwrap(); // exact duplicate ok
        assert_eq!(
            m.on_new_cid(&frame(0, 0, &[7])).unwrap_err(),
            Error::ProtocolViolation
        );
    }

    #[test]
    fn test_retire_unissued_is_violation() {
        let mut m = mgr();
        assert_eq!(m.on_retire(5).unwrap_err(), Error::ProtocolViolation);
        m.on_retire(0).unwrap();
    }
}
