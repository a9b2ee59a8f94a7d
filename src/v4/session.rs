//! v4.1 sessions and slot tables.
//!
//! Each slot is a little duplicate-request cache with a strict sequence
//! discipline: a request carrying the slot's current sequence is a replay
//! and is answered from the cached reply, the successor sequence advances
//! the slot, anything else is misordered. One request runs per slot at a
//! time, which is the protocol's own concurrency limit.

use std::sync::{Arc, Mutex};

use crate::dispatch::nfs4::CompoundReply;
use crate::error::Nfs4Status;

#[derive(Default)]
struct Slot {
    last_seq: u32,
    reply: Option<Arc<CompoundReply>>,
    in_progress: bool,
}

/// How a SEQUENCE op resolves against its slot.
#[derive(Debug)]
pub enum SlotCall {
    /// Byte-identical replay of the cached reply.
    Replay(Arc<CompoundReply>),
    /// New request; the slot is now busy until [`Session::complete`].
    Proceed,
}

/// One v4.1 session.
pub struct Session {
    pub id: [u8; 16],
    pub client: u64,
    slots: Vec<Mutex<Slot>>,
}

impl Session {
    pub fn new(id: [u8; 16], client: u64, slot_count: usize) -> Session {
        let slots = (0..slot_count.max(1)).map(|_| Mutex::new(Slot::default())).collect();
        Session { id, client, slots }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Result<std::sync::MutexGuard<'_, Slot>, Nfs4Status> {
        let slot = self.slots.get(index).ok_or(Nfs4Status::NFS4ERR_BADSLOT)?;
        Ok(match slot.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        })
    }

    /// Gates a compound on its slot.
    pub fn begin(&self, index: usize, sequence: u32) -> Result<SlotCall, Nfs4Status> {
        let mut slot = self.slot(index)?;
        if sequence == slot.last_seq {
            return match &slot.reply {
                Some(reply) => Ok(SlotCall::Replay(reply.clone())),
                None => Err(Nfs4Status::NFS4ERR_RETRY_UNCACHED_REP),
            };
        }
        if sequence == slot.last_seq.wrapping_add(1) {
            if slot.in_progress {
                return Err(Nfs4Status::NFS4ERR_DELAY);
            }
            slot.in_progress = true;
            return Ok(SlotCall::Proceed);
        }
        Err(Nfs4Status::NFS4ERR_SEQ_MISORDERED)
    }

    /// Publishes the reply and advances the slot.
    pub fn complete(&self, index: usize, sequence: u32, reply: Arc<CompoundReply>) {
        if let Ok(mut slot) = self.slot(index) {
            slot.last_seq = sequence;
            slot.reply = Some(reply);
            slot.in_progress = false;
        }
    }

    /// Releases a slot without caching (the compound failed before any
    /// state-changing op ran).
    pub fn abandon(&self, index: usize) {
        if let Ok(mut slot) = self.slot(index) {
            slot.in_progress = false;
        }
    }

    /// True while any slot runs a request; a client with live work is not
    /// reaped even if its lease lapsed.
    pub fn any_in_progress(&self) -> bool {
        self.slots.iter().any(|s| match s.lock() {
            Ok(g) => g.in_progress,
            Err(p) => p.into_inner().in_progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Nfs4Status as S;

    fn reply() -> Arc<CompoundReply> {
        Arc::new(CompoundReply {
            status: S::NFS4_OK,
            tag: String::new(),
            results: Vec::new(),
        })
    }

    #[test]
    fn slot_advances_and_replays() {
        let session = Session::new([1; 16], 1, 4);
        assert!(matches!(session.begin(0, 1), Ok(SlotCall::Proceed)));
        let first = reply();
        session.complete(0, 1, first.clone());

        // replay returns the cached reply
        match session.begin(0, 1) {
            Ok(SlotCall::Replay(cached)) => assert!(Arc::ptr_eq(&cached, &first)),
            other => panic!("expected replay, got {:?}", matches!(other, Ok(_))),
        }
        // successor proceeds
        assert!(matches!(session.begin(0, 2), Ok(SlotCall::Proceed)));
    }

    #[test]
    fn misordered_sequences_are_rejected() {
        let session = Session::new([1; 16], 1, 4);
        assert_eq!(session.begin(0, 5).unwrap_err(), S::NFS4ERR_SEQ_MISORDERED);
        assert!(matches!(session.begin(0, 1), Ok(SlotCall::Proceed)));
        session.complete(0, 1, reply());
        assert_eq!(session.begin(0, 5).unwrap_err(), S::NFS4ERR_SEQ_MISORDERED);
    }

    #[test]
    fn busy_slot_reports_delay() {
        let session = Session::new([1; 16], 1, 1);
        assert!(matches!(session.begin(0, 1), Ok(SlotCall::Proceed)));
        assert_eq!(session.begin(0, 2).unwrap_err(), S::NFS4ERR_DELAY);
        assert!(session.any_in_progress());
        session.complete(0, 1, reply());
        assert!(!session.any_in_progress());
    }

    #[test]
    fn bad_slot_index_is_rejected() {
        let session = Session::new([1; 16], 1, 2);
        assert_eq!(session.begin(7, 1).unwrap_err(), S::NFS4ERR_BADSLOT);
    }
}
