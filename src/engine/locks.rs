//! Byte-range lock state.
//!
//! Locks are advisory and per owner: an owner never conflicts with its
//! own locks, and I/O from the lock-holding client is never blocked.
//! Blocking acquisitions park on a per-file wait queue and are woken by
//! any release that intersects their range; a wait-for graph detects
//! cycles before a waiter parks, so a deadlock surfaces as an error
//! instead of a hang.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::engine::FileRef;
use crate::error::{EngineError, EngineResult};

/// Half-open byte range `[start, end)`; `end == u64::MAX` reaches EOF.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
}

impl LockRange {
    /// Range from an offset/length pair; length 0 means to EOF.
    pub fn new(offset: u64, length: u64) -> LockRange {
        let end = if length == 0 { u64::MAX } else { offset.saturating_add(length) };
        LockRange { start: offset, end }
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Subtracts `cut`, leaving up to two fragments.
    fn subtract(&self, cut: &LockRange) -> SmallVec<[LockRange; 2]> {
        let mut out = SmallVec::new();
        if !self.overlaps(cut) {
            out.push(*self);
            return out;
        }
        if self.start < cut.start {
            out.push(LockRange { start: self.start, end: cut.start });
        }
        if cut.end < self.end {
            out.push(LockRange { start: cut.end, end: self.end });
        }
        out
    }
}

/// Lock flavour.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

fn kinds_conflict(a: LockKind, b: LockKind) -> bool {
    !(a == LockKind::Shared && b == LockKind::Shared)
}

/// Lock owner identity: protocol client plus opaque owner bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub client: u64,
    pub owner: Vec<u8>,
}

#[derive(Debug, Clone)]
struct HeldLock {
    owner: LockOwner,
    range: LockRange,
    kind: LockKind,
}

struct Waiter {
    owner: LockOwner,
    range: LockRange,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct FileLocks {
    held: Vec<HeldLock>,
    waiters: Vec<Waiter>,
}

/// A conflicting holder reported by `lock_test`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: LockOwner,
    pub range: LockRange,
    pub kind: LockKind,
}

/// The lock table.
#[derive(Default)]
pub struct LockTable {
    files: Mutex<HashMap<FileRef, FileLocks>>,
    /// Wait-for graph: parked owner -> owners it waits on.
    waits: Mutex<HashMap<LockOwner, HashSet<LockOwner>>>,
}

impl LockTable {
    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<FileRef, FileLocks>> {
        match self.files.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn waits(&self) -> std::sync::MutexGuard<'_, HashMap<LockOwner, HashSet<LockOwner>>> {
        match self.waits.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn clear_edges(&self, owner: &LockOwner) {
        self.waits().remove(owner);
    }

    /// True when following wait-for edges from `start` leads back to it.
    fn creates_cycle(
        waits: &HashMap<LockOwner, HashSet<LockOwner>>,
        start: &LockOwner,
    ) -> bool {
        let mut stack: Vec<&LockOwner> = waits.get(start).into_iter().flatten().collect();
        let mut seen: HashSet<&LockOwner> = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == start {
                return true;
            }
            if seen.insert(next) {
                stack.extend(waits.get(next).into_iter().flatten());
            }
        }
        false
    }

    /// Acquires a lock, optionally waiting for conflicting holders.
    pub async fn lock(
        &self,
        file: FileRef,
        owner: &LockOwner,
        range: LockRange,
        kind: LockKind,
        blocking: bool,
        deadline: Instant,
    ) -> EngineResult<()> {
        loop {
            let notify = {
                let mut files = self.files();
                let locks = files.entry(file).or_default();
                let conflicting: Vec<LockOwner> = locks
                    .held
                    .iter()
                    .filter(|h| {
                        h.owner != *owner
                            && h.range.overlaps(&range)
                            && kinds_conflict(h.kind, kind)
                    })
                    .map(|h| h.owner.clone())
                    .collect();
                if conflicting.is_empty() {
                    locks.held.push(HeldLock { owner: owner.clone(), range, kind });
                    drop(files);
                    self.clear_edges(owner);
                    return Ok(());
                }
                if !blocking {
                    return Err(EngineError::Denied);
                }
                {
                    let mut waits = self.waits();
                    let edges = waits.entry(owner.clone()).or_default();
                    for c in conflicting {
                        edges.insert(c);
                    }
                    if Self::creates_cycle(&waits, owner) {
                        waits.remove(owner);
                        return Err(EngineError::Deadlock);
                    }
                }
                let notify = Arc::new(Notify::new());
                locks.waiters.push(Waiter {
                    owner: owner.clone(),
                    range,
                    notify: notify.clone(),
                });
                notify
            };
            if tokio::time::timeout_at(deadline, notify.notified()).await.is_err() {
                // deadline elapsed while parked: withdraw
                let mut files = self.files();
                if let Some(locks) = files.get_mut(&file) {
                    locks.waiters.retain(|w| !Arc::ptr_eq(&w.notify, &notify));
                }
                drop(files);
                self.clear_edges(owner);
                return Err(EngineError::Timeout);
            }
            self.clear_edges(owner);
        }
    }

    /// Releases the owner's locks intersecting the range and wakes waiters
    /// touching the freed bytes.
    pub fn unlock(&self, file: FileRef, owner: &LockOwner, range: LockRange) {
        let mut files = self.files();
        let Some(locks) = files.get_mut(&file) else { return };
        let mut kept: Vec<HeldLock> = Vec::with_capacity(locks.held.len());
        let mut freed = false;
        for held in locks.held.drain(..) {
            if held.owner != *owner || !held.range.overlaps(&range) {
                kept.push(held);
                continue;
            }
            freed = true;
            for fragment in held.range.subtract(&range) {
                kept.push(HeldLock { owner: held.owner.clone(), range: fragment, kind: held.kind });
            }
        }
        locks.held = kept;
        if freed {
            Self::wake_waiters(locks, &range);
        }
        if locks.held.is_empty() && locks.waiters.is_empty() {
            files.remove(&file);
        }
    }

    fn wake_waiters(locks: &mut FileLocks, freed: &LockRange) {
        let mut remaining = Vec::with_capacity(locks.waiters.len());
        for waiter in locks.waiters.drain(..) {
            if waiter.range.overlaps(freed) {
                waiter.notify.notify_one();
            } else {
                remaining.push(waiter);
            }
        }
        locks.waiters = remaining;
    }

    /// Reports a conflicting holder without acquiring.
    pub fn lock_test(
        &self,
        file: FileRef,
        owner: &LockOwner,
        range: LockRange,
        kind: LockKind,
    ) -> Option<LockHolder> {
        let files = self.files();
        let locks = files.get(&file)?;
        locks
            .held
            .iter()
            .find(|h| {
                h.owner != *owner && h.range.overlaps(&range) && kinds_conflict(h.kind, kind)
            })
            .map(|h| LockHolder { owner: h.owner.clone(), range: h.range, kind: h.kind })
    }

    /// Best-effort advisory enforcement against I/O from other clients.
    /// Reads conflict with foreign exclusive locks, writes with any
    /// foreign lock.
    pub fn io_conflict(
        &self,
        file: FileRef,
        client: Option<u64>,
        range: LockRange,
        is_write: bool,
    ) -> bool {
        let files = self.files();
        let Some(locks) = files.get(&file) else { return false };
        locks.held.iter().any(|h| {
            client.map(|c| h.owner.client != c).unwrap_or(true)
                && h.range.overlaps(&range)
                && (is_write || h.kind == LockKind::Exclusive)
        })
    }

    /// Drops every lock and waiter belonging to an owner.
    pub fn release_owner(&self, owner: &LockOwner) {
        let mut files = self.files();
        let all = LockRange { start: 0, end: u64::MAX };
        files.retain(|_, locks| {
            let before = locks.held.len();
            locks.held.retain(|h| h.owner != *owner);
            locks.waiters.retain(|w| w.owner != *owner);
            if locks.held.len() != before {
                Self::wake_waiters(locks, &all);
            }
            !locks.held.is_empty() || !locks.waiters.is_empty()
        });
        drop(files);
        self.clear_edges(owner);
    }

    /// Drops every lock and waiter belonging to a client.
    pub fn release_client(&self, client: u64) {
        let owners: Vec<LockOwner> = {
            let files = self.files();
            files
                .values()
                .flat_map(|l| l.held.iter().map(|h| h.owner.clone()))
                .filter(|o| o.client == client)
                .collect()
        };
        for owner in owners {
            self.release_owner(&owner);
        }
    }

    /// Locks held by an owner on a file (test observability).
    pub fn held_by(&self, file: FileRef, owner: &LockOwner) -> Vec<LockRange> {
        let files = self.files();
        files
            .get(&file)
            .map(|l| {
                l.held
                    .iter()
                    .filter(|h| h.owner == *owner)
                    .map(|h| h.range)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeId;
    use std::time::Duration;

    fn file() -> FileRef {
        FileRef { share: 1, inode: InodeId(5) }
    }

    fn owner(client: u64) -> LockOwner {
        LockOwner { client, owner: vec![client as u8] }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_overlap_from_other_owner() {
        let table = LockTable::default();
        table
            .lock(file(), &owner(1), LockRange::new(0, 100), LockKind::Exclusive, false, deadline())
            .await
            .unwrap();
        let err = table
            .lock(file(), &owner(2), LockRange::new(50, 200), LockKind::Exclusive, false, deadline())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Denied);

        // disjoint range is fine
        table
            .lock(file(), &owner(2), LockRange::new(100, 50), LockKind::Exclusive, false, deadline())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shared_locks_coexist() {
        let table = LockTable::default();
        table
            .lock(file(), &owner(1), LockRange::new(0, 10), LockKind::Shared, false, deadline())
            .await
            .unwrap();
        table
            .lock(file(), &owner(2), LockRange::new(0, 10), LockKind::Shared, false, deadline())
            .await
            .unwrap();
        let err = table
            .lock(file(), &owner(3), LockRange::new(5, 1), LockKind::Exclusive, false, deadline())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Denied);
    }

    #[tokio::test]
    async fn unlock_wakes_blocked_waiter() {
        let table = Arc::new(LockTable::default());
        table
            .lock(file(), &owner(1), LockRange::new(0, 100), LockKind::Exclusive, false, deadline())
            .await
            .unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .lock(
                        file(),
                        &owner(2),
                        LockRange::new(0, 100),
                        LockKind::Exclusive,
                        true,
                        deadline(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.unlock(file(), &owner(1), LockRange::new(0, 100));
        waiter.await.unwrap().unwrap();
        assert_eq!(table.held_by(file(), &owner(2)), vec![LockRange::new(0, 100)]);
    }

    #[tokio::test]
    async fn partial_unlock_leaves_fragments() {
        let table = LockTable::default();
        table
            .lock(file(), &owner(1), LockRange::new(0, 100), LockKind::Exclusive, false, deadline())
            .await
            .unwrap();
        table.unlock(file(), &owner(1), LockRange::new(40, 20));
        let mut held = table.held_by(file(), &owner(1));
        held.sort_by_key(|r| r.start);
        assert_eq!(held, vec![LockRange::new(0, 40), LockRange::new(60, 40)]);
    }

    #[tokio::test]
    async fn wait_cycle_is_reported_as_deadlock() {
        let table = Arc::new(LockTable::default());
        let file_a = FileRef { share: 1, inode: InodeId(1) };
        let file_b = FileRef { share: 1, inode: InodeId(2) };
        let range = LockRange::new(0, 10);

        table
            .lock(file_a, &owner(1), range, LockKind::Exclusive, false, deadline())
            .await
            .unwrap();
        table
            .lock(file_b, &owner(2), range, LockKind::Exclusive, false, deadline())
            .await
            .unwrap();

        // owner 1 parks on file_b (held by owner 2)
        let parked = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .lock(file_b, &owner(1), range, LockKind::Exclusive, true, deadline())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // owner 2 asking for file_a would close the cycle
        let err = table
            .lock(file_a, &owner(2), range, LockKind::Exclusive, true, deadline())
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Deadlock);

        table.unlock(file_b, &owner(2), range);
        parked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_test_reports_holder() {
        let table = LockTable::default();
        table
            .lock(file(), &owner(1), LockRange::new(0, 10), LockKind::Exclusive, false, deadline())
            .await
            .unwrap();
        let holder = table
            .lock_test(file(), &owner(2), LockRange::new(5, 1), LockKind::Shared)
            .unwrap();
        assert_eq!(holder.owner, owner(1));
        assert!(table
            .lock_test(file(), &owner(1), LockRange::new(5, 1), LockKind::Shared)
            .is_none());
    }

    #[tokio::test]
    async fn io_conflict_is_client_scoped() {
        let table = LockTable::default();
        table
            .lock(file(), &owner(1), LockRange::new(0, 10), LockKind::Exclusive, false, deadline())
            .await
            .unwrap();
        assert!(table.io_conflict(file(), Some(2), LockRange::new(0, 4), true));
        assert!(!table.io_conflict(file(), Some(1), LockRange::new(0, 4), true));
        assert!(table.io_conflict(file(), None, LockRange::new(0, 4), false));
    }
}
