//! Buffered-write arena.
//!
//! Writes land here as sparse `(offset, bytes)` ranges keyed by inode id
//! and only reach the payload store when the engine commits. The arena
//! reports pressure so the engine can trigger commits: a per-inode staged
//! size crossing the multipart threshold, or the arena total crossing its
//! byte ceiling (which back-pressures writers by forcing a synchronous
//! commit of the largest entry).
//!
//! Ordering: range bookkeeping is mutex-protected per entry, and commits
//! of the same inode serialize on a per-entry gate. Writes staged while a
//! commit is in flight simply join the next commit; the entry's change
//! sequence tells a finishing commit whether it may clear the ranges.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::inode::InodeId;

/// Arena tuning knobs.
#[derive(Debug, Clone)]
pub struct WriteCacheConfig {
    /// Total staged-byte ceiling across all inodes.
    pub capacity: u64,
    /// Per-inode staged size that triggers an early commit when the
    /// payload store supports incremental writes.
    pub commit_threshold: u64,
    /// How long a failed entry's staged bytes are retained for a retried
    /// commit before being discarded.
    pub failed_retention: Duration,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        WriteCacheConfig {
            capacity: 256 * 1024 * 1024,
            commit_threshold: 5 * 1024 * 1024,
            failed_retention: Duration::from_secs(60),
        }
    }
}

/// Signal returned by [`WriteCache::stage`] telling the engine whether a
/// commit should run now.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WritePressure {
    None,
    /// This inode's staged bytes crossed the multipart threshold.
    CommitThreshold,
    /// The arena ceiling is exceeded; commit the largest victim before
    /// accepting more.
    Ceiling,
}

#[derive(Default)]
struct EntryState {
    ranges: BTreeMap<u64, Vec<u8>>,
    high_water: u64,
    /// Bumped on every staged write; lets a commit detect concurrent
    /// staging and leave the ranges for the next commit.
    seq: u64,
    dirty_since: Option<Instant>,
    failed_since: Option<Instant>,
}

/// Per-inode arena entry.
pub struct WriteEntry {
    id: InodeId,
    state: Mutex<EntryState>,
    bytes: AtomicU64,
    /// Serializes commits of this inode.
    commit_gate: tokio::sync::Mutex<()>,
}

impl WriteEntry {
    fn new(id: InodeId) -> WriteEntry {
        WriteEntry {
            id,
            state: Mutex::new(EntryState::default()),
            bytes: AtomicU64::new(0),
            commit_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    /// Currently staged bytes.
    pub fn staged_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    /// Takes the commit gate; holders are the only in-flight commit for
    /// this inode.
    pub async fn begin_commit(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.commit_gate.lock().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EntryState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

/// Snapshot of an entry's staged state taken at commit start.
#[derive(Debug, Clone)]
pub struct StagedSnapshot {
    pub ranges: Vec<(u64, Vec<u8>)>,
    pub high_water: u64,
    pub seq: u64,
}

/// The buffered-write arena.
pub struct WriteCache {
    entries: Mutex<HashMap<InodeId, std::sync::Arc<WriteEntry>>>,
    total: AtomicU64,
    config: WriteCacheConfig,
}

impl Default for WriteCache {
    fn default() -> Self {
        WriteCache::new(WriteCacheConfig::default())
    }
}

impl WriteCache {
    pub fn new(config: WriteCacheConfig) -> WriteCache {
        WriteCache { entries: Mutex::new(HashMap::new()), total: AtomicU64::new(0), config }
    }

    pub fn config(&self) -> &WriteCacheConfig {
        &self.config
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<InodeId, std::sync::Arc<WriteEntry>>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// The entry for an inode, creating it on first write.
    pub fn entry(&self, id: InodeId) -> std::sync::Arc<WriteEntry> {
        self.map().entry(id).or_insert_with(|| std::sync::Arc::new(WriteEntry::new(id))).clone()
    }

    /// The entry for an inode if any bytes are staged.
    pub fn peek(&self, id: InodeId) -> Option<std::sync::Arc<WriteEntry>> {
        self.map().get(&id).cloned()
    }

    /// Stages a write and reports commit pressure.
    pub fn stage(&self, id: InodeId, offset: u64, data: &[u8]) -> WritePressure {
        let entry = self.entry(id);
        let (staged, delta) = {
            let mut state = entry.lock();
            let delta = insert_range(&mut state.ranges, offset, data);
            state.high_water = state.high_water.max(offset + data.len() as u64);
            state.seq += 1;
            state.failed_since = None;
            if state.dirty_since.is_none() {
                state.dirty_since = Some(Instant::now());
            }
            let staged: u64 = state.ranges.values().map(|v| v.len() as u64).sum();
            entry.bytes.store(staged, Ordering::Release);
            (staged, delta)
        };
        if delta >= 0 {
            self.total.fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.total.fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
        if self.total.load(Ordering::Acquire) > self.config.capacity {
            WritePressure::Ceiling
        } else if staged >= self.config.commit_threshold {
            WritePressure::CommitThreshold
        } else {
            WritePressure::None
        }
    }

    /// Clones the staged ranges for a commit or a read overlay.
    pub fn snapshot(&self, id: InodeId) -> Option<StagedSnapshot> {
        let entry = self.peek(id)?;
        let state = entry.lock();
        if state.ranges.is_empty() {
            return None;
        }
        Some(StagedSnapshot {
            ranges: state.ranges.iter().map(|(k, v)| (*k, v.clone())).collect(),
            high_water: state.high_water,
            seq: state.seq,
        })
    }

    /// Marks a commit as complete. Ranges are cleared only when nothing
    /// was staged since the snapshot; later writes stay for the next
    /// commit.
    pub fn commit_finished(&self, id: InodeId, seq: u64) {
        let Some(entry) = self.peek(id) else { return };
        let mut state = entry.lock();
        if state.seq != seq {
            return;
        }
        let released: u64 = state.ranges.values().map(|v| v.len() as u64).sum();
        state.ranges.clear();
        state.dirty_since = None;
        state.failed_since = None;
        entry.bytes.store(0, Ordering::Release);
        drop(state);
        self.total.fetch_sub(released, Ordering::AcqRel);
    }

    /// Records a failed commit; staged bytes are retained for a bounded
    /// time so a retried commit can succeed.
    pub fn commit_failed(&self, id: InodeId) {
        if let Some(entry) = self.peek(id) {
            entry.lock().failed_since = Some(Instant::now());
        }
    }

    /// Drops an entry outright (inode removed, or failure retention
    /// elapsed).
    pub fn discard(&self, id: InodeId) {
        if let Some(entry) = self.map().remove(&id) {
            let mut state = entry.lock();
            let released: u64 = state.ranges.values().map(|v| v.len() as u64).sum();
            state.ranges.clear();
            entry.bytes.store(0, Ordering::Release);
            drop(state);
            self.total.fetch_sub(released, Ordering::AcqRel);
        }
    }

    /// Drops entries whose failed commit is older than the retention
    /// bound.
    pub fn prune_failed(&self) {
        let stale: Vec<InodeId> = self
            .map()
            .values()
            .filter(|e| {
                e.lock()
                    .failed_since
                    .map(|at| at.elapsed() > self.config.failed_retention)
                    .unwrap_or(false)
            })
            .map(|e| e.id)
            .collect();
        for id in stale {
            self.discard(id);
        }
    }

    /// Total staged bytes across all inodes.
    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// The inode holding the most staged bytes, i.e. the ceiling victim.
    pub fn largest(&self) -> Option<InodeId> {
        self.map()
            .values()
            .max_by_key(|e| e.staged_bytes())
            .filter(|e| e.staged_bytes() > 0)
            .map(|e| e.id)
    }

    /// Inodes with staged bytes, for shutdown flushing.
    pub fn dirty_inodes(&self) -> Vec<InodeId> {
        self.map().values().filter(|e| e.staged_bytes() > 0).map(|e| e.id).collect()
    }
}

/// Inserts a range, trimming any overlapped staged bytes. Returns the
/// signed change in staged byte count.
fn insert_range(map: &mut BTreeMap<u64, Vec<u8>>, offset: u64, data: &[u8]) -> i64 {
    let end = offset + data.len() as u64;
    let mut delta = data.len() as i64;

    let overlapping: Vec<u64> = map
        .range(..end)
        .filter(|(start, bytes)| *start + bytes.len() as u64 > offset)
        .map(|(start, _)| *start)
        .collect();
    for start in overlapping {
        let bytes = match map.remove(&start) {
            Some(b) => b,
            None => continue,
        };
        let rend = start + bytes.len() as u64;
        delta -= bytes.len() as i64;
        if start < offset {
            let keep = (offset - start) as usize;
            delta += keep as i64;
            map.insert(start, bytes[..keep].to_vec());
        }
        if rend > end {
            let skip = (end - start) as usize;
            delta += (rend - end) as i64;
            map.insert(end, bytes[skip..].to_vec());
        }
    }
    map.insert(offset, data.to_vec());
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_writes_trim_older_ranges() {
        let mut map = BTreeMap::new();
        insert_range(&mut map, 0, b"aaaaaaaaaa");
        insert_range(&mut map, 3, b"bbb");
        let ranges: Vec<(u64, Vec<u8>)> = map.into_iter().collect();
        assert_eq!(
            ranges,
            vec![
                (0, b"aaa".to_vec()),
                (3, b"bbb".to_vec()),
                (6, b"aaaa".to_vec()),
            ]
        );
    }

    #[test]
    fn stage_tracks_totals_and_high_water() {
        let cache = WriteCache::default();
        let id = InodeId(7);
        assert_eq!(cache.stage(id, 0, b"hello"), WritePressure::None);
        assert_eq!(cache.stage(id, 10, b"world"), WritePressure::None);
        assert_eq!(cache.total_bytes(), 10);
        let snap = cache.snapshot(id).unwrap();
        assert_eq!(snap.high_water, 15);
        assert_eq!(snap.ranges.len(), 2);
    }

    #[test]
    fn commit_clears_only_when_unchanged() {
        let cache = WriteCache::default();
        let id = InodeId(7);
        cache.stage(id, 0, b"data");
        let snap = cache.snapshot(id).unwrap();

        // a write lands mid-commit; the finishing commit must not clear it
        cache.stage(id, 4, b"more");
        cache.commit_finished(id, snap.seq);
        assert!(cache.snapshot(id).is_some());

        let snap = cache.snapshot(id).unwrap();
        cache.commit_finished(id, snap.seq);
        assert!(cache.snapshot(id).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn ceiling_pressure_reports_largest_victim() {
        let cache = WriteCache::new(WriteCacheConfig {
            capacity: 8,
            commit_threshold: 1024,
            failed_retention: Duration::from_secs(1),
        });
        cache.stage(InodeId(1), 0, b"abc");
        assert_eq!(cache.stage(InodeId(2), 0, b"defghijkl"), WritePressure::Ceiling);
        assert_eq!(cache.largest(), Some(InodeId(2)));
    }
}
