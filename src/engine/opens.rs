//! Open state and share reservations.
//!
//! Opens are the cross-protocol view of "this client holds this file":
//! NFSv4 OPEN stateids and SMB2 handles both map onto entries here, so a
//! deny-read taken over SMB2 blocks an NFSv4 open and vice versa. The
//! table also parks content keys of unlinked-but-open files; the last
//! close releases them for payload deletion.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::engine::FileRef;
use crate::error::{EngineError, EngineResult};
use crate::store::ContentId;

/// Open access/deny bit set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct AccessBits(pub u8);

impl AccessBits {
    pub const NONE: AccessBits = AccessBits(0);
    pub const READ: AccessBits = AccessBits(1);
    pub const WRITE: AccessBits = AccessBits(2);
    pub const BOTH: AccessBits = AccessBits(3);

    pub fn intersects(&self, other: AccessBits) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(&self, other: AccessBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(&self, other: AccessBits) -> AccessBits {
        AccessBits(self.0 | other.0)
    }
}

/// Identity of an open's owner: the protocol client plus its opaque
/// owner bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpenOwner {
    pub client: u64,
    pub owner: Vec<u8>,
}

/// One open.
#[derive(Debug, Clone)]
pub struct OpenState {
    pub id: u64,
    pub file: FileRef,
    pub owner: OpenOwner,
    pub access: AccessBits,
    pub deny: AccessBits,
}

#[derive(Default)]
struct Tables {
    next: u64,
    opens: HashMap<u64, OpenState>,
    by_file: HashMap<FileRef, Vec<u64>>,
    /// Content keys of inodes that dropped to zero links while opens
    /// remained; released on last close.
    pending_delete: HashMap<FileRef, ContentId>,
}

/// The open table.
#[derive(Default)]
pub struct OpenTable {
    inner: Mutex<Tables>,
}

/// What a close released.
#[derive(Debug)]
pub struct CloseOutcome {
    pub state: OpenState,
    /// Set when this was the last open on an unlinked inode: the content
    /// key is now free for payload deletion.
    pub release_content: Option<ContentId>,
}

impl OpenTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Opens a file, enforcing share reservations against opens from other
    /// clients. An open by the same owner upgrades in place (bit union).
    pub fn open(
        &self,
        file: FileRef,
        owner: OpenOwner,
        access: AccessBits,
        deny: AccessBits,
    ) -> EngineResult<OpenState> {
        let mut tables = self.lock();
        let ids = tables.by_file.get(&file).cloned().unwrap_or_default();
        let mut upgrade = None;
        for id in &ids {
            let Some(existing) = tables.opens.get(id) else { continue };
            if existing.owner == owner {
                upgrade = Some(*id);
                continue;
            }
            if existing.owner.client != owner.client
                && (access.intersects(existing.deny) || deny.intersects(existing.access))
            {
                return Err(EngineError::Denied);
            }
        }
        if let Some(id) = upgrade {
            let open = tables.opens.get_mut(&id).expect("upgrade target exists");
            open.access = open.access.union(access);
            open.deny = open.deny.union(deny);
            return Ok(open.clone());
        }
        tables.next += 1;
        let id = tables.next;
        let state = OpenState { id, file, owner, access, deny };
        tables.opens.insert(id, state.clone());
        tables.by_file.entry(file).or_default().push(id);
        Ok(state)
    }

    /// Closes an open by id.
    pub fn close(&self, id: u64) -> EngineResult<CloseOutcome> {
        let mut tables = self.lock();
        let state = tables.opens.remove(&id).ok_or(EngineError::StaleHandle)?;
        let remaining = {
            let ids = tables.by_file.entry(state.file).or_default();
            ids.retain(|o| *o != id);
            let remaining = ids.len();
            if remaining == 0 {
                tables.by_file.remove(&state.file);
            }
            remaining
        };
        let release_content = if remaining == 0 {
            tables.pending_delete.remove(&state.file)
        } else {
            None
        };
        Ok(CloseOutcome { state, release_content })
    }

    pub fn get(&self, id: u64) -> Option<OpenState> {
        self.lock().opens.get(&id).cloned()
    }

    /// All opens on a file.
    pub fn opens_on(&self, file: FileRef) -> Vec<OpenState> {
        let tables = self.lock();
        tables
            .by_file
            .get(&file)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.opens.get(id).cloned())
            .collect()
    }

    pub fn has_opens(&self, file: FileRef) -> bool {
        self.lock().by_file.contains_key(&file)
    }

    /// Parks a content key until the file's last open closes. Returns the
    /// key back if no open holds the file after all.
    pub fn defer_delete(&self, file: FileRef, content: ContentId) -> Option<ContentId> {
        let mut tables = self.lock();
        if tables.by_file.contains_key(&file) {
            tables.pending_delete.insert(file, content);
            None
        } else {
            Some(content)
        }
    }

    /// Drops every open held by a client, returning the close outcomes.
    pub fn release_client(&self, client: u64) -> Vec<CloseOutcome> {
        let ids: Vec<u64> = self
            .lock()
            .opens
            .values()
            .filter(|o| o.owner.client == client)
            .map(|o| o.id)
            .collect();
        ids.into_iter().filter_map(|id| self.close(id).ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeId;

    fn file() -> FileRef {
        FileRef { share: 1, inode: InodeId(10) }
    }

    fn owner(client: u64) -> OpenOwner {
        OpenOwner { client, owner: vec![client as u8] }
    }

    #[test]
    fn deny_bits_block_other_clients() {
        let table = OpenTable::default();
        table
            .open(file(), owner(1), AccessBits::READ, AccessBits::WRITE)
            .unwrap();
        // second client asks for the denied access
        let err = table
            .open(file(), owner(2), AccessBits::WRITE, AccessBits::NONE)
            .unwrap_err();
        assert_eq!(err, EngineError::Denied);
        // compatible access is fine
        table
            .open(file(), owner(2), AccessBits::READ, AccessBits::NONE)
            .unwrap();
    }

    #[test]
    fn same_owner_upgrades_in_place() {
        let table = OpenTable::default();
        let first = table
            .open(file(), owner(1), AccessBits::READ, AccessBits::NONE)
            .unwrap();
        let second = table
            .open(file(), owner(1), AccessBits::WRITE, AccessBits::NONE)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.access, AccessBits::BOTH);
    }

    #[test]
    fn last_close_releases_parked_content() {
        let table = OpenTable::default();
        let a = table
            .open(file(), owner(1), AccessBits::READ, AccessBits::NONE)
            .unwrap();
        let b = table
            .open(file(), owner(2), AccessBits::READ, AccessBits::NONE)
            .unwrap();
        let key = ContentId::fresh("/export");
        assert!(table.defer_delete(file(), key.clone()).is_none());

        let out = table.close(a.id).unwrap();
        assert!(out.release_content.is_none());
        let out = table.close(b.id).unwrap();
        assert_eq!(out.release_content, Some(key));
    }

    #[test]
    fn release_client_drops_all_its_opens() {
        let table = OpenTable::default();
        table
            .open(file(), owner(1), AccessBits::READ, AccessBits::NONE)
            .unwrap();
        table
            .open(FileRef { share: 1, inode: InodeId(11) }, owner(1), AccessBits::WRITE, AccessBits::NONE)
            .unwrap();
        let closed = table.release_client(1);
        assert_eq!(closed.len(), 2);
        assert!(!table.has_opens(file()));
    }
}
