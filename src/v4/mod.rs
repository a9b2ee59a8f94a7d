//! NFSv4 integrated state: clients, sessions, stateids, delegations.
//!
//! Everything here is memory-only by design: the boot-instance nonce
//! baked into filehandles and the EXCHANGE_ID verifier flow make clients
//! treat a server restart as stale state and recover.
//!
//! Tables are sharded maps so many clients do not contend on one lock;
//! the per-slot locks inside sessions keep the v4.1 single-request-per-
//! slot invariant without serializing whole sessions.

pub mod client;
pub mod delegation;
pub mod session;

pub use client::{spawn_reaper, CallbackMsg, Client, ExchangeIdResult};
pub use delegation::{Delegation, DelegationKind};
pub use session::{Session, SlotCall};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::{Engine, FileRef};
use crate::error::Nfs4Status;
use crate::registry::Registry;
use crate::settings::SettingsHandle;
use crate::store::PayloadStore;

/// A v4 stateid: sequence plus 12 opaque bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StateId {
    pub seq: u32,
    pub other: [u8; 12],
}

impl StateId {
    /// The anonymous stateid (all zero), accepted for stateless I/O.
    pub fn anonymous() -> StateId {
        StateId { seq: 0, other: [0; 12] }
    }

    /// The read-bypass stateid (all ones).
    pub fn bypass() -> StateId {
        StateId { seq: u32::MAX, other: [0xff; 12] }
    }

    pub fn is_special(&self) -> bool {
        *self == StateId::anonymous() || *self == StateId::bypass()
    }

    fn fresh(kind: u8, counter: u64) -> StateId {
        let mut other = [0u8; 12];
        other[0] = kind;
        other[4..].copy_from_slice(&counter.to_be_bytes());
        StateId { seq: 1, other }
    }
}

const STATE_KIND_OPEN: u8 = 1;
const STATE_KIND_LOCK: u8 = 2;
const STATE_KIND_DELEG: u8 = 3;

/// An open stateid's backing record.
#[derive(Debug, Clone)]
pub struct OpenRec {
    pub stateid: StateId,
    pub client: u64,
    pub owner: Vec<u8>,
    pub file: FileRef,
    pub engine_open: u64,
}

/// A lock stateid's backing record.
#[derive(Debug, Clone)]
pub struct LockRec {
    pub stateid: StateId,
    pub client: u64,
    pub owner: Vec<u8>,
    pub file: FileRef,
}

/// The NFSv4 state hub.
pub struct V4State {
    boot_instance: u64,
    settings: SettingsHandle,
    engine: Arc<Engine>,
    registry: Arc<Registry>,
    pub(crate) clients: DashMap<u64, Arc<Client>>,
    pub(crate) by_owner: DashMap<Vec<u8>, u64>,
    pub(crate) sessions: DashMap<[u8; 16], Arc<Session>>,
    opens: DashMap<[u8; 12], OpenRec>,
    open_keys: DashMap<(u64, Vec<u8>, FileRef), [u8; 12]>,
    locks: DashMap<[u8; 12], LockRec>,
    lock_keys: DashMap<(u64, Vec<u8>, FileRef), [u8; 12]>,
    pub(crate) delegations: DashMap<FileRef, Vec<Delegation>>,
    next_client: AtomicU64,
    next_state: AtomicU64,
}

impl V4State {
    pub fn new(
        boot_instance: u64,
        engine: Arc<Engine>,
        registry: Arc<Registry>,
        settings: SettingsHandle,
    ) -> V4State {
        V4State {
            boot_instance,
            settings,
            engine,
            registry,
            clients: DashMap::new(),
            by_owner: DashMap::new(),
            sessions: DashMap::new(),
            opens: DashMap::new(),
            open_keys: DashMap::new(),
            locks: DashMap::new(),
            lock_keys: DashMap::new(),
            delegations: DashMap::new(),
            next_client: AtomicU64::new(1),
            next_state: AtomicU64::new(1),
        }
    }

    /// The boot-instance identifier advertised to clients.
    pub fn boot_instance(&self) -> u64 {
        self.boot_instance
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub(crate) fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub(crate) fn alloc_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_state(&self, kind: u8) -> StateId {
        StateId::fresh(kind, self.next_state.fetch_add(1, Ordering::Relaxed))
    }

    // ---- open stateids ----------------------------------------------------

    /// Registers (or upgrades) the open stateid for `(client, owner, file)`.
    pub fn register_open(
        &self,
        client: u64,
        owner: &[u8],
        file: FileRef,
        engine_open: u64,
    ) -> StateId {
        let key = (client, owner.to_vec(), file);
        if let Some(other) = self.open_keys.get(&key) {
            if let Some(mut rec) = self.opens.get_mut(other.value()) {
                rec.stateid.seq = rec.stateid.seq.wrapping_add(1);
                rec.engine_open = engine_open;
                return rec.stateid;
            }
        }
        let stateid = self.alloc_state(STATE_KIND_OPEN);
        let rec = OpenRec {
            stateid,
            client,
            owner: owner.to_vec(),
            file,
            engine_open,
        };
        self.opens.insert(stateid.other, rec);
        self.open_keys.insert(key, stateid.other);
        stateid
    }

    /// Resolves an open stateid, checking the sequence value.
    pub fn lookup_open(&self, stateid: &StateId) -> Result<OpenRec, Nfs4Status> {
        let rec = self
            .opens
            .get(&stateid.other)
            .map(|r| r.clone())
            .ok_or(Nfs4Status::NFS4ERR_BAD_STATEID)?;
        if stateid.seq != 0 && stateid.seq < rec.stateid.seq {
            return Err(Nfs4Status::NFS4ERR_OLD_STATEID);
        }
        if stateid.seq > rec.stateid.seq {
            return Err(Nfs4Status::NFS4ERR_BAD_STATEID);
        }
        Ok(rec)
    }

    /// Removes an open stateid (CLOSE).
    pub fn remove_open(&self, stateid: &StateId) -> Result<OpenRec, Nfs4Status> {
        let rec = self.lookup_open(stateid)?;
        self.opens.remove(&stateid.other);
        self.open_keys.remove(&(rec.client, rec.owner.clone(), rec.file));
        Ok(rec)
    }

    // ---- lock stateids ----------------------------------------------------

    /// Registers (or bumps) the lock stateid for `(client, owner, file)`.
    pub fn register_lock(&self, client: u64, owner: &[u8], file: FileRef) -> StateId {
        let key = (client, owner.to_vec(), file);
        if let Some(other) = self.lock_keys.get(&key) {
            if let Some(mut rec) = self.locks.get_mut(other.value()) {
                rec.stateid.seq = rec.stateid.seq.wrapping_add(1);
                return rec.stateid;
            }
        }
        let stateid = self.alloc_state(STATE_KIND_LOCK);
        let rec = LockRec { stateid, client, owner: owner.to_vec(), file };
        self.locks.insert(stateid.other, rec);
        self.lock_keys.insert(key, stateid.other);
        stateid
    }

    pub fn lookup_lock(&self, stateid: &StateId) -> Result<LockRec, Nfs4Status> {
        self.locks
            .get(&stateid.other)
            .map(|r| r.clone())
            .ok_or(Nfs4Status::NFS4ERR_BAD_STATEID)
    }

    pub fn remove_lock(&self, stateid: &StateId) -> Option<LockRec> {
        let rec = self.locks.remove(&stateid.other).map(|(_, r)| r)?;
        self.lock_keys.remove(&(rec.client, rec.owner.clone(), rec.file));
        Some(rec)
    }

    // ---- cascades ---------------------------------------------------------

    /// Drops every piece of state a client holds: opens, locks,
    /// delegations, sessions. Used by lease expiry, DESTROY_CLIENTID and
    /// verifier-change reboot detection.
    pub(crate) fn cascade_release(&self, client_id: u64) {
        // engine-side opens and locks, with deferred payload deletes
        for outcome in self.engine.opens().release_client(client_id) {
            if let Some(content) = outcome.release_content {
                if let Some(share) = self.registry.share_by_tag(outcome.state.file.share) {
                    share.write_cache.discard(outcome.state.file.inode);
                    if let Some(rc) = &share.read_cache {
                        rc.invalidate(&content);
                    }
                    let payload = share.payload.clone();
                    tokio::spawn(async move {
                        let _ = payload.delete(&content).await;
                    });
                }
            }
        }
        self.engine.locks().release_client(client_id);

        // stateid tables
        self.opens.retain(|_, rec| rec.client != client_id);
        self.open_keys.retain(|key, _| key.0 != client_id);
        self.locks.retain(|_, rec| rec.client != client_id);
        self.lock_keys.retain(|key, _| key.0 != client_id);

        // delegations: wake anyone waiting on a recall
        self.delegations.retain(|_, delegations| {
            delegations.retain(|d| {
                if d.client == client_id {
                    d.returned.notify_waiters();
                    false
                } else {
                    true
                }
            });
            !delegations.is_empty()
        });

        // sessions
        let session_ids: Vec<[u8; 16]> = self
            .sessions
            .iter()
            .filter(|s| s.client == client_id)
            .map(|s| s.id)
            .collect();
        for id in session_ids {
            self.sessions.remove(&id);
        }
    }
}
