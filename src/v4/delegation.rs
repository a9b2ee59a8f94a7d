//! Delegations: server promises that a client may cache without
//! re-checking, subject to recall.
//!
//! At most one write delegation exists per file; read delegations may
//! coexist. A conflicting open from another client triggers a recall
//! callback to the holder and blocks the open for the callback timeout;
//! if the holder does not return the delegation in time it is revoked
//! and the open proceeds.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::engine::FileRef;
use crate::error::Nfs4Status;
use crate::v4::client::CallbackMsg;
use crate::v4::{StateId, V4State};

/// Delegation flavour.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DelegationKind {
    Read,
    Write,
}

/// One granted delegation.
#[derive(Debug, Clone)]
pub struct Delegation {
    pub stateid: StateId,
    pub file: FileRef,
    pub client: u64,
    pub kind: DelegationKind,
    pub granted_at: Instant,
    pub recalled_at: Option<Instant>,
    pub(crate) returned: Arc<Notify>,
}

impl V4State {
    /// Grants a delegation for an open when policy and conflicts allow.
    ///
    /// A write delegation requires that no other client holds an open or
    /// a delegation on the file; a read delegation only requires the
    /// absence of a foreign write delegation.
    pub fn maybe_grant_delegation(
        &self,
        file: FileRef,
        client: u64,
        write: bool,
    ) -> Option<(StateId, DelegationKind)> {
        if !self.settings().current().delegations_enabled {
            return None;
        }
        let foreign_open = self
            .engine()
            .opens()
            .opens_on(file)
            .iter()
            .any(|o| o.owner.client != client);
        if foreign_open {
            return None;
        }
        let mut entry = self.delegations.entry(file).or_default();
        let foreign_deleg = entry.iter().any(|d| {
            d.client != client && (write || d.kind == DelegationKind::Write)
        });
        if foreign_deleg {
            return None;
        }
        let kind = if write { DelegationKind::Write } else { DelegationKind::Read };
        if let Some(existing) = entry.iter().find(|d| d.client == client) {
            if existing.kind == kind || existing.kind == DelegationKind::Write {
                return Some((existing.stateid, existing.kind));
            }
        }
        if write && entry.iter().any(|d| d.client == client) {
            // upgrading read to write: drop the read grant first
            entry.retain(|d| d.client != client);
        }
        let stateid = self.alloc_deleg_state();
        entry.push(Delegation {
            stateid,
            file,
            client,
            kind,
            granted_at: Instant::now(),
            recalled_at: None,
            returned: Arc::new(Notify::new()),
        });
        debug!(client, ?kind, "delegation granted");
        Some((stateid, kind))
    }

    fn alloc_deleg_state(&self) -> StateId {
        self.alloc_state(super::STATE_KIND_DELEG)
    }

    /// Resolves delegations conflicting with an intended open: recalls
    /// them, waits up to the callback timeout, then revokes stragglers.
    pub async fn resolve_delegation_conflicts(
        &self,
        file: FileRef,
        requesting_client: Option<u64>,
        write: bool,
    ) -> Result<(), Nfs4Status> {
        let conflicting: Vec<Delegation> = self
            .delegations
            .get(&file)
            .map(|v| {
                v.iter()
                    .filter(|d| {
                        requesting_client != Some(d.client)
                            && (write || d.kind == DelegationKind::Write)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if conflicting.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        for deleg in &conflicting {
            if let Some(mut entry) = self.delegations.get_mut(&file) {
                if let Some(d) =
                    entry.iter_mut().find(|d| d.stateid.other == deleg.stateid.other)
                {
                    if d.recalled_at.is_none() {
                        d.recalled_at = Some(now);
                    }
                }
            }
            if let Some(holder) = self.client(deleg.client) {
                holder.send_callback(CallbackMsg::Recall {
                    stateid: deleg.stateid,
                    file,
                });
            }
        }

        let wait = self.settings().current().callback_wait();
        for deleg in conflicting {
            let notified = deleg.returned.notified();
            if self.delegation_gone(file, &deleg.stateid) {
                continue;
            }
            let _ = tokio::time::timeout(wait, notified).await;
            if !self.delegation_gone(file, &deleg.stateid) {
                warn!(client = deleg.client, "delegation recall timed out, revoking");
                self.revoke_delegation(file, &deleg.stateid);
            }
        }
        Ok(())
    }

    fn delegation_gone(&self, file: FileRef, stateid: &StateId) -> bool {
        self.delegations
            .get(&file)
            .map(|v| !v.iter().any(|d| d.stateid.other == stateid.other))
            .unwrap_or(true)
    }

    fn revoke_delegation(&self, file: FileRef, stateid: &StateId) {
        if let Some(mut entry) = self.delegations.get_mut(&file) {
            entry.retain(|d| d.stateid.other != stateid.other);
        }
        self.delegations.remove_if(&file, |_, v| v.is_empty());
    }

    /// DELEGRETURN: the holder gives the delegation back; any open blocked
    /// on the recall proceeds.
    pub fn delegreturn(&self, stateid: &StateId) -> Result<(), Nfs4Status> {
        let mut found = None;
        for entry in self.delegations.iter() {
            if entry.value().iter().any(|d| d.stateid.other == stateid.other) {
                found = Some(*entry.key());
                break;
            }
        }
        let file = found.ok_or(Nfs4Status::NFS4ERR_BAD_STATEID)?;
        let mut returned = None;
        if let Some(mut entry) = self.delegations.get_mut(&file) {
            if let Some(pos) =
                entry.iter().position(|d| d.stateid.other == stateid.other)
            {
                returned = Some(entry.remove(pos));
            }
        }
        self.delegations.remove_if(&file, |_, v| v.is_empty());
        match returned {
            Some(deleg) => {
                deleg.returned.notify_one();
                debug!(client = deleg.client, "delegation returned");
                Ok(())
            }
            None => Err(Nfs4Status::NFS4ERR_BAD_STATEID),
        }
    }

    /// The delegation a client holds on a file, if any.
    pub fn delegation_for(&self, file: FileRef, client: u64) -> Option<Delegation> {
        self.delegations
            .get(&file)
            .and_then(|v| v.iter().find(|d| d.client == client).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::inode::InodeId;
    use crate::registry::Registry;
    use crate::settings::{Settings, SettingsHandle};

    fn state() -> V4State {
        let settings = SettingsHandle::new(Settings {
            callback_timeout: 1,
            ..Default::default()
        });
        let engine = Arc::new(Engine::new(settings.clone()));
        V4State::new(1, engine, Arc::new(Registry::new()), settings)
    }

    fn file() -> FileRef {
        FileRef { share: 1, inode: InodeId(3) }
    }

    #[tokio::test]
    async fn read_delegations_coexist_but_write_is_exclusive() {
        let state = state();
        let c1 = state.exchange_id(b"c1", 1).unwrap().client_id;
        let c2 = state.exchange_id(b"c2", 1).unwrap().client_id;

        assert!(state.maybe_grant_delegation(file(), c1, false).is_some());
        assert!(state.maybe_grant_delegation(file(), c2, false).is_some());
        // write delegation over a foreign read grant is refused
        assert!(state.maybe_grant_delegation(file(), c1, true).is_none());
    }

    #[tokio::test]
    async fn delegreturn_unblocks_conflicting_open() {
        let state = Arc::new(state());
        let holder = state.exchange_id(b"holder", 1).unwrap().client_id;
        let (stateid, _) = state.maybe_grant_delegation(file(), holder, true).unwrap();

        let resolver = {
            let state = state.clone();
            tokio::spawn(async move {
                state.resolve_delegation_conflicts(file(), None, true).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        state.delegreturn(&stateid).unwrap();
        resolver.await.unwrap().unwrap();
        assert!(state.delegation_for(file(), holder).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unreturned_delegation_is_revoked_after_timeout() {
        let state = state();
        let holder = state.exchange_id(b"holder", 1).unwrap().client_id;
        state.maybe_grant_delegation(file(), holder, true).unwrap();

        state.resolve_delegation_conflicts(file(), None, true).await.unwrap();
        assert!(state.delegation_for(file(), holder).is_none());
    }

    #[tokio::test]
    async fn recall_message_reaches_holder_callback() {
        let state = state();
        let holder = state.exchange_id(b"holder", 1).unwrap().client_id;
        let mut rx = state.client(holder).unwrap().take_callback().unwrap();
        let (stateid, _) = state.maybe_grant_delegation(file(), holder, false).unwrap();

        let resolve = state.resolve_delegation_conflicts(file(), None, true);
        tokio::pin!(resolve);
        // drive the resolver until the callback lands
        let msg = tokio::select! {
            _ = &mut resolve => panic!("resolver finished before callback observed"),
            msg = rx.recv() => msg.unwrap(),
        };
        match msg {
            CallbackMsg::Recall { stateid: recalled, .. } => {
                assert_eq!(recalled.other, stateid.other);
            }
        }
        state.delegreturn(&stateid).unwrap();
        resolve.await.unwrap();
    }
}
