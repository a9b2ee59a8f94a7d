//! v4 client records, lease handling and the reaper.
//!
//! A client is born unconfirmed by EXCHANGE_ID (or SETCLIENTID for v4.0),
//! confirmed by its first CREATE_SESSION (or SETCLIENTID_CONFIRM), kept
//! alive by any SEQUENCE or RENEW, and reaped when its lease lapses with
//! no running request. Abrupt disconnects leave everything in place until
//! the lease runs out, so a short reconnect reuses the client id.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::engine::FileRef;
use crate::error::Nfs4Status;
use crate::v4::session::Session;
use crate::v4::{StateId, V4State};

/// Message sent to a client's callback channel.
#[derive(Debug, Clone)]
pub enum CallbackMsg {
    /// The server wants a delegation back.
    Recall { stateid: StateId, file: FileRef },
}

/// One v4 client.
pub struct Client {
    pub id: u64,
    pub owner: Vec<u8>,
    pub verifier: u64,
    pub confirmed: AtomicBool,
    lease_expiry: Mutex<Instant>,
    create_session_seq: AtomicU32,
    last_session: Mutex<Option<[u8; 16]>>,
    callback_tx: mpsc::UnboundedSender<CallbackMsg>,
    callback_rx: Mutex<Option<mpsc::UnboundedReceiver<CallbackMsg>>>,
}

impl Client {
    fn new(id: u64, owner: &[u8], verifier: u64, lease: Duration) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        Client {
            id,
            owner: owner.to_vec(),
            verifier,
            confirmed: AtomicBool::new(false),
            lease_expiry: Mutex::new(Instant::now() + lease),
            create_session_seq: AtomicU32::new(1),
            last_session: Mutex::new(None),
            callback_tx: tx,
            callback_rx: Mutex::new(Some(rx)),
        }
    }

    /// Extends the lease.
    pub fn renew(&self, lease: Duration) {
        if let Ok(mut expiry) = self.lease_expiry.lock() {
            *expiry = Instant::now() + lease;
        }
    }

    pub fn lease_expired(&self) -> bool {
        self.lease_expiry
            .lock()
            .map(|expiry| *expiry <= Instant::now())
            .unwrap_or(true)
    }

    /// Sends a callback message to the client's callback task.
    pub fn send_callback(&self, msg: CallbackMsg) -> bool {
        self.callback_tx.send(msg).is_ok()
    }

    /// Hands the callback receiver to the connection that services this
    /// client's backchannel. Only the first caller gets it.
    pub fn take_callback(&self) -> Option<mpsc::UnboundedReceiver<CallbackMsg>> {
        self.callback_rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

/// Outcome of EXCHANGE_ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeIdResult {
    pub client_id: u64,
    pub confirmed: bool,
    pub created: bool,
}

impl V4State {
    /// EXCHANGE_ID: idempotent per `(owner, verifier)`. A matching owner
    /// with a different verifier means the client rebooted, so its previous
    /// incarnation and all its state are destroyed. Fails with
    /// `NFS4ERR_RESOURCE` at the configured client cap.
    pub fn exchange_id(
        &self,
        owner: &[u8],
        verifier: u64,
    ) -> Result<ExchangeIdResult, Nfs4Status> {
        let settings = self.settings().current();
        let lease = settings.lease_period();
        // bind lookups before branching so no shard guard outlives them
        let existing = self.by_owner.get(owner).map(|e| *e.value());
        if let Some(existing) = existing {
            let client = self.clients.get(&existing).map(|c| c.clone());
            if let Some(client) = client {
                if client.verifier == verifier {
                    client.renew(lease);
                    return Ok(ExchangeIdResult {
                        client_id: existing,
                        confirmed: client.confirmed.load(Ordering::Acquire),
                        created: false,
                    });
                }
                info!(client = existing, "client presented new verifier, destroying old state");
                let _ = self.destroy_client(existing);
            }
        }
        if self.clients.len() >= settings.max_clients {
            return Err(Nfs4Status::NFS4ERR_RESOURCE);
        }
        let id = self.alloc_client_id();
        let client = Arc::new(Client::new(id, owner, verifier, lease));
        self.clients.insert(id, client);
        self.by_owner.insert(owner.to_vec(), id);
        debug!(client = id, "new unconfirmed client");
        Ok(ExchangeIdResult { client_id: id, confirmed: false, created: true })
    }

    /// CREATE_SESSION: confirms the client and builds a slot table. The
    /// sequence must be the client's next-expected; the previous value
    /// replays the last created session.
    pub fn create_session(&self, client_id: u64, sequence: u32) -> Result<[u8; 16], Nfs4Status> {
        let client = self
            .clients
            .get(&client_id)
            .map(|c| c.clone())
            .ok_or(Nfs4Status::NFS4ERR_STALE_CLIENTID)?;
        let expected = client.create_session_seq.load(Ordering::Acquire);
        if sequence == expected.wrapping_sub(1) {
            if let Ok(last) = client.last_session.lock() {
                if let Some(id) = *last {
                    return Ok(id);
                }
            }
            return Err(Nfs4Status::NFS4ERR_SEQ_MISORDERED);
        }
        if sequence != expected {
            return Err(Nfs4Status::NFS4ERR_SEQ_MISORDERED);
        }
        client.create_session_seq.store(expected.wrapping_add(1), Ordering::Release);
        client.confirmed.store(true, Ordering::Release);
        let settings = self.settings().current();
        client.renew(settings.lease_period());

        let id: [u8; 16] = rand::random();
        let session = Arc::new(Session::new(id, client_id, settings.session_slots));
        self.sessions.insert(id, session);
        if let Ok(mut last) = client.last_session.lock() {
            *last = Some(id);
        }
        debug!(client = client_id, "session created");
        Ok(id)
    }

    pub fn session(&self, id: &[u8; 16]) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn client(&self, id: u64) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|c| c.clone())
    }

    /// DESTROY_SESSION.
    pub fn destroy_session(&self, id: &[u8; 16]) -> Result<(), Nfs4Status> {
        self.sessions
            .remove(id)
            .map(|_| ())
            .ok_or(Nfs4Status::NFS4ERR_BADSESSION)
    }

    /// Renews a client's lease (SEQUENCE, RENEW).
    pub fn renew_client(&self, client_id: u64) -> Result<(), Nfs4Status> {
        let client = self
            .clients
            .get(&client_id)
            .map(|c| c.clone())
            .ok_or(Nfs4Status::NFS4ERR_STALE_CLIENTID)?;
        client.renew(self.settings().current().lease_period());
        Ok(())
    }

    /// SETCLIENTID_CONFIRM for v4.0 clients.
    pub fn confirm_client(&self, client_id: u64) -> Result<(), Nfs4Status> {
        let client = self
            .clients
            .get(&client_id)
            .map(|c| c.clone())
            .ok_or(Nfs4Status::NFS4ERR_STALE_CLIENTID)?;
        client.confirmed.store(true, Ordering::Release);
        client.renew(self.settings().current().lease_period());
        Ok(())
    }

    /// DESTROY_CLIENTID / reboot invalidation: cascades open, lock,
    /// delegation and session cleanup.
    pub fn destroy_client(&self, client_id: u64) -> Result<(), Nfs4Status> {
        let (_, client) = self
            .clients
            .remove(&client_id)
            .ok_or(Nfs4Status::NFS4ERR_STALE_CLIENTID)?;
        self.by_owner.remove_if(&client.owner, |_, id| *id == client_id);
        self.cascade_release(client_id);
        info!(client = client_id, "client destroyed");
        Ok(())
    }

    /// One reaper pass: destroys clients whose lease lapsed and whose
    /// sessions run nothing. Returns the destroyed ids.
    pub fn reap_expired(&self) -> Vec<u64> {
        let candidates: Vec<u64> = self
            .clients
            .iter()
            .filter(|entry| entry.value().lease_expired())
            .map(|entry| *entry.key())
            .collect();
        let mut reaped = Vec::new();
        for id in candidates {
            let busy = self
                .sessions
                .iter()
                .any(|s| s.client == id && s.any_in_progress());
            if busy {
                continue;
            }
            if self.destroy_client(id).is_ok() {
                reaped.push(id);
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped expired clients");
        }
        reaped
    }
}

/// Spawns the periodic lease reaper.
pub fn spawn_reaper(state: Arc<V4State>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            state.reap_expired();
        }
    })
}
