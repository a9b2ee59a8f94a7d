//! MOUNT v3 protocol router (RFC 1813 Appendix I).
//!
//! MNT resolves an export path to the share's root filehandle, EXPORT
//! enumerates the active shares, and UMNT/UMNTALL maintain the mount
//! table. A mount signal channel reports mount/unmount transitions to
//! whoever wants them (tests, the control plane).

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatch::ServiceContext;
use crate::error::EngineError;
use crate::ident::Credentials;
use crate::share::SecurityFlavor;
use crate::store::MetaStore;

/// RPC auth flavor numbers advertised in the MNT reply.
pub const AUTH_SYS: u32 = 1;
pub const RPCSEC_GSS: u32 = 6;

/// MOUNT status codes (mountstat3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MountStatus {
    Ok,
    NoEnt,
    Access,
    Inval,
    ServerFault,
}

/// Decoded MOUNT procedures.
#[derive(Debug, Clone)]
pub enum MountRequest {
    Null,
    Mnt { path: String },
    Umnt { path: String },
    UmntAll,
    Export,
    Dump,
}

/// Decoded MOUNT replies.
#[derive(Debug, Clone, PartialEq)]
pub enum MountReply {
    Null,
    Mnt { status: MountStatus, fh: Option<Vec<u8>>, auth_flavors: Vec<u32> },
    Umnt,
    UmntAll,
    Export { exports: Vec<String> },
    Dump { mounts: Vec<(String, String)> },
}

struct MountRecord {
    client: String,
    path: String,
}

/// The MOUNT router.
pub struct MountDispatcher {
    svc: ServiceContext,
    mounts: Mutex<Vec<MountRecord>>,
    signal: Option<mpsc::Sender<bool>>,
}

impl MountDispatcher {
    pub fn new(svc: ServiceContext) -> MountDispatcher {
        MountDispatcher { svc, mounts: Mutex::new(Vec::new()), signal: None }
    }

    /// Registers a channel receiving `true` on mount and `false` on
    /// unmount.
    pub fn with_mount_signal(mut self, signal: mpsc::Sender<bool>) -> MountDispatcher {
        self.signal = Some(signal);
        self
    }

    fn mounts(&self) -> std::sync::MutexGuard<'_, Vec<MountRecord>> {
        match self.mounts.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn notify(&self, mounted: bool) {
        if let Some(signal) = &self.signal {
            let _ = signal.try_send(mounted);
        }
    }

    /// Dispatches one decoded MOUNT procedure.
    pub async fn handle(
        &self,
        client_addr: &str,
        creds: &Credentials,
        request: MountRequest,
    ) -> MountReply {
        match request {
            MountRequest::Null => MountReply::Null,
            MountRequest::Mnt { path } => self.mnt(client_addr, creds, &path).await,
            MountRequest::Umnt { path } => {
                self.mounts().retain(|m| !(m.client == client_addr && m.path == path));
                debug!(client = client_addr, path = %path, "unmounted");
                self.notify(false);
                MountReply::Umnt
            }
            MountRequest::UmntAll => {
                self.mounts().retain(|m| m.client != client_addr);
                self.notify(false);
                MountReply::UmntAll
            }
            MountRequest::Export => MountReply::Export {
                exports: self
                    .svc
                    .registry
                    .shares()
                    .iter()
                    .map(|s| s.name.clone())
                    .collect(),
            },
            MountRequest::Dump => MountReply::Dump {
                mounts: self
                    .mounts()
                    .iter()
                    .map(|m| (m.client.clone(), m.path.clone()))
                    .collect(),
            },
        }
    }

    async fn mnt(&self, client_addr: &str, creds: &Credentials, path: &str) -> MountReply {
        let ctx = match self.svc.op_context_for_share(creds, path) {
            Ok(ctx) => ctx,
            Err(EngineError::NoEntry) => {
                return MountReply::Mnt {
                    status: MountStatus::NoEnt,
                    fh: None,
                    auth_flavors: Vec::new(),
                }
            }
            Err(_) => {
                return MountReply::Mnt {
                    status: MountStatus::Access,
                    fh: None,
                    auth_flavors: Vec::new(),
                }
            }
        };
        let root = match ctx.share.meta.root().await {
            Ok(root) => root,
            Err(_) => {
                return MountReply::Mnt {
                    status: MountStatus::ServerFault,
                    fh: None,
                    auth_flavors: Vec::new(),
                }
            }
        };
        let fh = self.svc.handles.encode(ctx.share.tag, root);
        let auth_flavors = ctx
            .share
            .config
            .security
            .iter()
            .map(|f| match f {
                SecurityFlavor::Sys => AUTH_SYS,
                SecurityFlavor::Krb5 | SecurityFlavor::Krb5i | SecurityFlavor::Krb5p => {
                    RPCSEC_GSS
                }
            })
            .collect();
        self.mounts().push(MountRecord {
            client: client_addr.to_string(),
            path: path.to_string(),
        });
        info!(client = client_addr, path, "mounted");
        self.notify(true);
        MountReply::Mnt { status: MountStatus::Ok, fh: Some(fh), auth_flavors }
    }

    /// Active mounts (test observability).
    pub fn mount_count(&self) -> usize {
        self.mounts().len()
    }
}
