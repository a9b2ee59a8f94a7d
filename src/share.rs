//! Shares: named export roots binding a metadata store, a payload store
//! and their caches.
//!
//! Shares are created by the control plane and mutated only through the
//! registry; the engine sees an immutable [`ShareSnapshot`] per request,
//! so a live configuration change never tears an in-flight operation.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::cache::{ReadCache, WriteCache};
use crate::ident::Permission;
use crate::store::{MetaStore, PayloadStore};

/// RPC security flavours a share accepts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecurityFlavor {
    /// AUTH_SYS / AUTH_UNIX.
    Sys,
    Krb5,
    Krb5i,
    Krb5p,
}

/// Engine operations that can be blocked per share. The set is fixed;
/// settings and share configuration name members of this enum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockedOp {
    Lookup,
    Getattr,
    Setattr,
    Create,
    Open,
    Read,
    Write,
    Commit,
    Remove,
    Rename,
    Link,
    Symlink,
    Mknod,
    Readdir,
    Readlink,
    Xattr,
    Acl,
    Lock,
}

/// Static configuration of one share.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// Absolute export path, e.g. `/export`.
    pub name: String,
    pub default_permission: Permission,
    pub read_only: bool,
    pub security: Vec<SecurityFlavor>,
    pub blocked_ops: HashSet<BlockedOp>,
}

impl ShareConfig {
    pub fn new(name: impl Into<String>) -> ShareConfig {
        ShareConfig {
            name: name.into(),
            default_permission: Permission::ReadWrite,
            read_only: false,
            security: vec![SecurityFlavor::Sys],
            blocked_ops: HashSet::new(),
        }
    }

    pub fn read_only(mut self) -> ShareConfig {
        self.read_only = true;
        self
    }

    pub fn with_default_permission(mut self, permission: Permission) -> ShareConfig {
        self.default_permission = permission;
        self
    }

    pub fn with_blocked_ops(mut self, ops: impl IntoIterator<Item = BlockedOp>) -> ShareConfig {
        self.blocked_ops = ops.into_iter().collect();
        self
    }
}

/// Immutable per-request view of a share and its bound data planes.
#[derive(Clone)]
pub struct ShareSnapshot {
    /// Registry-assigned tag used in filehandles and state-table keys.
    pub tag: u64,
    pub config: Arc<ShareConfig>,
    pub meta: Arc<dyn MetaStore>,
    pub payload: Arc<dyn PayloadStore>,
    pub read_cache: Option<Arc<ReadCache>>,
    pub write_cache: Arc<WriteCache>,
}

impl ShareSnapshot {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether this snapshot's blocked set (share config plus the global
    /// settings list merged in by the registry) names the operation.
    pub fn is_blocked(&self, op: BlockedOp) -> bool {
        self.config.blocked_ops.contains(&op)
    }
}

impl std::fmt::Debug for ShareSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareSnapshot")
            .field("tag", &self.tag)
            .field("name", &self.config.name)
            .field("read_only", &self.config.read_only)
            .finish()
    }
}
