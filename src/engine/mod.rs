//! The protocol-neutral file-system engine.
//!
//! Every protocol dispatcher speaks one vocabulary, the operations on
//! [`Engine`], so NFSv3, NFSv4 and SMB2 clients observe the same
//! semantics over the same shares. An operation receives an [`OpContext`]
//! carrying the resolved principal, an immutable share snapshot, a
//! deadline and a trace id; everything else (open state, lock state,
//! readdir verifiers) lives in the engine's own tables keyed by
//! `(share tag, inode id)`.
//!
//! Operations are re-entrant and safe under arbitrary concurrency on
//! disjoint inodes. Store calls are the suspension points; each is bounded
//! by the context deadline, and transient failures retry with a short
//! exponential backoff before surfacing as `Io`.

mod io;
mod locks;
mod namespace;
mod opens;

pub use io::Stability;
pub use locks::{LockHolder, LockKind, LockOwner, LockRange, LockTable};
pub use namespace::{CreateDisposition, ReadDirEntry, ReadDirPage, RenameFlags};
pub use opens::{AccessBits, CloseOutcome, OpenOwner, OpenState, OpenTable};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::acl::{self, Acl, AceMask};
use crate::error::{EngineError, EngineResult};
use crate::ident::{Permission, Principal};
use crate::inode::{Attrs, InodeId, InodeKind, SetAttrPatch};
use crate::settings::SettingsHandle;
use crate::share::{BlockedOp, ShareSnapshot};
use crate::store::{MetaStore, PayloadStore, StoreResult};

/// Default operation deadline, matching the protocol read timeout.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

/// How many past readdir verifiers stay acceptable per directory.
const VERIFIER_WINDOW: usize = 8;

static NEXT_TRACE: AtomicU64 = AtomicU64::new(1);

/// A file across shares: the registry tag plus the inode id. Inode ids
/// are only monotonic per share, so every engine table keys on this pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub share: u64,
    pub inode: InodeId,
}

/// Per-operation context.
#[derive(Clone)]
pub struct OpContext {
    pub principal: Principal,
    pub permission: Permission,
    pub share: ShareSnapshot,
    pub deadline: Instant,
    /// Protocol client this operation acts for, when one exists (NFSv4
    /// client id, SMB2 session). Anonymous for NFSv3.
    pub client: Option<u64>,
    pub trace: u64,
}

impl OpContext {
    pub fn new(principal: Principal, permission: Permission, share: ShareSnapshot) -> OpContext {
        OpContext {
            principal,
            permission,
            share,
            deadline: Instant::now() + DEFAULT_DEADLINE,
            client: None,
            trace: NEXT_TRACE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Context for internal maintenance work (cache flushes, reaping).
    pub fn internal(share: ShareSnapshot) -> OpContext {
        OpContext::new(Principal::superuser(), Permission::Admin, share)
    }

    pub fn with_client(mut self, client: u64) -> OpContext {
        self.client = Some(client);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> OpContext {
        self.deadline = deadline;
        self
    }

    pub fn file(&self, inode: InodeId) -> FileRef {
        FileRef { share: self.share.tag, inode }
    }
}

/// Access classes checked against mode bits and ACLs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    fn mode_bit(&self) -> u32 {
        match self {
            Access::Read => 0o4,
            Access::Write => 0o2,
            Access::Execute => 0o1,
        }
    }

    fn ace_mask(&self) -> AceMask {
        match self {
            Access::Read => AceMask::READ_DATA,
            Access::Write => AceMask::WRITE_DATA,
            Access::Execute => AceMask::EXECUTE,
        }
    }
}

/// The engine.
pub struct Engine {
    settings: SettingsHandle,
    opens: OpenTable,
    locks: LockTable,
    readdir_verifiers: Mutex<HashMap<FileRef, VecDeque<u64>>>,
    write_verifier: [u8; 8],
}

impl Engine {
    pub fn new(settings: SettingsHandle) -> Engine {
        Engine {
            settings,
            opens: OpenTable::default(),
            locks: LockTable::default(),
            readdir_verifiers: Mutex::new(HashMap::new()),
            write_verifier: rand::random(),
        }
    }

    /// The per-boot stable-write verifier. It changes on restart, which
    /// is how clients learn that unstable writes may have been lost.
    pub fn write_verifier(&self) -> [u8; 8] {
        self.write_verifier
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub(crate) fn opens(&self) -> &OpenTable {
        &self.opens
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.locks
    }

    // ---- shared guards ----------------------------------------------------

    /// Rejects operations named in the share's or the global blocked list.
    pub(crate) fn require_unblocked(
        &self,
        ctx: &OpContext,
        op: BlockedOp,
    ) -> EngineResult<()> {
        if ctx.share.is_blocked(op) || self.settings.current().blocked_operations.contains(&op)
        {
            debug!(trace = ctx.trace, ?op, share = ctx.share.name(), "operation blocked");
            return Err(EngineError::Blocked);
        }
        Ok(())
    }

    pub(crate) fn require_read(&self, ctx: &OpContext) -> EngineResult<()> {
        if !ctx.permission.allows_read() {
            return Err(EngineError::NotPerm);
        }
        Ok(())
    }

    pub(crate) fn require_write(&self, ctx: &OpContext) -> EngineResult<()> {
        if ctx.share.config.read_only {
            return Err(EngineError::ReadOnly);
        }
        if !ctx.permission.allows_write() {
            return Err(EngineError::NotPerm);
        }
        Ok(())
    }

    /// Mode/ACL evaluation for one inode. Admin share permission and the
    /// superuser bypass it.
    pub(crate) async fn access_check(
        &self,
        ctx: &OpContext,
        id: InodeId,
        attrs: &Attrs,
        access: Access,
    ) -> EngineResult<()> {
        if ctx.permission == Permission::Admin || ctx.principal.is_superuser() {
            return Ok(());
        }
        let acl = self.store(ctx, ctx.share.meta.get_acl(id)).await?;
        let allowed = match acl {
            Some(acl) => acl::evaluate(
                &acl,
                &ctx.principal,
                attrs.uid,
                attrs.gid,
                access.ace_mask(),
            ),
            None => {
                let triple = if ctx.principal.uid == attrs.uid {
                    (attrs.mode >> 6) & 0o7
                } else if ctx.principal.in_group(attrs.gid) {
                    (attrs.mode >> 3) & 0o7
                } else {
                    attrs.mode & 0o7
                };
                triple & access.mode_bit() != 0
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(EngineError::Perm)
        }
    }

    /// Bounds a store call by the operation deadline.
    pub(crate) async fn store<T>(
        &self,
        ctx: &OpContext,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> EngineResult<T> {
        match tokio::time::timeout_at(ctx.deadline, fut).await {
            Ok(res) => res.map_err(EngineError::from_store),
            Err(_) => Err(EngineError::Timeout),
        }
    }

    /// Bounded retry for idempotent store calls: up to three attempts
    /// with short backoff, then the failure surfaces.
    pub(crate) async fn store_retry<T, F, Fut>(
        &self,
        ctx: &OpContext,
        mut call: F,
    ) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay = Duration::from_millis(50);
        let mut last = EngineError::Io;
        for attempt in 0..3 {
            match self.store(ctx, call()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < 2 => {
                    warn!(trace = ctx.trace, ?err, attempt, "transient store failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    // ---- attributes, xattrs, acls -----------------------------------------

    pub async fn get_attr(&self, ctx: &OpContext, id: InodeId) -> EngineResult<Attrs> {
        self.require_unblocked(ctx, BlockedOp::Getattr)?;
        self.require_read(ctx)?;
        self.store(ctx, ctx.share.meta.get_attr(id)).await
    }

    /// Applies an attribute patch. Owner changes require admin; mode and
    /// time changes require ownership (or admin). Size changes run the
    /// truncate pipeline so file content and metadata stay convergent.
    pub async fn set_attr(
        &self,
        ctx: &OpContext,
        id: InodeId,
        patch: &SetAttrPatch,
    ) -> EngineResult<Attrs> {
        self.require_unblocked(ctx, BlockedOp::Setattr)?;
        self.require_write(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        let is_owner = ctx.principal.uid == attrs.uid
            || ctx.permission == Permission::Admin
            || ctx.principal.is_superuser();
        if (patch.mode.is_some() || patch.uid.is_some() || patch.gid.is_some()) && !is_owner {
            return Err(EngineError::NotPerm);
        }
        if patch.size.is_some() && attrs.kind != InodeKind::Regular {
            return Err(EngineError::IsDir);
        }
        if !is_owner {
            self.access_check(ctx, id, &attrs, Access::Write).await?;
        }

        if let Some(size) = patch.size {
            if size != attrs.size {
                self.set_size(ctx, id, size).await?;
            }
        }

        let mut rest = patch.clone();
        rest.size = None;
        let updated = if rest.is_empty() {
            self.store(ctx, ctx.share.meta.get_attr(id)).await?
        } else {
            self.store(ctx, ctx.share.meta.set_attr(id, &rest)).await?
        };

        // chmod projects onto the special ACEs without touching named ones
        if let Some(mode) = patch.mode {
            if let Some(mut acl) = self.store(ctx, ctx.share.meta.get_acl(id)).await? {
                acl::project_mode(&mut acl, mode);
                self.store(ctx, ctx.share.meta.set_acl(id, &acl)).await?;
            }
        }
        Ok(updated)
    }

    pub async fn get_xattr(
        &self,
        ctx: &OpContext,
        id: InodeId,
        name: &str,
    ) -> EngineResult<Vec<u8>> {
        self.require_unblocked(ctx, BlockedOp::Xattr)?;
        self.require_read(ctx)?;
        self.store(ctx, ctx.share.meta.get_xattr(id, name)).await
    }

    pub async fn set_xattr(
        &self,
        ctx: &OpContext,
        id: InodeId,
        name: &str,
        value: &[u8],
    ) -> EngineResult<()> {
        self.require_unblocked(ctx, BlockedOp::Xattr)?;
        self.require_write(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        self.access_check(ctx, id, &attrs, Access::Write).await?;
        self.store(ctx, ctx.share.meta.set_xattr(id, name, value)).await
    }

    pub async fn list_xattr(&self, ctx: &OpContext, id: InodeId) -> EngineResult<Vec<String>> {
        self.require_unblocked(ctx, BlockedOp::Xattr)?;
        self.require_read(ctx)?;
        self.store(ctx, ctx.share.meta.list_xattr(id)).await
    }

    pub async fn remove_xattr(
        &self,
        ctx: &OpContext,
        id: InodeId,
        name: &str,
    ) -> EngineResult<()> {
        self.require_unblocked(ctx, BlockedOp::Xattr)?;
        self.require_write(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        self.access_check(ctx, id, &attrs, Access::Write).await?;
        self.store(ctx, ctx.share.meta.remove_xattr(id, name)).await
    }

    pub async fn get_acl(&self, ctx: &OpContext, id: InodeId) -> EngineResult<Option<Acl>> {
        self.require_unblocked(ctx, BlockedOp::Acl)?;
        self.require_read(ctx)?;
        self.store(ctx, ctx.share.meta.get_acl(id)).await
    }

    pub async fn set_acl(&self, ctx: &OpContext, id: InodeId, acl: &Acl) -> EngineResult<()> {
        self.require_unblocked(ctx, BlockedOp::Acl)?;
        self.require_write(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        let is_owner = ctx.principal.uid == attrs.uid
            || ctx.permission == Permission::Admin
            || ctx.principal.is_superuser();
        if !is_owner {
            return Err(EngineError::NotPerm);
        }
        self.store(ctx, ctx.share.meta.set_acl(id, acl)).await
    }

    // ---- opens ------------------------------------------------------------

    /// Opens a regular file with share-reservation semantics.
    pub async fn open(
        &self,
        ctx: &OpContext,
        id: InodeId,
        owner: OpenOwner,
        access: AccessBits,
        deny: AccessBits,
    ) -> EngineResult<OpenState> {
        self.require_unblocked(ctx, BlockedOp::Open)?;
        self.require_read(ctx)?;
        if access.intersects(AccessBits::WRITE) {
            self.require_write(ctx)?;
        }
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        if attrs.kind == InodeKind::Directory {
            return Err(EngineError::IsDir);
        }
        if access.intersects(AccessBits::READ) {
            self.access_check(ctx, id, &attrs, Access::Read).await?;
        }
        if access.intersects(AccessBits::WRITE) {
            self.access_check(ctx, id, &attrs, Access::Write).await?;
        }
        self.opens.open(ctx.file(id), owner, access, deny)
    }

    /// Closes an open: commits staged writes, drops the owner's locks and
    /// releases any content parked behind the last open.
    pub async fn close(&self, ctx: &OpContext, open_id: u64) -> EngineResult<()> {
        let outcome = self.opens.close(open_id)?;
        let file = outcome.state.file;

        // commit-on-close keeps cross-protocol readers coherent
        if let Err(err) = self.commit(ctx, file.inode).await {
            warn!(trace = ctx.trace, ?err, inode = %file.inode, "commit on close failed");
        }

        let lock_owner = LockOwner {
            client: outcome.state.owner.client,
            owner: outcome.state.owner.owner.clone(),
        };
        self.locks.release_owner(&lock_owner);

        if let Some(content) = outcome.release_content {
            ctx.share.write_cache.discard(file.inode);
            self.delete_payload_best_effort(ctx, content);
        }
        Ok(())
    }

    /// State for a given engine open id.
    pub fn open_state(&self, open_id: u64) -> Option<OpenState> {
        self.opens.get(open_id)
    }

    /// All opens on an inode (delegation conflict checks).
    pub fn opens_on(&self, ctx: &OpContext, id: InodeId) -> Vec<OpenState> {
        self.opens.opens_on(ctx.file(id))
    }

    /// Drops all open/lock state held by a protocol client (lease expiry,
    /// session teardown). Parked content keys are released best-effort.
    pub fn release_client_state(&self, ctx: &OpContext, client: u64) {
        for outcome in self.opens.release_client(client) {
            if let Some(content) = outcome.release_content {
                ctx.share.write_cache.discard(outcome.state.file.inode);
                self.delete_payload_best_effort(ctx, content);
            }
        }
        self.locks.release_client(client);
    }

    // ---- byte-range locks -------------------------------------------------

    pub async fn lock(
        &self,
        ctx: &OpContext,
        id: InodeId,
        owner: &LockOwner,
        range: LockRange,
        kind: LockKind,
        blocking: bool,
    ) -> EngineResult<()> {
        self.require_unblocked(ctx, BlockedOp::Lock)?;
        self.require_read(ctx)?;
        self.locks
            .lock(ctx.file(id), owner, range, kind, blocking, ctx.deadline)
            .await
    }

    pub fn unlock(&self, ctx: &OpContext, id: InodeId, owner: &LockOwner, range: LockRange) {
        self.locks.unlock(ctx.file(id), owner, range);
    }

    pub fn lock_test(
        &self,
        ctx: &OpContext,
        id: InodeId,
        owner: &LockOwner,
        range: LockRange,
        kind: LockKind,
    ) -> Option<LockHolder> {
        self.locks.lock_test(ctx.file(id), owner, range, kind)
    }

    // ---- readdir verifier window ------------------------------------------

    /// Records a verifier handed out for a directory scan.
    pub(crate) fn remember_verifier(&self, file: FileRef, verifier: u64) {
        let mut windows = match self.readdir_verifiers.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let window = windows.entry(file).or_default();
        if !window.contains(&verifier) {
            window.push_back(verifier);
            while window.len() > VERIFIER_WINDOW {
                window.pop_front();
            }
        }
    }

    /// Whether a presented verifier is still within the accepted window.
    pub(crate) fn verifier_acceptable(&self, file: FileRef, verifier: u64, current: u64) -> bool {
        if verifier == current {
            return true;
        }
        let windows = match self.readdir_verifiers.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        windows.get(&file).map(|w| w.contains(&verifier)).unwrap_or(false)
    }

    // ---- maintenance ------------------------------------------------------

    /// Best-effort payload deletion after the zero-grace window; reads
    /// racing a delete are the payload store's problem to tolerate.
    pub(crate) fn delete_payload_best_effort(&self, ctx: &OpContext, content: crate::store::ContentId) {
        if let Some(rc) = &ctx.share.read_cache {
            rc.invalidate(&content);
        }
        let payload = ctx.share.payload.clone();
        let trace = ctx.trace;
        tokio::spawn(async move {
            if let Err(err) = payload.delete(&content).await {
                debug!(trace, %content, ?err, "deferred payload delete failed");
            }
        });
    }

    /// Flushes every dirty inode of a share (shutdown path).
    pub async fn flush_share(&self, share: ShareSnapshot) {
        let ctx = OpContext::internal(share.clone());
        for inode in share.write_cache.dirty_inodes() {
            if let Err(err) = self.commit(&ctx, inode).await {
                warn!(inode = %inode, ?err, "flush commit failed");
            }
        }
    }
}
