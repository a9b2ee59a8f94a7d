//! Namespace operations: lookup, create, link, remove, rename, readdir.
//!
//! All paths arrive as single components; the dispatchers walk multi
//! component paths themselves. Hard links and renames never cross shares:
//! the dispatchers refuse mixed-share handles before the engine ever sees
//! them, and within one context only one share exists.

use tracing::debug;

use crate::engine::{Access, Engine, OpContext};
use crate::error::{EngineError, EngineResult};
use crate::inode::{Attrs, DeviceId, InodeId, InodeKind, SetAttrPatch, SetTime};
use crate::share::BlockedOp;
use crate::store::{CreateExtras, MetaStore, OverwritePolicy};

/// Maximum length of one name component, in bytes.
const MAX_NAME_LEN: usize = 255;

/// How a create treats an existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateDisposition {
    /// Existing entry is reused; requested attributes are re-applied.
    Unchecked,
    /// Existing entry fails with `Exists`.
    Guarded,
    /// Idempotent create keyed by a client-chosen token: a retry with the
    /// same token returns the same inode, a different token fails.
    Exclusive([u8; 8]),
}

/// Rename behaviour flags.
#[derive(Debug, Copy, Clone, Default)]
pub struct RenameFlags {
    pub no_overwrite: bool,
}

/// One readdir entry with attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadDirEntry {
    pub name: String,
    pub id: InodeId,
    pub cookie: u64,
    pub attrs: Attrs,
}

/// A readdir page plus the verifier for resuming.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadDirPage {
    pub entries: Vec<ReadDirEntry>,
    pub verifier: u64,
    pub eof: bool,
}

fn validate_name(name: &str) -> EngineResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(EngineError::BadName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::BadName);
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(EngineError::BadName);
    }
    Ok(())
}

impl Engine {
    async fn require_dir(&self, ctx: &OpContext, id: InodeId) -> EngineResult<Attrs> {
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        if attrs.kind != InodeKind::Directory {
            return Err(EngineError::NotDir);
        }
        Ok(attrs)
    }

    /// Resolves a name in a directory.
    pub async fn lookup(
        &self,
        ctx: &OpContext,
        parent: InodeId,
        name: &str,
    ) -> EngineResult<(InodeId, Attrs)> {
        self.require_unblocked(ctx, BlockedOp::Lookup)?;
        self.require_read(ctx)?;
        validate_name(name)?;
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Execute).await?;
        let id = self.store(ctx, ctx.share.meta.lookup(parent, name)).await?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        Ok((id, attrs))
    }

    /// Creates a regular file.
    pub async fn create(
        &self,
        ctx: &OpContext,
        parent: InodeId,
        name: &str,
        patch: &SetAttrPatch,
        disposition: CreateDisposition,
    ) -> EngineResult<(InodeId, Attrs)> {
        self.require_unblocked(ctx, BlockedOp::Create)?;
        self.require_write(ctx)?;
        validate_name(name)?;
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Write).await?;

        let attrs = self.initial_attrs(ctx, InodeKind::Regular, patch, 0o644);
        let extras = CreateExtras {
            exclusive_token: match &disposition {
                CreateDisposition::Exclusive(token) => Some(*token),
                _ => None,
            },
            ..Default::default()
        };
        let created = self
            .store(ctx, ctx.share.meta.create_entry(parent, name, InodeKind::Regular, attrs, extras))
            .await;
        let id = match created {
            Ok(id) => id,
            Err(EngineError::Exists) => match disposition {
                CreateDisposition::Unchecked => {
                    let id = self.store(ctx, ctx.share.meta.lookup(parent, name)).await?;
                    let existing = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
                    if existing.kind != InodeKind::Regular {
                        return Err(EngineError::IsDir);
                    }
                    id
                }
                _ => return Err(EngineError::Exists),
            },
            Err(err) => return Err(err),
        };
        self.apply_create_patch(ctx, id, patch).await?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        debug!(trace = ctx.trace, inode = %id, name, "created file");
        Ok((id, attrs))
    }

    /// Creates a directory.
    pub async fn mkdir(
        &self,
        ctx: &OpContext,
        parent: InodeId,
        name: &str,
        patch: &SetAttrPatch,
    ) -> EngineResult<(InodeId, Attrs)> {
        self.require_unblocked(ctx, BlockedOp::Create)?;
        self.require_write(ctx)?;
        validate_name(name)?;
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Write).await?;

        let attrs = self.initial_attrs(ctx, InodeKind::Directory, patch, 0o755);
        let id = self
            .store(
                ctx,
                ctx.share.meta.create_entry(
                    parent,
                    name,
                    InodeKind::Directory,
                    attrs,
                    CreateExtras::default(),
                ),
            )
            .await?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        Ok((id, attrs))
    }

    /// Creates a symbolic link.
    pub async fn symlink(
        &self,
        ctx: &OpContext,
        parent: InodeId,
        name: &str,
        target: &str,
        patch: &SetAttrPatch,
    ) -> EngineResult<(InodeId, Attrs)> {
        self.require_unblocked(ctx, BlockedOp::Symlink)?;
        self.require_write(ctx)?;
        validate_name(name)?;
        if target.is_empty() {
            return Err(EngineError::Invalid);
        }
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Write).await?;

        let attrs = self.initial_attrs(ctx, InodeKind::Symlink, patch, 0o777);
        let extras =
            CreateExtras { symlink_target: Some(target.to_string()), ..Default::default() };
        let id = self
            .store(ctx, ctx.share.meta.create_entry(parent, name, InodeKind::Symlink, attrs, extras))
            .await?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        Ok((id, attrs))
    }

    /// Reads a symbolic link's target.
    pub async fn readlink(&self, ctx: &OpContext, id: InodeId) -> EngineResult<String> {
        self.require_unblocked(ctx, BlockedOp::Readlink)?;
        self.require_read(ctx)?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        if attrs.kind != InodeKind::Symlink {
            return Err(EngineError::NotSymlink);
        }
        self.store(ctx, ctx.share.meta.read_symlink(id)).await
    }

    /// Creates a special node (fifo, socket, device).
    pub async fn mknod(
        &self,
        ctx: &OpContext,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        rdev: Option<DeviceId>,
        patch: &SetAttrPatch,
    ) -> EngineResult<(InodeId, Attrs)> {
        self.require_unblocked(ctx, BlockedOp::Mknod)?;
        self.require_write(ctx)?;
        validate_name(name)?;
        match kind {
            InodeKind::Fifo | InodeKind::Socket => {}
            InodeKind::CharDevice | InodeKind::BlockDevice => {
                if rdev.is_none() {
                    return Err(EngineError::Invalid);
                }
            }
            _ => return Err(EngineError::Invalid),
        }
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Write).await?;

        let attrs = self.initial_attrs(ctx, kind, patch, 0o644);
        let extras = CreateExtras { rdev, ..Default::default() };
        let id = self
            .store(ctx, ctx.share.meta.create_entry(parent, name, kind, attrs, extras))
            .await?;
        let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
        Ok((id, attrs))
    }

    /// Creates a hard link to an existing file. Links never cross shares;
    /// both inodes live in the context's share by construction.
    pub async fn link(
        &self,
        ctx: &OpContext,
        existing: InodeId,
        parent: InodeId,
        name: &str,
    ) -> EngineResult<Attrs> {
        self.require_unblocked(ctx, BlockedOp::Link)?;
        self.require_write(ctx)?;
        validate_name(name)?;
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Write).await?;
        self.store(ctx, ctx.share.meta.link(parent, name, existing)).await?;
        self.store(ctx, ctx.share.meta.get_attr(existing)).await
    }

    /// Removes a name; `is_rmdir` requires an empty directory target.
    pub async fn remove(
        &self,
        ctx: &OpContext,
        parent: InodeId,
        name: &str,
        is_rmdir: bool,
    ) -> EngineResult<()> {
        self.require_unblocked(ctx, BlockedOp::Remove)?;
        self.require_write(ctx)?;
        validate_name(name)?;
        let parent_attrs = self.require_dir(ctx, parent).await?;
        self.access_check(ctx, parent, &parent_attrs, Access::Write).await?;

        let outcome = self.store(ctx, ctx.share.meta.unlink(parent, name, is_rmdir)).await?;
        if outcome.nlink_zero {
            self.reap_inode(ctx, outcome.removed, outcome.orphaned_content);
        }
        Ok(())
    }

    /// Atomically renames within the share.
    pub async fn rename(
        &self,
        ctx: &OpContext,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
        flags: RenameFlags,
    ) -> EngineResult<()> {
        self.require_unblocked(ctx, BlockedOp::Rename)?;
        self.require_write(ctx)?;
        validate_name(src_name)?;
        validate_name(dst_name)?;
        let src_attrs = self.require_dir(ctx, src_parent).await?;
        self.access_check(ctx, src_parent, &src_attrs, Access::Write).await?;
        if dst_parent != src_parent {
            let dst_attrs = self.require_dir(ctx, dst_parent).await?;
            self.access_check(ctx, dst_parent, &dst_attrs, Access::Write).await?;
        }

        // flush the moved file's staged bytes so backends that key payload
        // state off directory entries observe a settled image
        if let Ok(moved) = self.store(ctx, ctx.share.meta.lookup(src_parent, src_name)).await {
            if ctx.share.write_cache.peek(moved).is_some() {
                self.commit(ctx, moved).await?;
            }
        }

        let policy =
            if flags.no_overwrite { OverwritePolicy::Deny } else { OverwritePolicy::Allow };
        let outcome = self
            .store(ctx, ctx.share.meta.rename(src_parent, src_name, dst_parent, dst_name, policy))
            .await?;
        if let Some(replaced) = outcome.replaced {
            if replaced.nlink_zero {
                self.reap_inode(ctx, replaced.removed, replaced.orphaned_content);
            }
        }
        Ok(())
    }

    /// Reads a directory page, enforcing the cookie verifier window.
    pub async fn readdir(
        &self,
        ctx: &OpContext,
        id: InodeId,
        cookie: u64,
        verifier: Option<u64>,
        limit: usize,
    ) -> EngineResult<ReadDirPage> {
        self.require_unblocked(ctx, BlockedOp::Readdir)?;
        self.require_read(ctx)?;
        let dir_attrs = self.require_dir(ctx, id).await?;
        self.access_check(ctx, id, &dir_attrs, Access::Read).await?;

        let file = ctx.file(id);
        let current = self.store(ctx, ctx.share.meta.dir_change(id)).await?;
        if cookie != 0 {
            let presented = verifier.ok_or(EngineError::StaleCookie)?;
            if !self.verifier_acceptable(file, presented, current) {
                return Err(EngineError::StaleCookie);
            }
        }
        let page = self.store(ctx, ctx.share.meta.readdir(id, cookie, limit)).await?;
        self.remember_verifier(file, page.change);

        let mut entries = Vec::with_capacity(page.entries.len());
        for entry in page.entries {
            // entries unlinked mid-scan simply drop out of the page
            if let Ok(attrs) = self.store(ctx, ctx.share.meta.get_attr(entry.id)).await {
                entries.push(ReadDirEntry {
                    name: entry.name,
                    id: entry.id,
                    cookie: entry.cookie,
                    attrs,
                });
            }
        }
        Ok(ReadDirPage { entries, verifier: page.change, eof: page.eof })
    }

    fn initial_attrs(
        &self,
        ctx: &OpContext,
        kind: InodeKind,
        patch: &SetAttrPatch,
        default_mode: u32,
    ) -> Attrs {
        Attrs::new(
            kind,
            patch.mode.unwrap_or(default_mode),
            patch.uid.unwrap_or(ctx.principal.uid),
            patch.gid.unwrap_or(ctx.principal.gid),
        )
    }

    /// Applies the non-identity part of a create patch (size, times).
    async fn apply_create_patch(
        &self,
        ctx: &OpContext,
        id: InodeId,
        patch: &SetAttrPatch,
    ) -> EngineResult<()> {
        if let Some(size) = patch.size {
            let attrs = self.store(ctx, ctx.share.meta.get_attr(id)).await?;
            if attrs.size != size {
                self.set_size(ctx, id, size).await?;
            }
        }
        if patch.atime != SetTime::DontChange || patch.mtime != SetTime::DontChange {
            let times = SetAttrPatch {
                atime: patch.atime,
                mtime: patch.mtime,
                ..Default::default()
            };
            self.store(ctx, ctx.share.meta.set_attr(id, &times)).await?;
        }
        Ok(())
    }

    /// Handles an inode whose last link is gone: its payload is deleted
    /// once no open holds it, and its staged writes are dropped.
    fn reap_inode(
        &self,
        ctx: &OpContext,
        inode: InodeId,
        content: Option<crate::store::ContentId>,
    ) {
        let file = ctx.file(inode);
        if let Some(content) = content {
            match self.opens().defer_delete(file, content) {
                Some(content) => {
                    ctx.share.write_cache.discard(inode);
                    self.delete_payload_best_effort(ctx, content);
                }
                None => {
                    // an open still holds the file; the last close releases it
                }
            }
        } else if !self.opens().has_opens(file) {
            ctx.share.write_cache.discard(inode);
        }
    }
}
