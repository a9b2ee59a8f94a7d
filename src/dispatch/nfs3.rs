//! NFSv3 procedure router (RFC 1813).
//!
//! Consumes decoded v3 procedures and produces decoded replies carrying a
//! typed [`Nfs3Status`] plus weak-cache-consistency data where the
//! protocol wants it. NFSv3 is stateless, so the only protocol state held
//! here is the per-connection duplicate-request cache: a bounded LRU
//! keyed by `(xid, procedure)` replaying the last reply on retransmit;
//! the dispatcher itself never retries anything.

use std::collections::{HashMap, VecDeque};
use std::mem::Discriminant;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::dispatch::ServiceContext;
use crate::engine::{CreateDisposition, OpContext, RenameFlags, Stability};
use crate::error::{EngineError, EngineResult, Nfs3Status};
use crate::ident::Credentials;
use crate::inode::{AttrDigest, Attrs, DeviceId, FileTime, InodeId, InodeKind, SetAttrPatch};

/// ACCESS mask bits (RFC 1813 3.3.4).
pub const ACCESS3_READ: u32 = 0x0001;
pub const ACCESS3_LOOKUP: u32 = 0x0002;
pub const ACCESS3_MODIFY: u32 = 0x0004;
pub const ACCESS3_EXTEND: u32 = 0x0008;
pub const ACCESS3_DELETE: u32 = 0x0010;
pub const ACCESS3_EXECUTE: u32 = 0x0020;

/// How many replies the duplicate-request cache retains per connection.
const DUP_CACHE_CAPACITY: usize = 128;

/// Decoded NFSv3 procedure arguments.
#[derive(Debug, Clone)]
pub enum Nfs3Request {
    Null,
    GetAttr { fh: Vec<u8> },
    SetAttr { fh: Vec<u8>, patch: SetAttrPatch, guard_ctime: Option<FileTime> },
    Lookup { dir: Vec<u8>, name: String },
    Access { fh: Vec<u8>, mask: u32 },
    ReadLink { fh: Vec<u8> },
    Read { fh: Vec<u8>, offset: u64, count: u32 },
    Write { fh: Vec<u8>, offset: u64, data: Vec<u8>, stable: Stability },
    Create { dir: Vec<u8>, name: String, disposition: CreateDisposition, patch: SetAttrPatch },
    Mkdir { dir: Vec<u8>, name: String, patch: SetAttrPatch },
    Symlink { dir: Vec<u8>, name: String, target: String, patch: SetAttrPatch },
    Mknod {
        dir: Vec<u8>,
        name: String,
        kind: InodeKind,
        rdev: Option<DeviceId>,
        patch: SetAttrPatch,
    },
    Remove { dir: Vec<u8>, name: String },
    Rmdir { dir: Vec<u8>, name: String },
    Rename { from_dir: Vec<u8>, from_name: String, to_dir: Vec<u8>, to_name: String },
    Link { fh: Vec<u8>, dir: Vec<u8>, name: String },
    ReadDir { fh: Vec<u8>, cookie: u64, verifier: u64, count: u32 },
    ReadDirPlus { fh: Vec<u8>, cookie: u64, verifier: u64, count: u32 },
    FsStat { fh: Vec<u8> },
    FsInfo { fh: Vec<u8> },
    PathConf { fh: Vec<u8> },
    Commit { fh: Vec<u8>, offset: u64, count: u32 },
}

/// Weak cache consistency data (RFC 1813 3.1).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WccData {
    pub before: Option<AttrDigest>,
    pub after: Option<Attrs>,
}

/// One READDIRPLUS entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DirPlusEntry {
    pub name: String,
    pub fileid: u128,
    pub cookie: u64,
    pub fh: Vec<u8>,
    pub attrs: Attrs,
}

/// Decoded NFSv3 replies.
#[derive(Debug, Clone, PartialEq)]
pub enum Nfs3Reply {
    Null,
    GetAttr { status: Nfs3Status, attrs: Option<Attrs> },
    SetAttr { status: Nfs3Status, wcc: WccData },
    Lookup {
        status: Nfs3Status,
        fh: Option<Vec<u8>>,
        attrs: Option<Attrs>,
        dir_attrs: Option<Attrs>,
    },
    Access { status: Nfs3Status, granted: u32, attrs: Option<Attrs> },
    ReadLink { status: Nfs3Status, target: Option<String> },
    Read { status: Nfs3Status, data: Vec<u8>, eof: bool, attrs: Option<Attrs> },
    Write {
        status: Nfs3Status,
        count: u32,
        committed: bool,
        verifier: [u8; 8],
        wcc: WccData,
    },
    Create { status: Nfs3Status, fh: Option<Vec<u8>>, attrs: Option<Attrs>, wcc: WccData },
    Remove { status: Nfs3Status, wcc: WccData },
    Rename { status: Nfs3Status, from_wcc: WccData, to_wcc: WccData },
    Link { status: Nfs3Status, attrs: Option<Attrs>, wcc: WccData },
    ReadDir {
        status: Nfs3Status,
        entries: Vec<(String, u128, u64)>,
        verifier: u64,
        eof: bool,
    },
    ReadDirPlus {
        status: Nfs3Status,
        entries: Vec<DirPlusEntry>,
        verifier: u64,
        eof: bool,
    },
    FsStat {
        status: Nfs3Status,
        total_bytes: u64,
        free_bytes: u64,
        total_files: u64,
        free_files: u64,
    },
    FsInfo {
        status: Nfs3Status,
        read_max: u32,
        write_max: u32,
        transfer_preferred: u32,
        max_file_size: u64,
    },
    PathConf {
        status: Nfs3Status,
        max_link: u32,
        max_name: u32,
        no_trunc: bool,
        case_preserving: bool,
    },
    Commit { status: Nfs3Status, verifier: [u8; 8], attrs: Option<Attrs> },
}

/// Per-connection duplicate-request cache.
///
/// Retransmitted requests (same xid, same procedure) are answered with
/// the cached reply instead of being re-executed.
pub struct DupCache {
    inner: Mutex<DupCacheInner>,
}

struct DupCacheInner {
    replies: HashMap<(u32, Discriminant<Nfs3Request>), Arc<Nfs3Reply>>,
    order: VecDeque<(u32, Discriminant<Nfs3Request>)>,
}

impl Default for DupCache {
    fn default() -> Self {
        DupCache {
            inner: Mutex::new(DupCacheInner {
                replies: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }
}

impl DupCache {
    fn get(&self, key: (u32, Discriminant<Nfs3Request>)) -> Option<Arc<Nfs3Reply>> {
        match self.inner.lock() {
            Ok(inner) => inner.replies.get(&key).cloned(),
            Err(p) => p.into_inner().replies.get(&key).cloned(),
        }
    }

    fn insert(&self, key: (u32, Discriminant<Nfs3Request>), reply: Arc<Nfs3Reply>) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if inner.replies.insert(key, reply).is_none() {
            inner.order.push_back(key);
            while inner.order.len() > DUP_CACHE_CAPACITY {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.replies.remove(&evicted);
                }
            }
        }
    }
}

/// The NFSv3 router.
pub struct Nfs3Dispatcher {
    svc: ServiceContext,
}

impl Nfs3Dispatcher {
    pub fn new(svc: ServiceContext) -> Nfs3Dispatcher {
        Nfs3Dispatcher { svc }
    }

    /// Dispatches one decoded procedure, consulting the connection's
    /// duplicate-request cache first.
    pub async fn handle(
        &self,
        dup: &DupCache,
        xid: u32,
        creds: &Credentials,
        request: Nfs3Request,
    ) -> Arc<Nfs3Reply> {
        let key = (xid, std::mem::discriminant(&request));
        if let Some(cached) = dup.get(key) {
            debug!(xid, "replaying cached reply for retransmission");
            return cached;
        }
        let reply = Arc::new(self.dispatch(creds, request).await);
        dup.insert(key, reply.clone());
        reply
    }

    async fn dispatch(&self, creds: &Credentials, request: Nfs3Request) -> Nfs3Reply {
        match request {
            Nfs3Request::Null => Nfs3Reply::Null,
            Nfs3Request::GetAttr { fh } => self.getattr(creds, &fh).await,
            Nfs3Request::SetAttr { fh, patch, guard_ctime } => {
                self.setattr(creds, &fh, patch, guard_ctime).await
            }
            Nfs3Request::Lookup { dir, name } => self.lookup(creds, &dir, &name).await,
            Nfs3Request::Access { fh, mask } => self.access(creds, &fh, mask).await,
            Nfs3Request::ReadLink { fh } => self.readlink(creds, &fh).await,
            Nfs3Request::Read { fh, offset, count } => {
                self.read(creds, &fh, offset, count).await
            }
            Nfs3Request::Write { fh, offset, data, stable } => {
                self.write(creds, &fh, offset, data, stable).await
            }
            Nfs3Request::Create { dir, name, disposition, patch } => {
                self.create(creds, &dir, &name, disposition, patch).await
            }
            Nfs3Request::Mkdir { dir, name, patch } => {
                self.mkdir(creds, &dir, &name, patch).await
            }
            Nfs3Request::Symlink { dir, name, target, patch } => {
                self.symlink(creds, &dir, &name, &target, patch).await
            }
            Nfs3Request::Mknod { dir, name, kind, rdev, patch } => {
                self.mknod(creds, &dir, &name, kind, rdev, patch).await
            }
            Nfs3Request::Remove { dir, name } => self.remove(creds, &dir, &name, false).await,
            Nfs3Request::Rmdir { dir, name } => self.remove(creds, &dir, &name, true).await,
            Nfs3Request::Rename { from_dir, from_name, to_dir, to_name } => {
                self.rename(creds, &from_dir, &from_name, &to_dir, &to_name).await
            }
            Nfs3Request::Link { fh, dir, name } => self.link(creds, &fh, &dir, &name).await,
            Nfs3Request::ReadDir { fh, cookie, verifier, count } => {
                self.readdir(creds, &fh, cookie, verifier, count, false).await
            }
            Nfs3Request::ReadDirPlus { fh, cookie, verifier, count } => {
                self.readdir(creds, &fh, cookie, verifier, count, true).await
            }
            Nfs3Request::FsStat { fh } => self.fsstat(creds, &fh).await,
            Nfs3Request::FsInfo { fh } => self.fsinfo(creds, &fh).await,
            Nfs3Request::PathConf { fh } => self.pathconf(creds, &fh).await,
            Nfs3Request::Commit { fh, offset, count } => {
                self.commit(creds, &fh, offset, count).await
            }
        }
    }

    /// Resolves a filehandle to an operation context plus inode.
    fn resolve(&self, creds: &Credentials, fh: &[u8]) -> EngineResult<(OpContext, InodeId)> {
        let decoded = self.svc.handles.decode(fh)?;
        if decoded.is_pseudo() {
            // the v3 namespace never contains pseudo handles
            return Err(EngineError::StaleHandle);
        }
        let ctx = self.svc.op_context(creds, &decoded)?;
        Ok((ctx, decoded.inode))
    }

    fn encode_fh(&self, ctx: &OpContext, id: InodeId) -> Vec<u8> {
        self.svc.handles.encode(ctx.share.tag, id)
    }

    async fn digest(&self, ctx: &OpContext, id: InodeId) -> Option<AttrDigest> {
        self.svc.engine.get_attr(ctx, id).await.ok().map(|a| a.digest())
    }

    async fn post_attrs(&self, ctx: &OpContext, id: InodeId) -> Option<Attrs> {
        self.svc.engine.get_attr(ctx, id).await.ok()
    }

    async fn getattr(&self, creds: &Credentials, fh: &[u8]) -> Nfs3Reply {
        match self.resolve(creds, fh) {
            Ok((ctx, id)) => match self.svc.engine.get_attr(&ctx, id).await {
                Ok(attrs) => {
                    Nfs3Reply::GetAttr { status: Nfs3Status::NFS3_OK, attrs: Some(attrs) }
                }
                Err(err) => Nfs3Reply::GetAttr { status: err.nfs3(), attrs: None },
            },
            Err(err) => Nfs3Reply::GetAttr { status: err.nfs3(), attrs: None },
        }
    }

    async fn setattr(
        &self,
        creds: &Credentials,
        fh: &[u8],
        patch: SetAttrPatch,
        guard_ctime: Option<FileTime>,
    ) -> Nfs3Reply {
        let (ctx, id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => return Nfs3Reply::SetAttr { status: err.nfs3(), wcc: WccData::default() },
        };
        let before = self.digest(&ctx, id).await;
        if let (Some(guard), Some(pre)) = (guard_ctime, before) {
            if guard != pre.ctime {
                return Nfs3Reply::SetAttr {
                    status: Nfs3Status::NFS3ERR_NOT_SYNC,
                    wcc: WccData { before, after: self.post_attrs(&ctx, id).await },
                };
            }
        }
        let status = match self.svc.engine.set_attr(&ctx, id, &patch).await {
            Ok(_) => Nfs3Status::NFS3_OK,
            Err(err) => err.nfs3(),
        };
        Nfs3Reply::SetAttr {
            status,
            wcc: WccData { before, after: self.post_attrs(&ctx, id).await },
        }
    }

    async fn lookup(&self, creds: &Credentials, dir: &[u8], name: &str) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Lookup {
                    status: err.nfs3(),
                    fh: None,
                    attrs: None,
                    dir_attrs: None,
                }
            }
        };
        match self.svc.engine.lookup(&ctx, dir_id, name).await {
            Ok((id, attrs)) => Nfs3Reply::Lookup {
                status: Nfs3Status::NFS3_OK,
                fh: Some(self.encode_fh(&ctx, id)),
                attrs: Some(attrs),
                dir_attrs: self.post_attrs(&ctx, dir_id).await,
            },
            Err(err) => Nfs3Reply::Lookup {
                status: err.nfs3(),
                fh: None,
                attrs: None,
                dir_attrs: self.post_attrs(&ctx, dir_id).await,
            },
        }
    }

    async fn access(&self, creds: &Credentials, fh: &[u8], mask: u32) -> Nfs3Reply {
        let (ctx, id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Access { status: err.nfs3(), granted: 0, attrs: None }
            }
        };
        let attrs = match self.svc.engine.get_attr(&ctx, id).await {
            Ok(attrs) => attrs,
            Err(err) => {
                return Nfs3Reply::Access { status: err.nfs3(), granted: 0, attrs: None }
            }
        };
        let mut granted = 0;
        let can_read = ctx.permission.allows_read();
        let can_write = ctx.permission.allows_write() && !ctx.share.config.read_only;
        if can_read {
            granted |= mask & (ACCESS3_READ | ACCESS3_LOOKUP | ACCESS3_EXECUTE);
        }
        if can_write {
            granted |= mask & (ACCESS3_MODIFY | ACCESS3_EXTEND | ACCESS3_DELETE);
        }
        Nfs3Reply::Access { status: Nfs3Status::NFS3_OK, granted, attrs: Some(attrs) }
    }

    async fn readlink(&self, creds: &Credentials, fh: &[u8]) -> Nfs3Reply {
        match self.resolve(creds, fh) {
            Ok((ctx, id)) => match self.svc.engine.readlink(&ctx, id).await {
                Ok(target) => {
                    Nfs3Reply::ReadLink { status: Nfs3Status::NFS3_OK, target: Some(target) }
                }
                Err(err) => Nfs3Reply::ReadLink { status: err.nfs3(), target: None },
            },
            Err(err) => Nfs3Reply::ReadLink { status: err.nfs3(), target: None },
        }
    }

    async fn read(&self, creds: &Credentials, fh: &[u8], offset: u64, count: u32) -> Nfs3Reply {
        let (ctx, id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Read { status: err.nfs3(), data: Vec::new(), eof: false, attrs: None }
            }
        };
        let count = count.min(self.svc.settings.current().max_read_size);
        match self.svc.engine.read(&ctx, id, offset, count as usize).await {
            Ok((data, eof)) => Nfs3Reply::Read {
                status: Nfs3Status::NFS3_OK,
                data,
                eof,
                attrs: self.post_attrs(&ctx, id).await,
            },
            Err(err) => {
                Nfs3Reply::Read { status: err.nfs3(), data: Vec::new(), eof: false, attrs: None }
            }
        }
    }

    async fn write(
        &self,
        creds: &Credentials,
        fh: &[u8],
        offset: u64,
        data: Vec<u8>,
        stable: Stability,
    ) -> Nfs3Reply {
        let (ctx, id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Write {
                    status: err.nfs3(),
                    count: 0,
                    committed: false,
                    verifier: [0; 8],
                    wcc: WccData::default(),
                }
            }
        };
        if data.len() as u32 > self.svc.settings.current().max_write_size {
            return Nfs3Reply::Write {
                status: Nfs3Status::NFS3ERR_FBIG,
                count: 0,
                committed: false,
                verifier: [0; 8],
                wcc: WccData::default(),
            };
        }
        let before = self.digest(&ctx, id).await;
        match self.svc.engine.write(&ctx, id, offset, &data, stable).await {
            Ok((count, verifier)) => Nfs3Reply::Write {
                status: Nfs3Status::NFS3_OK,
                count,
                committed: stable != Stability::Unstable,
                verifier,
                wcc: WccData { before, after: self.post_attrs(&ctx, id).await },
            },
            Err(err) => Nfs3Reply::Write {
                status: err.nfs3(),
                count: 0,
                committed: false,
                verifier: [0; 8],
                wcc: WccData { before, after: self.post_attrs(&ctx, id).await },
            },
        }
    }

    async fn create(
        &self,
        creds: &Credentials,
        dir: &[u8],
        name: &str,
        disposition: CreateDisposition,
        patch: SetAttrPatch,
    ) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Create {
                    status: err.nfs3(),
                    fh: None,
                    attrs: None,
                    wcc: WccData::default(),
                }
            }
        };
        let before = self.digest(&ctx, dir_id).await;
        match self.svc.engine.create(&ctx, dir_id, name, &patch, disposition).await {
            Ok((id, attrs)) => Nfs3Reply::Create {
                status: Nfs3Status::NFS3_OK,
                fh: Some(self.encode_fh(&ctx, id)),
                attrs: Some(attrs),
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
            Err(err) => Nfs3Reply::Create {
                status: err.nfs3(),
                fh: None,
                attrs: None,
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
        }
    }

    async fn mkdir(
        &self,
        creds: &Credentials,
        dir: &[u8],
        name: &str,
        patch: SetAttrPatch,
    ) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Create {
                    status: err.nfs3(),
                    fh: None,
                    attrs: None,
                    wcc: WccData::default(),
                }
            }
        };
        let before = self.digest(&ctx, dir_id).await;
        match self.svc.engine.mkdir(&ctx, dir_id, name, &patch).await {
            Ok((id, attrs)) => Nfs3Reply::Create {
                status: Nfs3Status::NFS3_OK,
                fh: Some(self.encode_fh(&ctx, id)),
                attrs: Some(attrs),
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
            Err(err) => Nfs3Reply::Create {
                status: err.nfs3(),
                fh: None,
                attrs: None,
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
        }
    }

    async fn symlink(
        &self,
        creds: &Credentials,
        dir: &[u8],
        name: &str,
        target: &str,
        patch: SetAttrPatch,
    ) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Create {
                    status: err.nfs3(),
                    fh: None,
                    attrs: None,
                    wcc: WccData::default(),
                }
            }
        };
        let before = self.digest(&ctx, dir_id).await;
        match self.svc.engine.symlink(&ctx, dir_id, name, target, &patch).await {
            Ok((id, attrs)) => Nfs3Reply::Create {
                status: Nfs3Status::NFS3_OK,
                fh: Some(self.encode_fh(&ctx, id)),
                attrs: Some(attrs),
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
            Err(err) => Nfs3Reply::Create {
                status: err.nfs3(),
                fh: None,
                attrs: None,
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
        }
    }

    async fn mknod(
        &self,
        creds: &Credentials,
        dir: &[u8],
        name: &str,
        kind: InodeKind,
        rdev: Option<DeviceId>,
        patch: SetAttrPatch,
    ) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Create {
                    status: err.nfs3(),
                    fh: None,
                    attrs: None,
                    wcc: WccData::default(),
                }
            }
        };
        let before = self.digest(&ctx, dir_id).await;
        match self.svc.engine.mknod(&ctx, dir_id, name, kind, rdev, &patch).await {
            Ok((id, attrs)) => Nfs3Reply::Create {
                status: Nfs3Status::NFS3_OK,
                fh: Some(self.encode_fh(&ctx, id)),
                attrs: Some(attrs),
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
            Err(err) => Nfs3Reply::Create {
                status: err.nfs3(),
                fh: None,
                attrs: None,
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
        }
    }

    async fn remove(
        &self,
        creds: &Credentials,
        dir: &[u8],
        name: &str,
        is_rmdir: bool,
    ) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Remove { status: err.nfs3(), wcc: WccData::default() }
            }
        };
        let before = self.digest(&ctx, dir_id).await;
        let status = match self.svc.engine.remove(&ctx, dir_id, name, is_rmdir).await {
            Ok(()) => Nfs3Status::NFS3_OK,
            Err(err) => err.nfs3(),
        };
        Nfs3Reply::Remove {
            status,
            wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
        }
    }

    async fn rename(
        &self,
        creds: &Credentials,
        from_dir: &[u8],
        from_name: &str,
        to_dir: &[u8],
        to_name: &str,
    ) -> Nfs3Reply {
        let (ctx, from_id) = match self.resolve(creds, from_dir) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Rename {
                    status: err.nfs3(),
                    from_wcc: WccData::default(),
                    to_wcc: WccData::default(),
                }
            }
        };
        let to_decoded = match self.svc.handles.decode(to_dir) {
            Ok(d) => d,
            Err(err) => {
                return Nfs3Reply::Rename {
                    status: err.nfs3(),
                    from_wcc: WccData::default(),
                    to_wcc: WccData::default(),
                }
            }
        };
        // renames never cross shares
        if to_decoded.share_tag != ctx.share.tag {
            return Nfs3Reply::Rename {
                status: EngineError::CrossShare.nfs3(),
                from_wcc: WccData::default(),
                to_wcc: WccData::default(),
            };
        }
        let to_id = to_decoded.inode;
        let from_before = self.digest(&ctx, from_id).await;
        let to_before = self.digest(&ctx, to_id).await;
        let status = match self
            .svc
            .engine
            .rename(&ctx, from_id, from_name, to_id, to_name, RenameFlags::default())
            .await
        {
            Ok(()) => Nfs3Status::NFS3_OK,
            Err(err) => err.nfs3(),
        };
        Nfs3Reply::Rename {
            status,
            from_wcc: WccData { before: from_before, after: self.post_attrs(&ctx, from_id).await },
            to_wcc: WccData { before: to_before, after: self.post_attrs(&ctx, to_id).await },
        }
    }

    async fn link(&self, creds: &Credentials, fh: &[u8], dir: &[u8], name: &str) -> Nfs3Reply {
        let (ctx, file_id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Link { status: err.nfs3(), attrs: None, wcc: WccData::default() }
            }
        };
        let dir_decoded = match self.svc.handles.decode(dir) {
            Ok(d) => d,
            Err(err) => {
                return Nfs3Reply::Link { status: err.nfs3(), attrs: None, wcc: WccData::default() }
            }
        };
        // hard links never cross shares
        if dir_decoded.share_tag != ctx.share.tag {
            return Nfs3Reply::Link {
                status: EngineError::CrossShare.nfs3(),
                attrs: None,
                wcc: WccData::default(),
            };
        }
        let dir_id = dir_decoded.inode;
        let before = self.digest(&ctx, dir_id).await;
        match self.svc.engine.link(&ctx, file_id, dir_id, name).await {
            Ok(attrs) => Nfs3Reply::Link {
                status: Nfs3Status::NFS3_OK,
                attrs: Some(attrs),
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
            Err(err) => Nfs3Reply::Link {
                status: err.nfs3(),
                attrs: None,
                wcc: WccData { before, after: self.post_attrs(&ctx, dir_id).await },
            },
        }
    }

    async fn readdir(
        &self,
        creds: &Credentials,
        fh: &[u8],
        cookie: u64,
        verifier: u64,
        count: u32,
        plus: bool,
    ) -> Nfs3Reply {
        let (ctx, dir_id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => {
                return if plus {
                    Nfs3Reply::ReadDirPlus {
                        status: err.nfs3(),
                        entries: Vec::new(),
                        verifier: 0,
                        eof: false,
                    }
                } else {
                    Nfs3Reply::ReadDir {
                        status: err.nfs3(),
                        entries: Vec::new(),
                        verifier: 0,
                        eof: false,
                    }
                }
            }
        };
        let limit = (count as usize).clamp(1, 4096);
        let presented = (cookie != 0).then_some(verifier);
        match self.svc.engine.readdir(&ctx, dir_id, cookie, presented, limit).await {
            Ok(page) => {
                if plus {
                    let entries = page
                        .entries
                        .iter()
                        .map(|e| DirPlusEntry {
                            name: e.name.clone(),
                            fileid: e.id.0,
                            cookie: e.cookie,
                            fh: self.encode_fh(&ctx, e.id),
                            attrs: e.attrs.clone(),
                        })
                        .collect();
                    Nfs3Reply::ReadDirPlus {
                        status: Nfs3Status::NFS3_OK,
                        entries,
                        verifier: page.verifier,
                        eof: page.eof,
                    }
                } else {
                    let entries = page
                        .entries
                        .iter()
                        .map(|e| (e.name.clone(), e.id.0, e.cookie))
                        .collect();
                    Nfs3Reply::ReadDir {
                        status: Nfs3Status::NFS3_OK,
                        entries,
                        verifier: page.verifier,
                        eof: page.eof,
                    }
                }
            }
            Err(err) => {
                if plus {
                    Nfs3Reply::ReadDirPlus {
                        status: err.nfs3(),
                        entries: Vec::new(),
                        verifier: 0,
                        eof: false,
                    }
                } else {
                    Nfs3Reply::ReadDir {
                        status: err.nfs3(),
                        entries: Vec::new(),
                        verifier: 0,
                        eof: false,
                    }
                }
            }
        }
    }

    async fn fsstat(&self, creds: &Credentials, fh: &[u8]) -> Nfs3Reply {
        match self.resolve(creds, fh) {
            Ok(_) => Nfs3Reply::FsStat {
                status: Nfs3Status::NFS3_OK,
                total_bytes: u64::MAX / 2,
                free_bytes: u64::MAX / 4,
                total_files: u64::MAX / 2,
                free_files: u64::MAX / 4,
            },
            Err(err) => Nfs3Reply::FsStat {
                status: err.nfs3(),
                total_bytes: 0,
                free_bytes: 0,
                total_files: 0,
                free_files: 0,
            },
        }
    }

    async fn fsinfo(&self, creds: &Credentials, fh: &[u8]) -> Nfs3Reply {
        let settings = self.svc.settings.current();
        match self.resolve(creds, fh) {
            Ok(_) => Nfs3Reply::FsInfo {
                status: Nfs3Status::NFS3_OK,
                read_max: settings.max_read_size,
                write_max: settings.max_write_size,
                transfer_preferred: settings.preferred_transfer_size,
                max_file_size: u64::MAX,
            },
            Err(err) => Nfs3Reply::FsInfo {
                status: err.nfs3(),
                read_max: 0,
                write_max: 0,
                transfer_preferred: 0,
                max_file_size: 0,
            },
        }
    }

    async fn pathconf(&self, creds: &Credentials, fh: &[u8]) -> Nfs3Reply {
        match self.resolve(creds, fh) {
            Ok(_) => Nfs3Reply::PathConf {
                status: Nfs3Status::NFS3_OK,
                max_link: u32::MAX,
                max_name: 255,
                no_trunc: true,
                case_preserving: true,
            },
            Err(err) => Nfs3Reply::PathConf {
                status: err.nfs3(),
                max_link: 0,
                max_name: 0,
                no_trunc: false,
                case_preserving: false,
            },
        }
    }

    async fn commit(&self, creds: &Credentials, fh: &[u8], _offset: u64, _count: u32) -> Nfs3Reply {
        let (ctx, id) = match self.resolve(creds, fh) {
            Ok(v) => v,
            Err(err) => {
                return Nfs3Reply::Commit { status: err.nfs3(), verifier: [0; 8], attrs: None }
            }
        };
        match self.svc.engine.commit(&ctx, id).await {
            Ok(verifier) => Nfs3Reply::Commit {
                status: Nfs3Status::NFS3_OK,
                verifier,
                attrs: self.post_attrs(&ctx, id).await,
            },
            Err(err) => Nfs3Reply::Commit { status: err.nfs3(), verifier: [0; 8], attrs: None },
        }
    }
}
