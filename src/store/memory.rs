//! In-memory store drivers.
//!
//! These back tests and single-process deployments. The metadata driver
//! keeps the whole inode graph under one mutex, which makes every
//! operation trivially atomic; the payload driver is a keyed byte map with
//! an optional incremental-upload mode so both commit paths get exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::acl::Acl;
use crate::inode::{Attrs, FileTime, InodeId, InodeKind, SetAttrPatch};
use crate::store::{
    ContentId, CreateExtras, DirEntry, DirPage, IncrementalWrite, MetaStore, OverwritePolicy,
    PayloadStore, RenameOutcome, StoreError, StoreResult, UnlinkOutcome,
};

/// Exclusive-create tokens are pruned after this long.
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct ChildEnt {
    id: InodeId,
    cookie: u64,
    token: Option<([u8; 8], SystemTime)>,
}

struct DirState {
    children: BTreeMap<String, ChildEnt>,
    next_cookie: u64,
    change: u64,
}

impl DirState {
    fn new() -> DirState {
        DirState { children: BTreeMap::new(), next_cookie: 3, change: 0 }
    }

    fn insert(&mut self, name: &str, id: InodeId, token: Option<[u8; 8]>) {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        self.change += 1;
        self.children.insert(
            name.to_string(),
            ChildEnt { id, cookie, token: token.map(|t| (t, SystemTime::now())) },
        );
    }

    fn remove(&mut self, name: &str) -> Option<ChildEnt> {
        let ent = self.children.remove(name);
        if ent.is_some() {
            self.change += 1;
        }
        ent
    }
}

struct Node {
    attrs: Attrs,
    content: Option<ContentId>,
    symlink: Option<String>,
    xattrs: BTreeMap<String, Vec<u8>>,
    acl: Option<Acl>,
    dir: Option<DirState>,
}

impl Node {
    fn new(attrs: Attrs) -> Node {
        let dir = (attrs.kind == InodeKind::Directory).then(DirState::new);
        Node { attrs, content: None, symlink: None, xattrs: BTreeMap::new(), acl: None, dir }
    }

    fn dir(&self) -> StoreResult<&DirState> {
        self.dir.as_ref().ok_or(StoreError::NotADirectory)
    }

    fn dir_mut(&mut self) -> StoreResult<&mut DirState> {
        self.dir.as_mut().ok_or(StoreError::NotADirectory)
    }
}

struct Meta {
    nodes: HashMap<InodeId, Node>,
    next_id: u128,
    root: InodeId,
}

impl Meta {
    fn node(&self, id: InodeId) -> StoreResult<&Node> {
        self.nodes.get(&id).ok_or(StoreError::NotFound)
    }

    fn node_mut(&mut self, id: InodeId) -> StoreResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(StoreError::NotFound)
    }

    fn alloc_id(&mut self) -> InodeId {
        let id = InodeId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Metadata store keeping the whole inode graph in process memory.
pub struct MemoryMetaStore {
    inner: Mutex<Meta>,
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetaStore {
    /// Creates a store with a fresh root directory owned by root:root.
    pub fn new() -> MemoryMetaStore {
        let root = InodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::new(Attrs::new(InodeKind::Directory, 0o777, 0, 0)));
        MemoryMetaStore { inner: Mutex::new(Meta { nodes, next_id: 2, root }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Meta> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn apply_patch(attrs: &mut Attrs, patch: &SetAttrPatch) {
    let now = FileTime::now();
    if let Some(mode) = patch.mode {
        attrs.mode = mode & 0o7777;
    }
    if let Some(uid) = patch.uid {
        attrs.uid = uid;
    }
    if let Some(gid) = patch.gid {
        attrs.gid = gid;
    }
    if let Some(size) = patch.size {
        attrs.size = size;
    }
    if let Some(t) = patch.atime.resolve(now) {
        attrs.atime = t;
    }
    if let Some(t) = patch.mtime.resolve(now) {
        attrs.mtime = t;
    }
    // pure atime bumps do not count as a status change
    if patch.mode.is_some()
        || patch.uid.is_some()
        || patch.gid.is_some()
        || patch.size.is_some()
        || patch.mtime != crate::inode::SetTime::DontChange
    {
        attrs.ctime = now;
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn root(&self) -> StoreResult<InodeId> {
        Ok(self.lock().root)
    }

    async fn lookup(&self, parent: InodeId, name: &str) -> StoreResult<InodeId> {
        let meta = self.lock();
        let dir = meta.node(parent)?.dir()?;
        dir.children.get(name).map(|c| c.id).ok_or(StoreError::NotFound)
    }

    async fn get_attr(&self, id: InodeId) -> StoreResult<Attrs> {
        Ok(self.lock().node(id)?.attrs.clone())
    }

    async fn set_attr(&self, id: InodeId, patch: &SetAttrPatch) -> StoreResult<Attrs> {
        let mut meta = self.lock();
        let node = meta.node_mut(id)?;
        apply_patch(&mut node.attrs, patch);
        Ok(node.attrs.clone())
    }

    async fn create_entry(
        &self,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        attrs: Attrs,
        extras: CreateExtras,
    ) -> StoreResult<InodeId> {
        let mut meta = self.lock();
        {
            let dir = meta.node(parent)?.dir()?;
            if let Some(existing) = dir.children.get(name) {
                // exclusive-create replay: same token returns the same inode
                if let (Some(want), Some((stored, stamp))) =
                    (extras.exclusive_token, existing.token)
                {
                    let fresh = stamp.elapsed().map(|e| e < TOKEN_TTL).unwrap_or(true);
                    if fresh && stored == want {
                        return Ok(existing.id);
                    }
                }
                return Err(StoreError::AlreadyExists);
            }
        }
        let id = meta.alloc_id();
        let mut node = Node::new(attrs);
        node.attrs.kind = kind;
        node.symlink = extras.symlink_target;
        node.attrs.rdev = extras.rdev;
        if let Some(content) = extras.content_id {
            node.content = Some(content);
        }
        meta.nodes.insert(id, node);
        if kind == InodeKind::Directory {
            meta.node_mut(parent)?.attrs.nlink += 1;
        }
        let parent_dir = meta.node_mut(parent)?.dir_mut()?;
        parent_dir.insert(name, id, extras.exclusive_token);
        let now = FileTime::now();
        let parent_node = meta.node_mut(parent)?;
        parent_node.attrs.mtime = now;
        parent_node.attrs.ctime = now;
        Ok(id)
    }

    async fn link(&self, parent: InodeId, name: &str, existing: InodeId) -> StoreResult<()> {
        let mut meta = self.lock();
        if meta.node(existing)?.dir.is_some() {
            return Err(StoreError::IsADirectory);
        }
        {
            let dir = meta.node(parent)?.dir()?;
            if dir.children.contains_key(name) {
                return Err(StoreError::AlreadyExists);
            }
        }
        meta.node_mut(parent)?.dir_mut()?.insert(name, existing, None);
        let node = meta.node_mut(existing)?;
        node.attrs.nlink += 1;
        node.attrs.ctime = FileTime::now();
        Ok(())
    }

    async fn unlink(
        &self,
        parent: InodeId,
        name: &str,
        is_rmdir: bool,
    ) -> StoreResult<UnlinkOutcome> {
        let mut meta = self.lock();
        let target = {
            let dir = meta.node(parent)?.dir()?;
            dir.children.get(name).map(|c| c.id).ok_or(StoreError::NotFound)?
        };
        let target_is_dir = meta.node(target)?.dir.is_some();
        if is_rmdir {
            if !target_is_dir {
                return Err(StoreError::NotADirectory);
            }
            if !meta.node(target)?.dir()?.children.is_empty() {
                return Err(StoreError::NotEmpty);
            }
        } else if target_is_dir {
            return Err(StoreError::IsADirectory);
        }

        meta.node_mut(parent)?.dir_mut()?.remove(name);
        if target_is_dir {
            meta.node_mut(parent)?.attrs.nlink -= 1;
        }
        let now = FileTime::now();
        let parent_node = meta.node_mut(parent)?;
        parent_node.attrs.mtime = now;
        parent_node.attrs.ctime = now;

        let node = meta.node_mut(target)?;
        let nlink_zero = if target_is_dir {
            node.attrs.nlink = 0;
            true
        } else {
            node.attrs.nlink -= 1;
            node.attrs.ctime = now;
            node.attrs.nlink == 0
        };
        let orphaned_content = if nlink_zero { node.content.clone() } else { None };
        if nlink_zero {
            meta.nodes.remove(&target);
        }
        Ok(UnlinkOutcome { removed: target, nlink_zero, orphaned_content })
    }

    async fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
        overwrite: OverwritePolicy,
    ) -> StoreResult<RenameOutcome> {
        let mut meta = self.lock();
        let src_id = {
            let dir = meta.node(src_parent)?.dir()?;
            dir.children.get(src_name).map(|c| c.id).ok_or(StoreError::NotFound)?
        };
        let src_is_dir = meta.node(src_id)?.dir.is_some();

        let mut outcome = RenameOutcome::default();
        let dst_existing = {
            let dir = meta.node(dst_parent)?.dir()?;
            dir.children.get(dst_name).map(|c| c.id)
        };
        if let Some(dst_id) = dst_existing {
            if dst_id == src_id {
                return Ok(outcome);
            }
            if overwrite == OverwritePolicy::Deny {
                return Err(StoreError::AlreadyExists);
            }
            let dst_is_dir = meta.node(dst_id)?.dir.is_some();
            if src_is_dir != dst_is_dir {
                return Err(if dst_is_dir {
                    StoreError::IsADirectory
                } else {
                    StoreError::NotADirectory
                });
            }
            if dst_is_dir && !meta.node(dst_id)?.dir()?.children.is_empty() {
                return Err(StoreError::NotEmpty);
            }
            // drop the displaced destination first, then move the source
            meta.node_mut(dst_parent)?.dir_mut()?.remove(dst_name);
            if dst_is_dir {
                meta.node_mut(dst_parent)?.attrs.nlink -= 1;
            }
            let node = meta.node_mut(dst_id)?;
            let nlink_zero = if dst_is_dir {
                node.attrs.nlink = 0;
                true
            } else {
                node.attrs.nlink -= 1;
                node.attrs.nlink == 0
            };
            let orphaned_content = if nlink_zero { node.content.clone() } else { None };
            if nlink_zero {
                meta.nodes.remove(&dst_id);
            }
            outcome.replaced =
                Some(UnlinkOutcome { removed: dst_id, nlink_zero, orphaned_content });
        }

        meta.node_mut(src_parent)?.dir_mut()?.remove(src_name);
        meta.node_mut(dst_parent)?.dir_mut()?.insert(dst_name, src_id, None);
        if src_is_dir && src_parent != dst_parent {
            meta.node_mut(src_parent)?.attrs.nlink -= 1;
            meta.node_mut(dst_parent)?.attrs.nlink += 1;
        }
        let now = FileTime::now();
        for dir_id in [src_parent, dst_parent] {
            let node = meta.node_mut(dir_id)?;
            node.attrs.mtime = now;
            node.attrs.ctime = now;
        }
        meta.node_mut(src_id)?.attrs.ctime = now;
        Ok(outcome)
    }

    async fn readdir(&self, id: InodeId, cookie: u64, limit: usize) -> StoreResult<DirPage> {
        let meta = self.lock();
        let dir = meta.node(id)?.dir()?;
        let mut entries: Vec<DirEntry> = dir
            .children
            .iter()
            .filter(|(_, c)| c.cookie > cookie)
            .map(|(name, c)| DirEntry { name: name.clone(), id: c.id, cookie: c.cookie })
            .collect();
        entries.sort_by_key(|e| e.cookie);
        let eof = entries.len() <= limit;
        entries.truncate(limit);
        Ok(DirPage { entries, eof, change: dir.change })
    }

    async fn dir_change(&self, id: InodeId) -> StoreResult<u64> {
        let meta = self.lock();
        Ok(meta.node(id)?.dir()?.change)
    }

    async fn set_content(
        &self,
        id: InodeId,
        content: Option<ContentId>,
        size: u64,
        mtime: FileTime,
        ctime: FileTime,
    ) -> StoreResult<Option<ContentId>> {
        let mut meta = self.lock();
        let node = meta.node_mut(id)?;
        if node.attrs.kind != InodeKind::Regular {
            return Err(StoreError::IsADirectory);
        }
        let old = std::mem::replace(&mut node.content, content);
        node.attrs.size = size;
        node.attrs.mtime = mtime;
        node.attrs.ctime = ctime;
        Ok(old)
    }

    async fn get_content(&self, id: InodeId) -> StoreResult<Option<(ContentId, u64)>> {
        let meta = self.lock();
        let node = meta.node(id)?;
        Ok(node.content.clone().map(|c| (c, node.attrs.size)))
    }

    async fn read_symlink(&self, id: InodeId) -> StoreResult<String> {
        let meta = self.lock();
        meta.node(id)?.symlink.clone().ok_or(StoreError::NotSupported)
    }

    async fn set_xattr(&self, id: InodeId, name: &str, value: &[u8]) -> StoreResult<()> {
        let mut meta = self.lock();
        meta.node_mut(id)?.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_xattr(&self, id: InodeId, name: &str) -> StoreResult<Vec<u8>> {
        let meta = self.lock();
        meta.node(id)?.xattrs.get(name).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_xattr(&self, id: InodeId) -> StoreResult<Vec<String>> {
        let meta = self.lock();
        Ok(meta.node(id)?.xattrs.keys().cloned().collect())
    }

    async fn remove_xattr(&self, id: InodeId, name: &str) -> StoreResult<()> {
        let mut meta = self.lock();
        meta.node_mut(id)?.xattrs.remove(name).map(|_| ()).ok_or(StoreError::NotFound)
    }

    async fn set_acl(&self, id: InodeId, acl: &Acl) -> StoreResult<()> {
        let mut meta = self.lock();
        meta.node_mut(id)?.acl = Some(acl.clone());
        Ok(())
    }

    async fn get_acl(&self, id: InodeId) -> StoreResult<Option<Acl>> {
        let meta = self.lock();
        Ok(meta.node(id)?.acl.clone())
    }
}

struct PendingUpload {
    key: ContentId,
    buf: Vec<u8>,
}

/// Payload store keeping blobs in process memory.
pub struct MemoryPayloadStore {
    blobs: Mutex<HashMap<ContentId, Vec<u8>>>,
    uploads: Mutex<HashMap<u64, PendingUpload>>,
    next_upload: AtomicU64,
    incremental: bool,
}

impl Default for MemoryPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPayloadStore {
    /// Store with the incremental-write extension enabled.
    pub fn new() -> MemoryPayloadStore {
        MemoryPayloadStore {
            blobs: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_upload: AtomicU64::new(1),
            incremental: true,
        }
    }

    /// Store without the incremental-write extension, forcing whole-object
    /// commits.
    pub fn without_incremental() -> MemoryPayloadStore {
        MemoryPayloadStore { incremental: false, ..MemoryPayloadStore::new() }
    }

    /// Number of stored blobs (test observability).
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, key: &ContentId, bytes: &[u8]) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        blobs.insert(key.clone(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &ContentId) -> StoreResult<Vec<u8>> {
        let blobs = self.blobs.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        blobs.get(key).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_range(&self, key: &ContentId, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let blobs = self.blobs.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        let blob = blobs.get(key).ok_or(StoreError::NotFound)?;
        let start = (offset as usize).min(blob.len());
        let end = start.saturating_add(len).min(blob.len());
        Ok(blob[start..end].to_vec())
    }

    async fn delete(&self, key: &ContentId) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        blobs.remove(key);
        Ok(())
    }

    fn incremental(&self) -> Option<&dyn IncrementalWrite> {
        self.incremental.then_some(self as &dyn IncrementalWrite)
    }
}

#[async_trait]
impl IncrementalWrite for MemoryPayloadStore {
    async fn begin(&self, key: &ContentId) -> StoreResult<u64> {
        let session = self.next_upload.fetch_add(1, Ordering::Relaxed);
        let mut uploads = self.uploads.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        uploads.insert(session, PendingUpload { key: key.clone(), buf: Vec::new() });
        Ok(session)
    }

    async fn append(&self, session: u64, bytes: &[u8]) -> StoreResult<u64> {
        let mut uploads = self.uploads.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        let upload = uploads.get_mut(&session).ok_or(StoreError::NotFound)?;
        upload.buf.extend_from_slice(bytes);
        Ok(upload.buf.len() as u64)
    }

    async fn finish(&self, session: u64) -> StoreResult<()> {
        let upload = {
            let mut uploads =
                self.uploads.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
            uploads.remove(&session).ok_or(StoreError::NotFound)?
        };
        self.put(&upload.key, &upload.buf).await
    }

    async fn abort(&self, session: u64) -> StoreResult<()> {
        let mut uploads = self.uploads.lock().map_err(|_| StoreError::Io("poisoned".into()))?;
        uploads.remove(&session);
        Ok(())
    }
}
