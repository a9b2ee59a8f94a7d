//! Store driver interfaces.
//!
//! A share is backed by two pluggable data planes: a [`MetaStore`] holding
//! the directory tree, attributes and inode graph, and a [`PayloadStore`]
//! holding opaque byte blobs addressed by content id. Drivers range from
//! in-memory to embedded KV, SQL and object storage; the engine is written
//! against these traits only and treats every call as a suspension point
//! with a driver-specific latency and failure profile.
//!
//! Failure is explicit: drivers return [`StoreError`] kinds, never panic,
//! and the engine maps kinds to protocol errors. Cancellation is by future
//! drop: the engine wraps driver calls in deadline timeouts and abandons
//! in-flight operations when a request is cancelled.

pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::acl::Acl;
use crate::inode::{Attrs, DeviceId, FileTime, InodeId, InodeKind, SetAttrPatch};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Typed store failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    NotSupported,
    /// Concurrent mutation detected mid-transaction.
    Conflict,
    NoSpace,
    /// Driver-level failure with a diagnostic message.
    Io(String),
    Timeout,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(msg) => write!(f, "store i/o error: {msg}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Payload-store key naming a complete file content.
///
/// Keys have the form `<share-name>/<uuid>` but are opaque to the engine;
/// a key is never reused after deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId(pub String);

impl ContentId {
    /// Allocates a fresh key under the given share namespace.
    pub fn fresh(share: &str) -> ContentId {
        ContentId(format!("{}/{}", share.trim_start_matches('/'), uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub id: InodeId,
    /// Stable readdir token, monotone per directory, never reused.
    pub cookie: u64,
}

/// A page of directory entries.
#[derive(Debug, Clone, Default)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
    /// Directory change counter at scan time; feeds the readdir verifier.
    pub change: u64,
}

/// Extra payload for `create_entry`, depending on the created kind.
#[derive(Debug, Clone, Default)]
pub struct CreateExtras {
    pub symlink_target: Option<String>,
    pub rdev: Option<DeviceId>,
    pub content_id: Option<ContentId>,
    /// Exclusive-create idempotency token. When the entry already exists
    /// and carries the same token, `create_entry` returns the existing
    /// inode instead of `AlreadyExists`. Tokens are pruned after 24 h.
    pub exclusive_token: Option<[u8; 8]>,
}

/// Overwrite behaviour for `rename`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OverwritePolicy {
    Allow,
    Deny,
}

/// What `unlink` removed.
#[derive(Debug, Clone)]
pub struct UnlinkOutcome {
    pub removed: InodeId,
    /// True when the inode's link count hit zero.
    pub nlink_zero: bool,
    /// The content key to schedule for payload deletion when the inode
    /// died (regular files only).
    pub orphaned_content: Option<ContentId>,
}

/// What `rename` displaced at the destination, if anything.
#[derive(Debug, Clone, Default)]
pub struct RenameOutcome {
    pub replaced: Option<UnlinkOutcome>,
}

/// Metadata store: the directory/inode graph of one share.
///
/// All mutating operations are atomic from the caller's perspective; a
/// driver whose backend splits them (distinct KV writes) must either apply
/// a recovery ordering or report `Conflict` so the engine can retry.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// The share's root directory inode.
    async fn root(&self) -> StoreResult<InodeId>;

    /// Resolves a name within a directory.
    async fn lookup(&self, parent: InodeId, name: &str) -> StoreResult<InodeId>;

    async fn get_attr(&self, id: InodeId) -> StoreResult<Attrs>;

    /// Applies an attribute patch atomically and returns the result.
    /// Mode/owner policy is enforced by the caller, not the store.
    async fn set_attr(&self, id: InodeId, patch: &SetAttrPatch) -> StoreResult<Attrs>;

    /// Creates a new inode and links it under `parent` as `name`,
    /// in a single transaction.
    async fn create_entry(
        &self,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        attrs: Attrs,
        extras: CreateExtras,
    ) -> StoreResult<InodeId>;

    /// Links an existing inode under a new name (atomic `nlink` bump).
    async fn link(&self, parent: InodeId, name: &str, existing: InodeId) -> StoreResult<()>;

    /// Unlinks a name (atomic `nlink` drop), reporting whether the inode
    /// died. `is_rmdir` requires the target to be an empty directory.
    async fn unlink(&self, parent: InodeId, name: &str, is_rmdir: bool)
        -> StoreResult<UnlinkOutcome>;

    /// Atomically moves `src_name` to `dst_name`, honouring the overwrite
    /// policy. Overwriting a non-empty directory, or mixing directory and
    /// non-directory targets, fails.
    async fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
        overwrite: OverwritePolicy,
    ) -> StoreResult<RenameOutcome>;

    /// Reads directory entries after `cookie` (0 starts the scan).
    /// Cookies are stable across unrelated mutations.
    async fn readdir(&self, id: InodeId, cookie: u64, limit: usize) -> StoreResult<DirPage>;

    /// The directory's structural change counter.
    async fn dir_change(&self, id: InodeId) -> StoreResult<u64>;

    /// Atomically swaps a regular file's content reference, size and
    /// timestamps. Returns the replaced key so the caller can schedule
    /// payload deletion.
    async fn set_content(
        &self,
        id: InodeId,
        content: Option<ContentId>,
        size: u64,
        mtime: FileTime,
        ctime: FileTime,
    ) -> StoreResult<Option<ContentId>>;

    /// Current content reference and size of a regular file.
    async fn get_content(&self, id: InodeId) -> StoreResult<Option<(ContentId, u64)>>;

    /// The target recorded in a symbolic link.
    async fn read_symlink(&self, id: InodeId) -> StoreResult<String>;

    async fn set_xattr(&self, id: InodeId, name: &str, value: &[u8]) -> StoreResult<()>;
    async fn get_xattr(&self, id: InodeId, name: &str) -> StoreResult<Vec<u8>>;
    async fn list_xattr(&self, id: InodeId) -> StoreResult<Vec<String>>;
    async fn remove_xattr(&self, id: InodeId, name: &str) -> StoreResult<()>;

    async fn set_acl(&self, id: InodeId, acl: &Acl) -> StoreResult<()>;
    async fn get_acl(&self, id: InodeId) -> StoreResult<Option<Acl>>;
}

/// Payload store: content-addressed blob operations.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Atomic full-object write.
    async fn put(&self, key: &ContentId, bytes: &[u8]) -> StoreResult<()>;

    /// Reads a complete object.
    async fn get(&self, key: &ContentId) -> StoreResult<Vec<u8>>;

    /// Reads a byte range; short reads past the end are not an error.
    async fn get_range(&self, key: &ContentId, offset: u64, len: usize) -> StoreResult<Vec<u8>>;

    /// Idempotent deletion.
    async fn delete(&self, key: &ContentId) -> StoreResult<()>;

    /// The incremental-write extension, when the driver supports it.
    /// The engine streams commits of 5 MiB and above through it.
    fn incremental(&self) -> Option<&dyn IncrementalWrite> {
        None
    }
}

/// Optional streaming-upload extension of [`PayloadStore`].
#[async_trait]
pub trait IncrementalWrite: Send + Sync {
    /// Opens an upload session for a fresh key.
    async fn begin(&self, key: &ContentId) -> StoreResult<u64>;

    /// Appends bytes, returning the offset after the append.
    async fn append(&self, session: u64, bytes: &[u8]) -> StoreResult<u64>;

    /// Seals the object; it becomes readable under its key.
    async fn finish(&self, session: u64) -> StoreResult<()>;

    /// Discards an unfinished session.
    async fn abort(&self, session: u64) -> StoreResult<()>;
}
