//! Inode model shared by the engine and the metadata stores.
//!
//! Inodes are identified by a 128-bit opaque id, monotonic per share and
//! never reused. Attributes follow the POSIX set the wire protocols agree
//! on; attribute mutation goes through [`SetAttrPatch`] so a store can
//! apply only the requested fields atomically.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable opaque inode identifier. Monotonic per share, never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(pub u128);

impl InodeId {
    /// Big-endian byte form used by the filehandle codec.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Rebuilds an id from its big-endian byte form.
    pub fn from_bytes(bytes: [u8; 16]) -> InodeId {
        InodeId(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// File-system object kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InodeKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl InodeKind {
    /// True for kinds that carry a device number.
    pub fn is_device(&self) -> bool {
        matches!(self, InodeKind::CharDevice | InodeKind::BlockDevice)
    }
}

/// Major/minor device pair for device nodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

/// Timestamp with nanosecond precision.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct FileTime {
    pub seconds: i64,
    pub nanos: u32,
}

impl FileTime {
    /// Current wall-clock time.
    pub fn now() -> FileTime {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => FileTime { seconds: d.as_secs() as i64, nanos: d.subsec_nanos() },
            Err(_) => FileTime::default(),
        }
    }
}

/// Full attribute set of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attrs {
    pub kind: InodeKind,
    /// Permission bits plus setuid/setgid/sticky (12 bits).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
    /// Birth time, fixed at creation.
    pub btime: FileTime,
    pub rdev: Option<DeviceId>,
}

impl Attrs {
    /// Fresh attributes for a newly created object.
    pub fn new(kind: InodeKind, mode: u32, uid: u32, gid: u32) -> Attrs {
        let now = FileTime::now();
        Attrs {
            kind,
            mode: mode & 0o7777,
            uid,
            gid,
            size: 0,
            nlink: if kind == InodeKind::Directory { 2 } else { 1 },
            atime: now,
            mtime: now,
            ctime: now,
            btime: now,
            rdev: None,
        }
    }

    /// Compact digest used for weak cache consistency reporting.
    pub fn digest(&self) -> AttrDigest {
        AttrDigest { size: self.size, mtime: self.mtime, ctime: self.ctime }
    }
}

/// Digest of the attributes that matter for weak cache consistency.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AttrDigest {
    pub size: u64,
    pub mtime: FileTime,
    pub ctime: FileTime,
}

/// Strategy for updating a timestamp in a [`SetAttrPatch`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SetTime {
    #[default]
    DontChange,
    ServerCurrent,
    ClientProvided(FileTime),
}

impl SetTime {
    /// Resolves the strategy against the current time.
    pub fn resolve(&self, now: FileTime) -> Option<FileTime> {
        match self {
            SetTime::DontChange => None,
            SetTime::ServerCurrent => Some(now),
            SetTime::ClientProvided(t) => Some(*t),
        }
    }
}

/// Attribute mutation: a sum of optional fields applied atomically.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SetAttrPatch {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
}

impl SetAttrPatch {
    /// True when the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime == SetTime::DontChange
            && self.mtime == SetTime::DontChange
    }

    /// Patch that only bumps the access time to now.
    pub fn touch_atime() -> SetAttrPatch {
        SetAttrPatch { atime: SetTime::ServerCurrent, ..Default::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_id_round_trips_through_bytes() {
        let id = InodeId(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        assert_eq!(InodeId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn new_directory_starts_with_two_links() {
        let attrs = Attrs::new(InodeKind::Directory, 0o755, 0, 0);
        assert_eq!(attrs.nlink, 2);
        let attrs = Attrs::new(InodeKind::Regular, 0o644, 0, 0);
        assert_eq!(attrs.nlink, 1);
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(SetAttrPatch::default().is_empty());
        assert!(!SetAttrPatch::touch_atime().is_empty());
    }
}
