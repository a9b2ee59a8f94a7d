//! Typed errors for the file-system engine and their protocol mappings.
//!
//! Every engine operation fails with an [`EngineError`] kind; the protocol
//! dispatchers translate kinds into the numeric status space of the wire
//! protocol they serve (NFSv3 per RFC 1813, NFSv4 per RFC 7530/5661, SMB2
//! NTSTATUS). The engine never deals in protocol codes and the dispatchers
//! never invent semantics: the tables here are the single point of
//! translation.

use num_derive::{FromPrimitive, ToPrimitive};

use crate::store::StoreError;

/// Result alias used by all engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Protocol-neutral failure kinds produced by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineError {
    /// The named entry does not exist.
    NoEntry,
    /// The entry already exists and the operation forbids overwrite.
    Exists,
    /// The principal's mode/ACL evaluation denied the operation.
    Perm,
    /// The operation itself is forbidden for this principal or share
    /// (read-only share, insufficient share permission).
    NotPerm,
    /// A directory was given where a non-directory is required.
    IsDir,
    /// A non-directory was given where a directory is required.
    NotDir,
    /// Directory removal or overwrite of a non-empty directory.
    NotEmpty,
    /// `readlink` on something that is not a symbolic link.
    NotSymlink,
    /// A byte-range lock or share reservation conflict.
    Denied,
    /// Granting a blocking lock would create a wait cycle.
    Deadlock,
    /// The filehandle refers to a previous server boot or a destroyed file.
    StaleHandle,
    /// The readdir cookie verifier no longer matches a known directory state.
    StaleCookie,
    /// The operation name appears in the share's blocked list.
    Blocked,
    /// The name contains bytes the protocol forbids or exceeds limits.
    BadName,
    /// Hard link or rename across share boundaries.
    CrossShare,
    /// The store driver does not implement the operation.
    NotSupported,
    /// Payload or metadata store is out of space.
    NoSpace,
    /// Mutation attempted on a read-only share.
    ReadOnly,
    /// Invalid argument (bad stateid, malformed patch, out-of-range value).
    Invalid,
    /// Underlying store failure after retries were exhausted.
    Io,
    /// The operation deadline elapsed.
    Timeout,
}

impl EngineError {
    /// Maps a store-level failure into the engine's error space.
    pub fn from_store(err: StoreError) -> EngineError {
        match err {
            StoreError::NotFound => EngineError::NoEntry,
            StoreError::AlreadyExists => EngineError::Exists,
            StoreError::NotADirectory => EngineError::NotDir,
            StoreError::IsADirectory => EngineError::IsDir,
            StoreError::NotEmpty => EngineError::NotEmpty,
            StoreError::NotSupported => EngineError::NotSupported,
            StoreError::Conflict => EngineError::Io,
            StoreError::NoSpace => EngineError::NoSpace,
            StoreError::Io(_) => EngineError::Io,
            StoreError::Timeout => EngineError::Timeout,
        }
    }

    /// True for transient store failures the engine retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Io | EngineError::Timeout)
    }

    /// NFSv3 status code for this kind (RFC 1813 2.6).
    pub fn nfs3(&self) -> Nfs3Status {
        use Nfs3Status::*;
        match self {
            EngineError::NoEntry => NFS3ERR_NOENT,
            EngineError::Exists => NFS3ERR_EXIST,
            EngineError::Perm => NFS3ERR_ACCES,
            EngineError::NotPerm => NFS3ERR_PERM,
            EngineError::IsDir => NFS3ERR_ISDIR,
            EngineError::NotDir => NFS3ERR_NOTDIR,
            EngineError::NotEmpty => NFS3ERR_NOTEMPTY,
            EngineError::NotSymlink => NFS3ERR_INVAL,
            EngineError::Denied => NFS3ERR_JUKEBOX,
            EngineError::Deadlock => NFS3ERR_JUKEBOX,
            EngineError::StaleHandle => NFS3ERR_STALE,
            EngineError::StaleCookie => NFS3ERR_BAD_COOKIE,
            // blocked operations present as an access failure so kernel
            // clients give up instead of retrying forever
            EngineError::Blocked => NFS3ERR_ACCES,
            EngineError::BadName => NFS3ERR_INVAL,
            EngineError::CrossShare => NFS3ERR_XDEV,
            EngineError::NotSupported => NFS3ERR_NOTSUPP,
            EngineError::NoSpace => NFS3ERR_NOSPC,
            EngineError::ReadOnly => NFS3ERR_ROFS,
            EngineError::Invalid => NFS3ERR_INVAL,
            EngineError::Io => NFS3ERR_IO,
            EngineError::Timeout => NFS3ERR_IO,
        }
    }

    /// NFSv4 status code for this kind (RFC 7530 / RFC 5661).
    pub fn nfs4(&self) -> Nfs4Status {
        use Nfs4Status::*;
        match self {
            EngineError::NoEntry => NFS4ERR_NOENT,
            EngineError::Exists => NFS4ERR_EXIST,
            EngineError::Perm => NFS4ERR_ACCESS,
            EngineError::NotPerm => NFS4ERR_PERM,
            EngineError::IsDir => NFS4ERR_ISDIR,
            EngineError::NotDir => NFS4ERR_NOTDIR,
            EngineError::NotEmpty => NFS4ERR_NOTEMPTY,
            EngineError::NotSymlink => NFS4ERR_INVAL,
            EngineError::Denied => NFS4ERR_DENIED,
            EngineError::Deadlock => NFS4ERR_DEADLOCK,
            EngineError::StaleHandle => NFS4ERR_STALE,
            EngineError::StaleCookie => NFS4ERR_BAD_COOKIE,
            EngineError::Blocked => NFS4ERR_ACCESS,
            EngineError::BadName => NFS4ERR_BADNAME,
            EngineError::CrossShare => NFS4ERR_XDEV,
            EngineError::NotSupported => NFS4ERR_NOTSUPP,
            EngineError::NoSpace => NFS4ERR_NOSPC,
            EngineError::ReadOnly => NFS4ERR_ROFS,
            EngineError::Invalid => NFS4ERR_INVAL,
            EngineError::Io => NFS4ERR_IO,
            EngineError::Timeout => NFS4ERR_IO,
        }
    }

    /// SMB2 NTSTATUS code for this kind.
    pub fn ntstatus(&self) -> u32 {
        use ntstatus::*;
        match self {
            EngineError::NoEntry => STATUS_OBJECT_NAME_NOT_FOUND,
            EngineError::Exists => STATUS_OBJECT_NAME_COLLISION,
            EngineError::Perm | EngineError::NotPerm | EngineError::Blocked => {
                STATUS_ACCESS_DENIED
            }
            EngineError::IsDir => STATUS_FILE_IS_A_DIRECTORY,
            EngineError::NotDir => STATUS_NOT_A_DIRECTORY,
            EngineError::NotEmpty => STATUS_DIRECTORY_NOT_EMPTY,
            EngineError::NotSymlink => STATUS_INVALID_PARAMETER,
            EngineError::Denied => STATUS_LOCK_NOT_GRANTED,
            EngineError::Deadlock => STATUS_POSSIBLE_DEADLOCK,
            EngineError::StaleHandle => STATUS_INVALID_HANDLE,
            EngineError::StaleCookie => STATUS_INVALID_PARAMETER,
            EngineError::BadName => STATUS_OBJECT_NAME_INVALID,
            EngineError::CrossShare => STATUS_NOT_SAME_DEVICE,
            EngineError::NotSupported => STATUS_NOT_SUPPORTED,
            EngineError::NoSpace => STATUS_DISK_FULL,
            EngineError::ReadOnly => STATUS_MEDIA_WRITE_PROTECTED,
            EngineError::Invalid => STATUS_INVALID_PARAMETER,
            EngineError::Io => STATUS_UNEXPECTED_IO_ERROR,
            EngineError::Timeout => STATUS_IO_TIMEOUT,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for EngineError {}

/// NFSv3 status codes (RFC 1813 2.6).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Default,
)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum Nfs3Status {
    #[default]
    NFS3_OK = 0,
    NFS3ERR_PERM = 1,
    NFS3ERR_NOENT = 2,
    NFS3ERR_IO = 5,
    NFS3ERR_NXIO = 6,
    NFS3ERR_ACCES = 13,
    NFS3ERR_EXIST = 17,
    NFS3ERR_XDEV = 18,
    NFS3ERR_NODEV = 19,
    NFS3ERR_NOTDIR = 20,
    NFS3ERR_ISDIR = 21,
    NFS3ERR_INVAL = 22,
    NFS3ERR_FBIG = 27,
    NFS3ERR_NOSPC = 28,
    NFS3ERR_ROFS = 30,
    NFS3ERR_MLINK = 31,
    NFS3ERR_NAMETOOLONG = 63,
    NFS3ERR_NOTEMPTY = 66,
    NFS3ERR_DQUOT = 69,
    NFS3ERR_STALE = 70,
    NFS3ERR_REMOTE = 71,
    NFS3ERR_BADHANDLE = 10001,
    NFS3ERR_NOT_SYNC = 10002,
    NFS3ERR_BAD_COOKIE = 10003,
    NFS3ERR_NOTSUPP = 10004,
    NFS3ERR_TOOSMALL = 10005,
    NFS3ERR_SERVERFAULT = 10006,
    NFS3ERR_BADTYPE = 10007,
    NFS3ERR_JUKEBOX = 10008,
}

/// NFSv4 status codes (the subset this server produces).
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Default,
)]
#[allow(non_camel_case_types)]
#[repr(u32)]
pub enum Nfs4Status {
    #[default]
    NFS4_OK = 0,
    NFS4ERR_PERM = 1,
    NFS4ERR_NOENT = 2,
    NFS4ERR_IO = 5,
    NFS4ERR_ACCESS = 13,
    NFS4ERR_EXIST = 17,
    NFS4ERR_XDEV = 18,
    NFS4ERR_NOTDIR = 20,
    NFS4ERR_ISDIR = 21,
    NFS4ERR_INVAL = 22,
    NFS4ERR_FBIG = 27,
    NFS4ERR_NOSPC = 28,
    NFS4ERR_ROFS = 30,
    NFS4ERR_MLINK = 31,
    NFS4ERR_NAMETOOLONG = 63,
    NFS4ERR_NOTEMPTY = 66,
    NFS4ERR_DQUOT = 69,
    NFS4ERR_STALE = 70,
    NFS4ERR_BADHANDLE = 10001,
    NFS4ERR_BAD_COOKIE = 10003,
    NFS4ERR_NOTSUPP = 10004,
    NFS4ERR_TOOSMALL = 10005,
    NFS4ERR_SERVERFAULT = 10006,
    NFS4ERR_BADTYPE = 10007,
    NFS4ERR_DELAY = 10008,
    NFS4ERR_SAME = 10009,
    NFS4ERR_DENIED = 10010,
    NFS4ERR_EXPIRED = 10011,
    NFS4ERR_LOCKED = 10012,
    NFS4ERR_GRACE = 10013,
    NFS4ERR_FHEXPIRED = 10014,
    NFS4ERR_SHARE_DENIED = 10015,
    NFS4ERR_WRONGSEC = 10016,
    NFS4ERR_RESOURCE = 10018,
    NFS4ERR_STALE_CLIENTID = 10022,
    NFS4ERR_STALE_STATEID = 10023,
    NFS4ERR_OLD_STATEID = 10024,
    NFS4ERR_BAD_STATEID = 10025,
    NFS4ERR_BAD_SEQID = 10026,
    NFS4ERR_NOFILEHANDLE = 10020,
    NFS4ERR_BADNAME = 10041,
    NFS4ERR_DEADLOCK = 10045,
    NFS4ERR_BADSESSION = 10052,
    NFS4ERR_BADSLOT = 10053,
    NFS4ERR_OP_NOT_IN_SESSION = 10071,
    NFS4ERR_SEQ_MISORDERED = 10063,
    NFS4ERR_SEQUENCE_POS = 10064,
    NFS4ERR_RETRY_UNCACHED_REP = 10068,
    NFS4ERR_TOO_MANY_OPS = 10070,
}

/// SMB2 NTSTATUS codes (the subset this server produces).
#[allow(missing_docs)]
pub mod ntstatus {
    pub const STATUS_SUCCESS: u32 = 0x0000_0000;
    pub const STATUS_PENDING: u32 = 0x0000_0103;
    pub const STATUS_END_OF_FILE: u32 = 0xC000_0011;
    pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;
    pub const STATUS_INVALID_PARAMETER: u32 = 0xC000_000D;
    pub const STATUS_NO_SUCH_FILE: u32 = 0xC000_000F;
    pub const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
    pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
    pub const STATUS_OBJECT_NAME_INVALID: u32 = 0xC000_0033;
    pub const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
    pub const STATUS_OBJECT_NAME_COLLISION: u32 = 0xC000_0035;
    pub const STATUS_OBJECT_PATH_NOT_FOUND: u32 = 0xC000_003A;
    pub const STATUS_SHARING_VIOLATION: u32 = 0xC000_0043;
    pub const STATUS_LOCK_NOT_GRANTED: u32 = 0xC000_0055;
    pub const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
    pub const STATUS_DISK_FULL: u32 = 0xC000_007F;
    pub const STATUS_MEDIA_WRITE_PROTECTED: u32 = 0xC000_00A2;
    pub const STATUS_IO_TIMEOUT: u32 = 0xC000_00B5;
    pub const STATUS_FILE_IS_A_DIRECTORY: u32 = 0xC000_00BA;
    pub const STATUS_NOT_SUPPORTED: u32 = 0xC000_00BB;
    pub const STATUS_BAD_NETWORK_NAME: u32 = 0xC000_00CC;
    pub const STATUS_DIRECTORY_NOT_EMPTY: u32 = 0xC000_0101;
    pub const STATUS_NOT_A_DIRECTORY: u32 = 0xC000_0103;
    pub const STATUS_CANCELLED: u32 = 0xC000_0120;
    pub const STATUS_NOT_SAME_DEVICE: u32 = 0xC000_00D4;
    pub const STATUS_UNEXPECTED_IO_ERROR: u32 = 0xC000_00E9;
    pub const STATUS_POSSIBLE_DEADLOCK: u32 = 0xC000_0194;
    pub const STATUS_NETWORK_SESSION_EXPIRED: u32 = 0xC000_035C;
    pub const STATUS_USER_SESSION_DELETED: u32 = 0xC000_0203;
    pub const STATUS_NO_MORE_FILES: u32 = 0x8000_0006;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_engine_kinds() {
        assert_eq!(
            EngineError::from_store(StoreError::NotFound),
            EngineError::NoEntry
        );
        assert_eq!(
            EngineError::from_store(StoreError::NotEmpty),
            EngineError::NotEmpty
        );
        assert_eq!(
            EngineError::from_store(StoreError::Io("backend down".into())),
            EngineError::Io
        );
    }

    #[test]
    fn blocked_presents_as_access_denied() {
        assert_eq!(EngineError::Blocked.nfs3(), Nfs3Status::NFS3ERR_ACCES);
        assert_eq!(EngineError::Blocked.nfs4(), Nfs4Status::NFS4ERR_ACCESS);
        assert_eq!(EngineError::Blocked.ntstatus(), ntstatus::STATUS_ACCESS_DENIED);
    }

    #[test]
    fn lock_errors_map_per_protocol() {
        assert_eq!(EngineError::Denied.nfs4(), Nfs4Status::NFS4ERR_DENIED);
        assert_eq!(
            EngineError::Denied.ntstatus(),
            ntstatus::STATUS_LOCK_NOT_GRANTED
        );
        assert_eq!(EngineError::Deadlock.nfs4(), Nfs4Status::NFS4ERR_DEADLOCK);
    }
}
