//! Opaque filehandle codec.
//!
//! A filehandle packs the server's boot nonce, the share tag assigned by
//! the registry and the 128-bit inode id, big-endian. The boot nonce makes
//! every handle from a previous server instance decode as stale, which is
//! exactly the client-visible contract: v4 state is memory-only and a
//! restart invalidates the world. Share tag 0 is reserved for the
//! pseudo-filesystem.
//!
//! 32 bytes fits every protocol's limit (64 for NFSv3, 128 for NFSv4).

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{EngineError, EngineResult};
use crate::inode::InodeId;

/// Encoded filehandle length.
pub const HANDLE_LEN: usize = 32;

/// Share tag reserved for pseudo-filesystem nodes.
pub const PSEUDO_TAG: u64 = 0;

/// A decoded filehandle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DecodedHandle {
    pub share_tag: u64,
    pub inode: InodeId,
}

impl DecodedHandle {
    pub fn is_pseudo(&self) -> bool {
        self.share_tag == PSEUDO_TAG
    }
}

/// Stateless handle codec bound to this boot instance.
#[derive(Debug, Clone, Copy)]
pub struct HandleCodec {
    boot: u64,
}

impl HandleCodec {
    pub fn new(boot: u64) -> HandleCodec {
        HandleCodec { boot }
    }

    /// The boot-instance nonce baked into every handle.
    pub fn boot_instance(&self) -> u64 {
        self.boot
    }

    pub fn encode(&self, share_tag: u64, inode: InodeId) -> Vec<u8> {
        let mut out = Vec::with_capacity(HANDLE_LEN);
        // infallible: writing to a Vec
        let _ = out.write_u64::<BigEndian>(self.boot);
        let _ = out.write_u64::<BigEndian>(share_tag);
        let _ = out.write_u128::<BigEndian>(inode.0);
        out
    }

    pub fn decode(&self, bytes: &[u8]) -> EngineResult<DecodedHandle> {
        if bytes.len() != HANDLE_LEN {
            return Err(EngineError::StaleHandle);
        }
        let mut cursor = Cursor::new(bytes);
        let boot = cursor.read_u64::<BigEndian>().map_err(|_| EngineError::StaleHandle)?;
        let share_tag = cursor.read_u64::<BigEndian>().map_err(|_| EngineError::StaleHandle)?;
        let inode = cursor.read_u128::<BigEndian>().map_err(|_| EngineError::StaleHandle)?;
        if boot != self.boot {
            return Err(EngineError::StaleHandle);
        }
        Ok(DecodedHandle { share_tag, inode: InodeId(inode) })
    }
}
