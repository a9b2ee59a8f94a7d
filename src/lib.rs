//! quayfs - a multi-protocol userspace file server core in Rust
//!
//! This library is the protocol-agnostic engine of a file server that
//! exports logical shares over NFSv3, NFSv4.0, NFSv4.1 and SMB2
//! simultaneously. Each share is backed by two pluggable data planes: a
//! metadata store (directory tree, attributes, inode graph) and a payload
//! store (opaque blobs addressed by content id).
//!
//! ## Main Components
//!
//! - `store`: The store driver traits (`MetaStore`, `PayloadStore`, and
//!   the optional `IncrementalWrite` extension) plus in-memory reference
//!   drivers. Custom backends implement these to become exportable.
//!
//! - `engine`: The protocol-neutral file-system semantics: lookups,
//!   creates, the buffered-write/commit pipeline, byte-range locks,
//!   share-reservation opens, readdir cookies and verifiers, ACLs.
//!
//! - `v4`: NFSv4 integrated state: clients, sessions and their slot
//!   tables, stateids, delegations, the lease reaper.
//!
//! - `dispatch`: Thin per-protocol routers translating decoded wire
//!   operations into engine and v4-state calls, including the MOUNT
//!   exports and the embedded portmapper.
//!
//! - `pseudofs`: The virtual root stitching share junctions into a
//!   single NFSv4 namespace.
//!
//! - `registry` / `settings` / `ident`: the process-wide catalogue of
//!   stores, caches, shares and users; live-reloading tunables; and
//!   principal resolution.
//!
//! - `server`: TCP accept loop, per-connection FIFO workers and
//!   shutdown sequencing behind a pluggable message-codec boundary.
//!
//! Wire codecs (XDR, SMB2 PDUs), Kerberos context handling and concrete
//! non-memory store drivers live outside this crate; the dispatchers
//! consume already-decoded operations.

pub mod acl;
pub mod cache;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handle;
pub mod ident;
pub mod inode;
pub mod pseudofs;
pub mod registry;
pub mod server;
pub mod settings;
pub mod share;
pub mod store;
pub mod v4;
