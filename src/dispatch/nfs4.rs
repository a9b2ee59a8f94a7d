//! NFSv4 compound router (RFC 7530 / RFC 5661).
//!
//! A compound carries a list of decoded operations evaluated against a
//! current filehandle; the first failing operation short-circuits the
//! rest and the partial reply goes back. For v4.1 the leading SEQUENCE
//! operation gates the compound through its session slot, so retransmits
//! are answered with the cached reply object, identical to the original
//! by construction.
//!
//! PUTROOTFH lands in the pseudo-filesystem; LOOKUP walks synthetic
//! directories until it crosses a share junction, at which point the
//! current filehandle refers to the share's real root inode.

use std::sync::Arc;

use tracing::debug;

use crate::dispatch::ServiceContext;
use crate::engine::{
    AccessBits, CreateDisposition, LockKind, LockOwner, LockRange, OpContext, OpenOwner,
    ReadDirEntry, RenameFlags, Stability,
};
use crate::error::{EngineError, Nfs4Status};
use crate::handle::{DecodedHandle, PSEUDO_TAG};
use crate::ident::Credentials;
use crate::inode::{Attrs, DeviceId, InodeId, InodeKind, SetAttrPatch};
use crate::pseudofs::PseudoLookup;
use crate::store::MetaStore;
use crate::v4::{DelegationKind, StateId};

/// OPEN share-access and share-deny bits.
pub const OPEN4_SHARE_ACCESS_READ: u32 = 1;
pub const OPEN4_SHARE_ACCESS_WRITE: u32 = 2;
pub const OPEN4_SHARE_DENY_READ: u32 = 1;
pub const OPEN4_SHARE_DENY_WRITE: u32 = 2;

/// Non-regular object kinds creatable through the v4 CREATE operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateKind4 {
    Directory,
    Symlink { target: String },
    Fifo,
    Socket,
    Char { rdev: DeviceId },
    Block { rdev: DeviceId },
}

/// OPEN creation argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenCreate {
    NoCreate,
    Create { disposition: CreateDisposition, patch: SetAttrPatch },
}

/// Decoded NFSv4 operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Nfs4Op {
    PutRootFh,
    PutFh { fh: Vec<u8> },
    GetFh,
    SaveFh,
    RestoreFh,
    Lookup { name: String },
    Getattr,
    Setattr { stateid: StateId, patch: SetAttrPatch },
    Access { mask: u32 },
    Open {
        owner: Vec<u8>,
        client_id: Option<u64>,
        access: u32,
        deny: u32,
        name: String,
        create: OpenCreate,
    },
    Close { stateid: StateId },
    Read { stateid: StateId, offset: u64, count: u32 },
    Write { stateid: StateId, offset: u64, data: Vec<u8>, stable: Stability },
    Commit { offset: u64, count: u32 },
    Create { name: String, kind: CreateKind4, patch: SetAttrPatch },
    Remove { name: String },
    Rename { src_name: String, dst_name: String },
    Link { name: String },
    Readdir { cookie: u64, verifier: u64, count: u32 },
    Readlink,
    Lock {
        owner: Vec<u8>,
        offset: u64,
        length: u64,
        exclusive: bool,
        blocking: bool,
    },
    Locku { stateid: StateId, offset: u64, length: u64 },
    Lockt { owner: Vec<u8>, offset: u64, length: u64, exclusive: bool },
    DelegReturn { stateid: StateId },
    ExchangeId { owner: Vec<u8>, verifier: u64 },
    CreateSession { client_id: u64, sequence: u32 },
    DestroySession { session: [u8; 16] },
    DestroyClientid { client_id: u64 },
    Sequence { session: [u8; 16], slot: u32, sequence: u32 },
    SetClientId { owner: Vec<u8>, verifier: u64 },
    SetClientIdConfirm { client_id: u64 },
    Renew { client_id: u64 },
    ReclaimComplete,
}

/// One readdir entry in a v4 reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry4 {
    pub name: String,
    pub cookie: u64,
    pub fh: Vec<u8>,
    pub attrs: Attrs,
}

/// Decoded results, one per executed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Nfs4ResOp {
    PutRootFh(Nfs4Status),
    PutFh(Nfs4Status),
    GetFh(Nfs4Status, Option<Vec<u8>>),
    SaveFh(Nfs4Status),
    RestoreFh(Nfs4Status),
    Lookup(Nfs4Status),
    Getattr(Nfs4Status, Option<Attrs>),
    Setattr(Nfs4Status),
    Access { status: Nfs4Status, granted: u32 },
    Open {
        status: Nfs4Status,
        stateid: Option<StateId>,
        delegation: Option<(StateId, DelegationKind)>,
    },
    Close(Nfs4Status),
    Read { status: Nfs4Status, data: Vec<u8>, eof: bool },
    Write { status: Nfs4Status, count: u32, verifier: [u8; 8] },
    Commit { status: Nfs4Status, verifier: [u8; 8] },
    Create(Nfs4Status),
    Remove(Nfs4Status),
    Rename(Nfs4Status),
    Link(Nfs4Status),
    Readdir {
        status: Nfs4Status,
        entries: Vec<DirEntry4>,
        verifier: u64,
        eof: bool,
    },
    Readlink(Nfs4Status, Option<String>),
    Lock { status: Nfs4Status, stateid: Option<StateId> },
    Locku { status: Nfs4Status, stateid: Option<StateId> },
    Lockt { status: Nfs4Status, holder: Option<(u64, u64)> },
    DelegReturn(Nfs4Status),
    ExchangeId { status: Nfs4Status, client_id: u64, boot_instance: u64 },
    CreateSession { status: Nfs4Status, session: Option<[u8; 16]> },
    DestroySession(Nfs4Status),
    DestroyClientid(Nfs4Status),
    Sequence(Nfs4Status),
    SetClientId { status: Nfs4Status, client_id: u64 },
    SetClientIdConfirm(Nfs4Status),
    Renew(Nfs4Status),
    ReclaimComplete(Nfs4Status),
}

impl Nfs4ResOp {
    pub fn status(&self) -> Nfs4Status {
        use Nfs4ResOp::*;
        match self {
            PutRootFh(s) | PutFh(s) | GetFh(s, _) | SaveFh(s) | RestoreFh(s) | Lookup(s)
            | Getattr(s, _) | Setattr(s) | Close(s) | Create(s) | Remove(s) | Rename(s)
            | Link(s) | Readlink(s, _) | DelegReturn(s) | DestroySession(s)
            | DestroyClientid(s) | Sequence(s) | SetClientIdConfirm(s) | Renew(s)
            | ReclaimComplete(s) => *s,
            Access { status, .. }
            | Open { status, .. }
            | Read { status, .. }
            | Write { status, .. }
            | Commit { status, .. }
            | Readdir { status, .. }
            | Lock { status, .. }
            | Locku { status, .. }
            | Lockt { status, .. }
            | ExchangeId { status, .. }
            | CreateSession { status, .. }
            | SetClientId { status, .. } => *status,
        }
    }
}

/// A decoded compound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    pub tag: String,
    pub minor: u32,
    pub ops: Vec<Nfs4Op>,
}

/// A decoded compound reply. Cached per session slot for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundReply {
    pub status: Nfs4Status,
    pub tag: String,
    pub results: Vec<Nfs4ResOp>,
}

struct CompoundState {
    cur: Option<Vec<u8>>,
    saved: Option<Vec<u8>>,
    client: Option<u64>,
}

/// The NFSv4 router.
pub struct Nfs4Dispatcher {
    svc: ServiceContext,
}

impl Nfs4Dispatcher {
    pub fn new(svc: ServiceContext) -> Nfs4Dispatcher {
        Nfs4Dispatcher { svc }
    }

    /// Processes one compound.
    pub async fn handle(&self, creds: &Credentials, compound: Compound) -> Arc<CompoundReply> {
        let settings = self.svc.settings.current();
        if compound.ops.len() > settings.max_compound_ops {
            return Arc::new(CompoundReply {
                status: Nfs4Status::NFS4ERR_TOO_MANY_OPS,
                tag: compound.tag.clone(),
                results: Vec::new(),
            });
        }
        if compound.minor == 0 {
            let reply = self.run(creds, &compound, None, 0).await;
            return Arc::new(reply);
        }

        // v4.1: the compound is gated by its leading SEQUENCE
        match compound.ops.first() {
            Some(Nfs4Op::Sequence { session, slot, sequence }) => {
                let Some(sess) = self.svc.v4.session(session) else {
                    return Arc::new(CompoundReply {
                        status: Nfs4Status::NFS4ERR_BADSESSION,
                        tag: compound.tag.clone(),
                        results: vec![Nfs4ResOp::Sequence(Nfs4Status::NFS4ERR_BADSESSION)],
                    });
                };
                match sess.begin(*slot as usize, *sequence) {
                    Err(status) => Arc::new(CompoundReply {
                        status,
                        tag: compound.tag.clone(),
                        results: vec![Nfs4ResOp::Sequence(status)],
                    }),
                    Ok(crate::v4::SlotCall::Replay(reply)) => {
                        debug!(slot = *slot, sequence = *sequence, "slot replay");
                        reply
                    }
                    Ok(crate::v4::SlotCall::Proceed) => {
                        let _ = self.svc.v4.renew_client(sess.client);
                        let reply =
                            Arc::new(self.run(creds, &compound, Some(sess.client), 1).await);
                        sess.complete(*slot as usize, *sequence, reply.clone());
                        reply
                    }
                }
            }
            // session management ops run outside a session
            Some(
                Nfs4Op::ExchangeId { .. }
                | Nfs4Op::CreateSession { .. }
                | Nfs4Op::DestroySession { .. }
                | Nfs4Op::DestroyClientid { .. },
            ) => Arc::new(self.run(creds, &compound, None, 0).await),
            _ => Arc::new(CompoundReply {
                status: Nfs4Status::NFS4ERR_OP_NOT_IN_SESSION,
                tag: compound.tag.clone(),
                results: Vec::new(),
            }),
        }
    }

    async fn run(
        &self,
        creds: &Credentials,
        compound: &Compound,
        client: Option<u64>,
        skip: usize,
    ) -> CompoundReply {
        let mut state = CompoundState { cur: None, saved: None, client };
        let mut results = Vec::with_capacity(compound.ops.len());
        if skip == 1 {
            results.push(Nfs4ResOp::Sequence(Nfs4Status::NFS4_OK));
        }
        let mut status = Nfs4Status::NFS4_OK;
        for op in compound.ops.iter().skip(skip) {
            let result = self.exec(creds, op, &mut state).await;
            let op_status = result.status();
            results.push(result);
            if op_status != Nfs4Status::NFS4_OK {
                status = op_status;
                break;
            }
        }
        CompoundReply { status, tag: compound.tag.clone(), results }
    }

    fn decode_cur(&self, state: &CompoundState) -> Result<DecodedHandle, Nfs4Status> {
        let fh = state.cur.as_ref().ok_or(Nfs4Status::NFS4ERR_NOFILEHANDLE)?;
        self.svc.handles.decode(fh).map_err(|e| e.nfs4())
    }

    /// Operation context for the current filehandle; fails on pseudo-fs
    /// handles (which only support the read-only subset).
    fn real_ctx(
        &self,
        creds: &Credentials,
        state: &CompoundState,
    ) -> Result<(OpContext, InodeId), Nfs4Status> {
        let decoded = self.decode_cur(state)?;
        if decoded.is_pseudo() {
            return Err(Nfs4Status::NFS4ERR_ROFS);
        }
        let mut ctx = self.svc.op_context(creds, &decoded).map_err(|e| e.nfs4())?;
        if let Some(client) = state.client {
            ctx = ctx.with_client(client);
        }
        Ok((ctx, decoded.inode))
    }

    async fn exec(
        &self,
        creds: &Credentials,
        op: &Nfs4Op,
        state: &mut CompoundState,
    ) -> Nfs4ResOp {
        match op {
            Nfs4Op::PutRootFh => {
                state.cur = Some(self.svc.handles.encode(PSEUDO_TAG, InodeId(0)));
                Nfs4ResOp::PutRootFh(Nfs4Status::NFS4_OK)
            }
            Nfs4Op::PutFh { fh } => match self.svc.handles.decode(fh) {
                Ok(_) => {
                    state.cur = Some(fh.clone());
                    Nfs4ResOp::PutFh(Nfs4Status::NFS4_OK)
                }
                Err(err) => Nfs4ResOp::PutFh(err.nfs4()),
            },
            Nfs4Op::GetFh => match &state.cur {
                Some(fh) => Nfs4ResOp::GetFh(Nfs4Status::NFS4_OK, Some(fh.clone())),
                None => Nfs4ResOp::GetFh(Nfs4Status::NFS4ERR_NOFILEHANDLE, None),
            },
            Nfs4Op::SaveFh => {
                if state.cur.is_none() {
                    return Nfs4ResOp::SaveFh(Nfs4Status::NFS4ERR_NOFILEHANDLE);
                }
                state.saved = state.cur.clone();
                Nfs4ResOp::SaveFh(Nfs4Status::NFS4_OK)
            }
            Nfs4Op::RestoreFh => match &state.saved {
                Some(fh) => {
                    state.cur = Some(fh.clone());
                    Nfs4ResOp::RestoreFh(Nfs4Status::NFS4_OK)
                }
                None => Nfs4ResOp::RestoreFh(Nfs4Status::NFS4ERR_NOFILEHANDLE),
            },
            Nfs4Op::Lookup { name } => self.lookup(creds, name, state).await,
            Nfs4Op::Getattr => self.getattr(creds, state).await,
            Nfs4Op::Setattr { patch, .. } => match self.real_ctx(creds, state) {
                Ok((ctx, id)) => match self.svc.engine.set_attr(&ctx, id, patch).await {
                    Ok(_) => Nfs4ResOp::Setattr(Nfs4Status::NFS4_OK),
                    Err(err) => Nfs4ResOp::Setattr(err.nfs4()),
                },
                Err(status) => Nfs4ResOp::Setattr(status),
            },
            Nfs4Op::Access { mask } => self.access(creds, *mask, state).await,
            Nfs4Op::Open { owner, client_id, access, deny, name, create } => {
                self.open(creds, state, owner, *client_id, *access, *deny, name, create).await
            }
            Nfs4Op::Close { stateid } => self.close(creds, stateid).await,
            Nfs4Op::Read { stateid, offset, count } => {
                self.read(creds, state, stateid, *offset, *count).await
            }
            Nfs4Op::Write { stateid, offset, data, stable } => {
                self.write(creds, state, stateid, *offset, data, *stable).await
            }
            Nfs4Op::Commit { .. } => match self.real_ctx(creds, state) {
                Ok((ctx, id)) => match self.svc.engine.commit(&ctx, id).await {
                    Ok(verifier) => {
                        Nfs4ResOp::Commit { status: Nfs4Status::NFS4_OK, verifier }
                    }
                    Err(err) => Nfs4ResOp::Commit { status: err.nfs4(), verifier: [0; 8] },
                },
                Err(status) => Nfs4ResOp::Commit { status, verifier: [0; 8] },
            },
            Nfs4Op::Create { name, kind, patch } => {
                self.create(creds, state, name, kind, patch).await
            }
            Nfs4Op::Remove { name } => self.remove(creds, state, name).await,
            Nfs4Op::Rename { src_name, dst_name } => {
                self.rename(creds, state, src_name, dst_name).await
            }
            Nfs4Op::Link { name } => self.link(creds, state, name).await,
            Nfs4Op::Readdir { cookie, verifier, count } => {
                self.readdir(creds, state, *cookie, *verifier, *count).await
            }
            Nfs4Op::Readlink => match self.real_ctx(creds, state) {
                Ok((ctx, id)) => match self.svc.engine.readlink(&ctx, id).await {
                    Ok(target) => Nfs4ResOp::Readlink(Nfs4Status::NFS4_OK, Some(target)),
                    Err(err) => Nfs4ResOp::Readlink(err.nfs4(), None),
                },
                Err(status) => Nfs4ResOp::Readlink(status, None),
            },
            Nfs4Op::Lock { owner, offset, length, exclusive, blocking } => {
                self.lock(creds, state, owner, *offset, *length, *exclusive, *blocking).await
            }
            Nfs4Op::Locku { stateid, offset, length } => {
                self.locku(creds, state, stateid, *offset, *length).await
            }
            Nfs4Op::Lockt { owner, offset, length, exclusive } => {
                self.lockt(creds, state, owner, *offset, *length, *exclusive).await
            }
            Nfs4Op::DelegReturn { stateid } => match self.svc.v4.delegreturn(stateid) {
                Ok(()) => Nfs4ResOp::DelegReturn(Nfs4Status::NFS4_OK),
                Err(status) => Nfs4ResOp::DelegReturn(status),
            },
            Nfs4Op::ExchangeId { owner, verifier } => {
                match self.svc.v4.exchange_id(owner, *verifier) {
                    Ok(result) => Nfs4ResOp::ExchangeId {
                        status: Nfs4Status::NFS4_OK,
                        client_id: result.client_id,
                        boot_instance: self.svc.v4.boot_instance(),
                    },
                    Err(status) => Nfs4ResOp::ExchangeId {
                        status,
                        client_id: 0,
                        boot_instance: self.svc.v4.boot_instance(),
                    },
                }
            }
            Nfs4Op::CreateSession { client_id, sequence } => {
                match self.svc.v4.create_session(*client_id, *sequence) {
                    Ok(session) => Nfs4ResOp::CreateSession {
                        status: Nfs4Status::NFS4_OK,
                        session: Some(session),
                    },
                    Err(status) => Nfs4ResOp::CreateSession { status, session: None },
                }
            }
            Nfs4Op::DestroySession { session } => {
                match self.svc.v4.destroy_session(session) {
                    Ok(()) => Nfs4ResOp::DestroySession(Nfs4Status::NFS4_OK),
                    Err(status) => Nfs4ResOp::DestroySession(status),
                }
            }
            Nfs4Op::DestroyClientid { client_id } => {
                match self.svc.v4.destroy_client(*client_id) {
                    Ok(()) => Nfs4ResOp::DestroyClientid(Nfs4Status::NFS4_OK),
                    Err(status) => Nfs4ResOp::DestroyClientid(status),
                }
            }
            // a SEQUENCE anywhere but first is a protocol error
            Nfs4Op::Sequence { .. } => {
                Nfs4ResOp::Sequence(Nfs4Status::NFS4ERR_SEQUENCE_POS)
            }
            Nfs4Op::SetClientId { owner, verifier } => {
                match self.svc.v4.exchange_id(owner, *verifier) {
                    Ok(result) => {
                        state.client = Some(result.client_id);
                        Nfs4ResOp::SetClientId {
                            status: Nfs4Status::NFS4_OK,
                            client_id: result.client_id,
                        }
                    }
                    Err(status) => Nfs4ResOp::SetClientId { status, client_id: 0 },
                }
            }
            Nfs4Op::SetClientIdConfirm { client_id } => {
                match self.svc.v4.confirm_client(*client_id) {
                    Ok(()) => {
                        state.client = Some(*client_id);
                        Nfs4ResOp::SetClientIdConfirm(Nfs4Status::NFS4_OK)
                    }
                    Err(status) => Nfs4ResOp::SetClientIdConfirm(status),
                }
            }
            Nfs4Op::Renew { client_id } => match self.svc.v4.renew_client(*client_id) {
                Ok(()) => Nfs4ResOp::Renew(Nfs4Status::NFS4_OK),
                Err(status) => Nfs4ResOp::Renew(status),
            },
            Nfs4Op::ReclaimComplete => Nfs4ResOp::ReclaimComplete(Nfs4Status::NFS4_OK),
        }
    }

    async fn lookup(
        &self,
        creds: &Credentials,
        name: &str,
        state: &mut CompoundState,
    ) -> Nfs4ResOp {
        let decoded = match self.decode_cur(state) {
            Ok(d) => d,
            Err(status) => return Nfs4ResOp::Lookup(status),
        };
        if decoded.is_pseudo() {
            let pseudo = self.svc.registry.pseudofs();
            return match pseudo.lookup(decoded.inode.0 as u64, name) {
                Some(PseudoLookup::Directory(node)) => {
                    state.cur = Some(self.svc.handles.encode(PSEUDO_TAG, InodeId(node as u128)));
                    Nfs4ResOp::Lookup(Nfs4Status::NFS4_OK)
                }
                Some(PseudoLookup::Junction(share_name)) => {
                    // crossing: the filehandle now names the share's root
                    match self.svc.op_context_for_share(creds, &share_name) {
                        Ok(ctx) => match ctx.share.meta.root().await {
                            Ok(root) => {
                                state.cur =
                                    Some(self.svc.handles.encode(ctx.share.tag, root));
                                Nfs4ResOp::Lookup(Nfs4Status::NFS4_OK)
                            }
                            Err(err) => {
                                Nfs4ResOp::Lookup(EngineError::from_store(err).nfs4())
                            }
                        },
                        Err(err) => Nfs4ResOp::Lookup(err.nfs4()),
                    }
                }
                None => Nfs4ResOp::Lookup(Nfs4Status::NFS4ERR_NOENT),
            };
        }
        match self.real_ctx(creds, state) {
            Ok((ctx, dir)) => match self.svc.engine.lookup(&ctx, dir, name).await {
                Ok((id, _attrs)) => {
                    state.cur = Some(self.svc.handles.encode(ctx.share.tag, id));
                    Nfs4ResOp::Lookup(Nfs4Status::NFS4_OK)
                }
                Err(err) => Nfs4ResOp::Lookup(err.nfs4()),
            },
            Err(status) => Nfs4ResOp::Lookup(status),
        }
    }

    async fn getattr(&self, creds: &Credentials, state: &mut CompoundState) -> Nfs4ResOp {
        let decoded = match self.decode_cur(state) {
            Ok(d) => d,
            Err(status) => return Nfs4ResOp::Getattr(status, None),
        };
        if decoded.is_pseudo() {
            let pseudo = self.svc.registry.pseudofs();
            return match pseudo.attrs(decoded.inode.0 as u64) {
                Some(attrs) => Nfs4ResOp::Getattr(Nfs4Status::NFS4_OK, Some(attrs)),
                None => Nfs4ResOp::Getattr(Nfs4Status::NFS4ERR_STALE, None),
            };
        }
        match self.real_ctx(creds, state) {
            Ok((ctx, id)) => match self.svc.engine.get_attr(&ctx, id).await {
                Ok(attrs) => Nfs4ResOp::Getattr(Nfs4Status::NFS4_OK, Some(attrs)),
                Err(err) => Nfs4ResOp::Getattr(err.nfs4(), None),
            },
            Err(status) => Nfs4ResOp::Getattr(status, None),
        }
    }

    async fn access(
        &self,
        creds: &Credentials,
        mask: u32,
        state: &mut CompoundState,
    ) -> Nfs4ResOp {
        let decoded = match self.decode_cur(state) {
            Ok(d) => d,
            Err(status) => return Nfs4ResOp::Access { status, granted: 0 },
        };
        if decoded.is_pseudo() {
            return Nfs4ResOp::Access {
                status: Nfs4Status::NFS4_OK,
                granted: mask & (super::nfs3::ACCESS3_READ | super::nfs3::ACCESS3_LOOKUP),
            };
        }
        match self.real_ctx(creds, state) {
            Ok((ctx, _)) => {
                let mut granted = 0;
                if ctx.permission.allows_read() {
                    granted |= mask
                        & (super::nfs3::ACCESS3_READ
                            | super::nfs3::ACCESS3_LOOKUP
                            | super::nfs3::ACCESS3_EXECUTE);
                }
                if ctx.permission.allows_write() && !ctx.share.config.read_only {
                    granted |= mask
                        & (super::nfs3::ACCESS3_MODIFY
                            | super::nfs3::ACCESS3_EXTEND
                            | super::nfs3::ACCESS3_DELETE);
                }
                Nfs4ResOp::Access { status: Nfs4Status::NFS4_OK, granted }
            }
            Err(status) => Nfs4ResOp::Access { status, granted: 0 },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn open(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        owner: &[u8],
        op_client: Option<u64>,
        access: u32,
        deny: u32,
        name: &str,
        create: &OpenCreate,
    ) -> Nfs4ResOp {
        let client = match state.client.or(op_client) {
            Some(c) => c,
            None => {
                return Nfs4ResOp::Open {
                    status: Nfs4Status::NFS4ERR_STALE_CLIENTID,
                    stateid: None,
                    delegation: None,
                }
            }
        };
        let (ctx, dir) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => {
                return Nfs4ResOp::Open { status, stateid: None, delegation: None }
            }
        };
        let ctx = ctx.with_client(client);
        let resolved = match create {
            OpenCreate::Create { disposition, patch } => {
                self.svc.engine.create(&ctx, dir, name, patch, disposition.clone()).await
            }
            OpenCreate::NoCreate => self.svc.engine.lookup(&ctx, dir, name).await,
        };
        let (id, _attrs) = match resolved {
            Ok(v) => v,
            Err(err) => {
                return Nfs4ResOp::Open { status: err.nfs4(), stateid: None, delegation: None }
            }
        };
        let file = ctx.file(id);
        let want_write = access & OPEN4_SHARE_ACCESS_WRITE != 0;

        // recall conflicting delegations before taking the open
        if let Err(status) = self
            .svc
            .v4
            .resolve_delegation_conflicts(file, Some(client), want_write)
            .await
        {
            return Nfs4ResOp::Open { status, stateid: None, delegation: None };
        }

        let open_owner = OpenOwner { client, owner: owner.to_vec() };
        let open = match self
            .svc
            .engine
            .open(&ctx, id, open_owner, AccessBits(access as u8), AccessBits(deny as u8))
            .await
        {
            Ok(open) => open,
            Err(err) => {
                return Nfs4ResOp::Open { status: err.nfs4(), stateid: None, delegation: None }
            }
        };
        let stateid = self.svc.v4.register_open(client, owner, file, open.id);
        let delegation = self.svc.v4.maybe_grant_delegation(file, client, want_write);
        state.cur = Some(self.svc.handles.encode(ctx.share.tag, id));
        Nfs4ResOp::Open { status: Nfs4Status::NFS4_OK, stateid: Some(stateid), delegation }
    }

    async fn close(&self, creds: &Credentials, stateid: &StateId) -> Nfs4ResOp {
        let rec = match self.svc.v4.remove_open(stateid) {
            Ok(rec) => rec,
            Err(status) => return Nfs4ResOp::Close(status),
        };
        let decoded = DecodedHandle { share_tag: rec.file.share, inode: rec.file.inode };
        match self.svc.op_context(creds, &decoded) {
            Ok(ctx) => {
                let ctx = ctx.with_client(rec.client);
                match self.svc.engine.close(&ctx, rec.engine_open).await {
                    Ok(()) => Nfs4ResOp::Close(Nfs4Status::NFS4_OK),
                    Err(err) => Nfs4ResOp::Close(err.nfs4()),
                }
            }
            Err(err) => Nfs4ResOp::Close(err.nfs4()),
        }
    }

    async fn read(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        stateid: &StateId,
        offset: u64,
        count: u32,
    ) -> Nfs4ResOp {
        let (ctx, id) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => {
                return Nfs4ResOp::Read { status, data: Vec::new(), eof: false }
            }
        };
        if !stateid.is_special() {
            if let Err(status) = self.svc.v4.lookup_open(stateid) {
                return Nfs4ResOp::Read { status, data: Vec::new(), eof: false };
            }
        }
        let count = count.min(self.svc.settings.current().max_read_size);
        match self.svc.engine.read(&ctx, id, offset, count as usize).await {
            Ok((data, eof)) => Nfs4ResOp::Read { status: Nfs4Status::NFS4_OK, data, eof },
            Err(err) => Nfs4ResOp::Read { status: err.nfs4(), data: Vec::new(), eof: false },
        }
    }

    async fn write(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        stateid: &StateId,
        offset: u64,
        data: &[u8],
        stable: Stability,
    ) -> Nfs4ResOp {
        let (ctx, id) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Write { status, count: 0, verifier: [0; 8] },
        };
        if data.len() as u32 > self.svc.settings.current().max_write_size {
            return Nfs4ResOp::Write {
                status: Nfs4Status::NFS4ERR_FBIG,
                count: 0,
                verifier: [0; 8],
            };
        }
        if !stateid.is_special() {
            if let Err(status) = self.svc.v4.lookup_open(stateid) {
                return Nfs4ResOp::Write { status, count: 0, verifier: [0; 8] };
            }
        }
        match self.svc.engine.write(&ctx, id, offset, data, stable).await {
            Ok((count, verifier)) => {
                Nfs4ResOp::Write { status: Nfs4Status::NFS4_OK, count, verifier }
            }
            Err(err) => Nfs4ResOp::Write { status: err.nfs4(), count: 0, verifier: [0; 8] },
        }
    }

    async fn create(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        name: &str,
        kind: &CreateKind4,
        patch: &SetAttrPatch,
    ) -> Nfs4ResOp {
        let (ctx, dir) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Create(status),
        };
        let created = match kind {
            CreateKind4::Directory => self.svc.engine.mkdir(&ctx, dir, name, patch).await,
            CreateKind4::Symlink { target } => {
                self.svc.engine.symlink(&ctx, dir, name, target, patch).await
            }
            CreateKind4::Fifo => {
                self.svc.engine.mknod(&ctx, dir, name, InodeKind::Fifo, None, patch).await
            }
            CreateKind4::Socket => {
                self.svc.engine.mknod(&ctx, dir, name, InodeKind::Socket, None, patch).await
            }
            CreateKind4::Char { rdev } => {
                self.svc
                    .engine
                    .mknod(&ctx, dir, name, InodeKind::CharDevice, Some(*rdev), patch)
                    .await
            }
            CreateKind4::Block { rdev } => {
                self.svc
                    .engine
                    .mknod(&ctx, dir, name, InodeKind::BlockDevice, Some(*rdev), patch)
                    .await
            }
        };
        match created {
            Ok((id, _attrs)) => {
                state.cur = Some(self.svc.handles.encode(ctx.share.tag, id));
                Nfs4ResOp::Create(Nfs4Status::NFS4_OK)
            }
            Err(err) => Nfs4ResOp::Create(err.nfs4()),
        }
    }

    async fn remove(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        name: &str,
    ) -> Nfs4ResOp {
        let (ctx, dir) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Remove(status),
        };
        // v4 REMOVE covers both files and directories
        let is_rmdir = match self.svc.engine.lookup(&ctx, dir, name).await {
            Ok((_, attrs)) => attrs.kind == InodeKind::Directory,
            Err(err) => return Nfs4ResOp::Remove(err.nfs4()),
        };
        match self.svc.engine.remove(&ctx, dir, name, is_rmdir).await {
            Ok(()) => Nfs4ResOp::Remove(Nfs4Status::NFS4_OK),
            Err(err) => Nfs4ResOp::Remove(err.nfs4()),
        }
    }

    async fn rename(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        src_name: &str,
        dst_name: &str,
    ) -> Nfs4ResOp {
        let Some(saved) = state.saved.clone() else {
            return Nfs4ResOp::Rename(Nfs4Status::NFS4ERR_NOFILEHANDLE);
        };
        let src = match self.svc.handles.decode(&saved) {
            Ok(d) => d,
            Err(err) => return Nfs4ResOp::Rename(err.nfs4()),
        };
        let (ctx, dst_dir) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Rename(status),
        };
        if src.share_tag != ctx.share.tag {
            return Nfs4ResOp::Rename(EngineError::CrossShare.nfs4());
        }
        match self
            .svc
            .engine
            .rename(&ctx, src.inode, src_name, dst_dir, dst_name, RenameFlags::default())
            .await
        {
            Ok(()) => Nfs4ResOp::Rename(Nfs4Status::NFS4_OK),
            Err(err) => Nfs4ResOp::Rename(err.nfs4()),
        }
    }

    async fn link(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        name: &str,
    ) -> Nfs4ResOp {
        let Some(saved) = state.saved.clone() else {
            return Nfs4ResOp::Link(Nfs4Status::NFS4ERR_NOFILEHANDLE);
        };
        let src = match self.svc.handles.decode(&saved) {
            Ok(d) => d,
            Err(err) => return Nfs4ResOp::Link(err.nfs4()),
        };
        let (ctx, dir) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Link(status),
        };
        if src.share_tag != ctx.share.tag {
            return Nfs4ResOp::Link(EngineError::CrossShare.nfs4());
        }
        match self.svc.engine.link(&ctx, src.inode, dir, name).await {
            Ok(_) => Nfs4ResOp::Link(Nfs4Status::NFS4_OK),
            Err(err) => Nfs4ResOp::Link(err.nfs4()),
        }
    }

    async fn readdir(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        cookie: u64,
        verifier: u64,
        count: u32,
    ) -> Nfs4ResOp {
        let decoded = match self.decode_cur(state) {
            Ok(d) => d,
            Err(status) => {
                return Nfs4ResOp::Readdir {
                    status,
                    entries: Vec::new(),
                    verifier: 0,
                    eof: false,
                }
            }
        };
        if decoded.is_pseudo() {
            let pseudo = self.svc.registry.pseudofs();
            let entries: Vec<DirEntry4> = pseudo
                .readdir(decoded.inode.0 as u64)
                .into_iter()
                .enumerate()
                .skip(cookie as usize)
                .map(|(i, e)| DirEntry4 {
                    name: e.name,
                    cookie: i as u64 + 1,
                    fh: self.svc.handles.encode(PSEUDO_TAG, InodeId(e.node as u128)),
                    attrs: pseudo.attrs(e.node).unwrap_or_else(|| {
                        Attrs::new(InodeKind::Directory, 0o555, 0, 0)
                    }),
                })
                .collect();
            return Nfs4ResOp::Readdir {
                status: Nfs4Status::NFS4_OK,
                entries,
                verifier: 0,
                eof: true,
            };
        }
        let (ctx, dir) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => {
                return Nfs4ResOp::Readdir {
                    status,
                    entries: Vec::new(),
                    verifier: 0,
                    eof: false,
                }
            }
        };
        let limit = (count as usize).clamp(1, 4096);
        let presented = (cookie != 0).then_some(verifier);
        match self.svc.engine.readdir(&ctx, dir, cookie, presented, limit).await {
            Ok(page) => Nfs4ResOp::Readdir {
                status: Nfs4Status::NFS4_OK,
                entries: page
                    .entries
                    .iter()
                    .map(|e: &ReadDirEntry| DirEntry4 {
                        name: e.name.clone(),
                        cookie: e.cookie,
                        fh: self.svc.handles.encode(ctx.share.tag, e.id),
                        attrs: e.attrs.clone(),
                    })
                    .collect(),
                verifier: page.verifier,
                eof: page.eof,
            },
            Err(err) => Nfs4ResOp::Readdir {
                status: err.nfs4(),
                entries: Vec::new(),
                verifier: 0,
                eof: false,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn lock(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        owner: &[u8],
        offset: u64,
        length: u64,
        exclusive: bool,
        blocking: bool,
    ) -> Nfs4ResOp {
        let Some(client) = state.client else {
            return Nfs4ResOp::Lock {
                status: Nfs4Status::NFS4ERR_STALE_CLIENTID,
                stateid: None,
            };
        };
        let (ctx, id) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Lock { status, stateid: None },
        };
        let lock_owner = LockOwner { client, owner: owner.to_vec() };
        let kind = if exclusive { LockKind::Exclusive } else { LockKind::Shared };
        match self
            .svc
            .engine
            .lock(&ctx, id, &lock_owner, LockRange::new(offset, length), kind, blocking)
            .await
        {
            Ok(()) => {
                let stateid = self.svc.v4.register_lock(client, owner, ctx.file(id));
                Nfs4ResOp::Lock { status: Nfs4Status::NFS4_OK, stateid: Some(stateid) }
            }
            Err(err) => Nfs4ResOp::Lock { status: err.nfs4(), stateid: None },
        }
    }

    async fn locku(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        stateid: &StateId,
        offset: u64,
        length: u64,
    ) -> Nfs4ResOp {
        let rec = match self.svc.v4.lookup_lock(stateid) {
            Ok(rec) => rec,
            Err(status) => return Nfs4ResOp::Locku { status, stateid: None },
        };
        let (ctx, id) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Locku { status, stateid: None },
        };
        let owner = LockOwner { client: rec.client, owner: rec.owner.clone() };
        self.svc.engine.unlock(&ctx, id, &owner, LockRange::new(offset, length));
        let bumped = self.svc.v4.register_lock(rec.client, &rec.owner, rec.file);
        Nfs4ResOp::Locku { status: Nfs4Status::NFS4_OK, stateid: Some(bumped) }
    }

    async fn lockt(
        &self,
        creds: &Credentials,
        state: &mut CompoundState,
        owner: &[u8],
        offset: u64,
        length: u64,
        exclusive: bool,
    ) -> Nfs4ResOp {
        let (ctx, id) = match self.real_ctx(creds, state) {
            Ok(v) => v,
            Err(status) => return Nfs4ResOp::Lockt { status, holder: None },
        };
        let lock_owner = LockOwner { client: state.client.unwrap_or(0), owner: owner.to_vec() };
        let kind = if exclusive { LockKind::Exclusive } else { LockKind::Shared };
        match self
            .svc
            .engine
            .lock_test(&ctx, id, &lock_owner, LockRange::new(offset, length), kind)
        {
            Some(holder) => Nfs4ResOp::Lockt {
                status: Nfs4Status::NFS4ERR_DENIED,
                holder: Some((holder.range.start, holder.range.end)),
            },
            None => Nfs4ResOp::Lockt { status: Nfs4Status::NFS4_OK, holder: None },
        }
    }
}
