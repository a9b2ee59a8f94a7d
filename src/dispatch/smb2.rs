//! SMB2 command router (dialects 2.0.2 and 2.1).
//!
//! Enough of the protocol for basic file operations: negotiate, a
//! challenge/response session setup bound to the stored password hash,
//! tree connects mapping share names, create/read/write/close,
//! directory enumeration, query/set info and byte-range locks. Opens go
//! through the same engine open table as NFSv4, so share-mode (deny)
//! semantics hold across protocols.
//!
//! SMB sessions are protocol clients in the engine's eyes; their ids are
//! tagged into a separate namespace so they never collide with NFSv4
//! client ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::dispatch::ServiceContext;
use crate::engine::{
    AccessBits, CreateDisposition, LockKind, LockOwner, LockRange, OpContext, OpenOwner,
    Stability,
};
use crate::error::{ntstatus, EngineError};
use crate::ident::Credentials;
use crate::inode::{Attrs, InodeId, InodeKind, SetAttrPatch};
use crate::store::MetaStore;

/// Supported dialect revisions.
pub const DIALECT_202: u16 = 0x0202;
pub const DIALECT_210: u16 = 0x0210;

/// FILE_SHARE_* bits from the CREATE request.
pub const FILE_SHARE_READ: u32 = 1;
pub const FILE_SHARE_WRITE: u32 = 2;

/// Desired-access bits (collapsed to read/write).
pub const ACCESS_READ: u32 = 1;
pub const ACCESS_WRITE: u32 = 2;

/// High bit marking SMB sessions in the engine's client-id space.
const SMB_CLIENT_TAG: u64 = 1 << 63;

/// CREATE disposition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SmbCreateDisposition {
    /// FILE_OPEN: fail if absent.
    Open,
    /// FILE_CREATE: fail if present.
    Create,
    /// FILE_OPEN_IF: open or create.
    OpenIf,
    /// FILE_OVERWRITE_IF: open-or-create, truncating.
    OverwriteIf,
}

/// Decoded SMB2 requests.
#[derive(Debug, Clone)]
pub enum Smb2Request {
    Negotiate { dialects: Vec<u16> },
    /// First call carries no proof and receives the session challenge;
    /// the second call proves knowledge of the password hash.
    SessionSetup { session: Option<u64>, user: String, proof: Option<[u8; 32]> },
    Logoff { session: u64 },
    TreeConnect { session: u64, path: String },
    TreeDisconnect { session: u64, tree: u32 },
    Create {
        session: u64,
        tree: u32,
        path: String,
        access: u32,
        share_access: u32,
        disposition: SmbCreateDisposition,
    },
    Close { session: u64, file: u64 },
    Read { session: u64, file: u64, offset: u64, count: u32 },
    Write { session: u64, file: u64, offset: u64, data: Vec<u8> },
    Flush { session: u64, file: u64 },
    QueryDirectory { session: u64, file: u64, restart: bool },
    QueryInfo { session: u64, file: u64 },
    SetInfo { session: u64, file: u64, patch: SetAttrPatch },
    Lock {
        session: u64,
        file: u64,
        offset: u64,
        length: u64,
        exclusive: bool,
        fail_immediately: bool,
    },
    Unlock { session: u64, file: u64, offset: u64, length: u64 },
    Echo,
}

/// Decoded SMB2 replies; `status` is an NTSTATUS value.
#[derive(Debug, Clone, PartialEq)]
pub enum Smb2Reply {
    Negotiate { status: u32, dialect: u16 },
    SessionSetup { status: u32, session: u64, challenge: Option<[u8; 8]> },
    Logoff { status: u32 },
    TreeConnect { status: u32, tree: u32 },
    TreeDisconnect { status: u32 },
    Create { status: u32, file: u64, attrs: Option<Attrs> },
    Close { status: u32 },
    Read { status: u32, data: Vec<u8>, eof: bool },
    Write { status: u32, count: u32 },
    Flush { status: u32 },
    QueryDirectory { status: u32, entries: Vec<(String, Attrs)> },
    QueryInfo { status: u32, attrs: Option<Attrs> },
    SetInfo { status: u32 },
    Lock { status: u32 },
    Unlock { status: u32 },
    Echo { status: u32 },
}

struct SmbFile {
    share_tag: u64,
    inode: InodeId,
    engine_open: u64,
    /// Directory enumeration cursor: (cookie, verifier, exhausted).
    dir_cursor: (u64, u64, bool),
    is_dir: bool,
}

struct SmbSession {
    id: u64,
    user: String,
    challenge: [u8; 8],
    authed: bool,
    /// Resolved unix identity after successful setup.
    unix: Option<(u32, u32, Vec<u32>)>,
    trees: HashMap<u32, String>,
    next_tree: u32,
    files: HashMap<u64, SmbFile>,
    next_file: u64,
}

/// The SMB2 router.
pub struct Smb2Dispatcher {
    svc: ServiceContext,
    sessions: Mutex<HashMap<u64, SmbSession>>,
    next_session: AtomicU64,
}

impl Smb2Dispatcher {
    pub fn new(svc: ServiceContext) -> Smb2Dispatcher {
        Smb2Dispatcher {
            svc,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SmbSession>> {
        match self.sessions.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Credentials and engine client id for an authenticated session.
    fn session_identity(&self, session: u64) -> Result<(Credentials, u64), u32> {
        let sessions = self.sessions();
        let sess = sessions.get(&session).ok_or(ntstatus::STATUS_USER_SESSION_DELETED)?;
        if !sess.authed {
            return Err(ntstatus::STATUS_ACCESS_DENIED);
        }
        let (uid, gid, gids) =
            sess.unix.clone().ok_or(ntstatus::STATUS_ACCESS_DENIED)?;
        Ok((Credentials::Unix { uid, gid, gids }, SMB_CLIENT_TAG | session))
    }

    fn file_ref(&self, session: u64, file: u64) -> Result<(u64, InodeId, u64, bool), u32> {
        let sessions = self.sessions();
        let sess = sessions.get(&session).ok_or(ntstatus::STATUS_USER_SESSION_DELETED)?;
        let f = sess.files.get(&file).ok_or(ntstatus::STATUS_INVALID_HANDLE)?;
        Ok((f.share_tag, f.inode, f.engine_open, f.is_dir))
    }

    fn op_ctx(&self, creds: &Credentials, share_tag: u64, client: u64) -> Result<OpContext, u32> {
        let decoded = crate::handle::DecodedHandle { share_tag, inode: InodeId(0) };
        self.svc
            .op_context(creds, &decoded)
            .map(|ctx| ctx.with_client(client))
            .map_err(|e| e.ntstatus())
    }

    /// Dispatches one decoded SMB2 command.
    pub async fn handle(&self, request: Smb2Request) -> Smb2Reply {
        match request {
            Smb2Request::Negotiate { dialects } => self.negotiate(&dialects),
            Smb2Request::SessionSetup { session, user, proof } => {
                self.session_setup(session, &user, proof)
            }
            Smb2Request::Logoff { session } => self.logoff(session).await,
            Smb2Request::TreeConnect { session, path } => self.tree_connect(session, &path),
            Smb2Request::TreeDisconnect { session, tree } => {
                self.tree_disconnect(session, tree)
            }
            Smb2Request::Create { session, tree, path, access, share_access, disposition } => {
                self.create(session, tree, &path, access, share_access, disposition).await
            }
            Smb2Request::Close { session, file } => self.close(session, file).await,
            Smb2Request::Read { session, file, offset, count } => {
                self.read(session, file, offset, count).await
            }
            Smb2Request::Write { session, file, offset, data } => {
                self.write(session, file, offset, &data).await
            }
            Smb2Request::Flush { session, file } => self.flush(session, file).await,
            Smb2Request::QueryDirectory { session, file, restart } => {
                self.query_directory(session, file, restart).await
            }
            Smb2Request::QueryInfo { session, file } => self.query_info(session, file).await,
            Smb2Request::SetInfo { session, file, patch } => {
                self.set_info(session, file, &patch).await
            }
            Smb2Request::Lock { session, file, offset, length, exclusive, fail_immediately } => {
                self.lock(session, file, offset, length, exclusive, fail_immediately).await
            }
            Smb2Request::Unlock { session, file, offset, length } => {
                self.unlock(session, file, offset, length).await
            }
            Smb2Request::Echo => Smb2Reply::Echo { status: ntstatus::STATUS_SUCCESS },
        }
    }

    fn negotiate(&self, dialects: &[u16]) -> Smb2Reply {
        let chosen = if dialects.contains(&DIALECT_210) {
            Some(DIALECT_210)
        } else if dialects.contains(&DIALECT_202) {
            Some(DIALECT_202)
        } else {
            None
        };
        match chosen {
            Some(dialect) => {
                Smb2Reply::Negotiate { status: ntstatus::STATUS_SUCCESS, dialect }
            }
            None => Smb2Reply::Negotiate { status: ntstatus::STATUS_NOT_SUPPORTED, dialect: 0 },
        }
    }

    fn session_setup(
        &self,
        session: Option<u64>,
        user: &str,
        proof: Option<[u8; 32]>,
    ) -> Smb2Reply {
        match (session, proof) {
            // phase one: allocate the session and hand out the challenge
            (None, _) => {
                let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                let challenge: [u8; 8] = rand::random();
                self.sessions().insert(
                    id,
                    SmbSession {
                        id,
                        user: user.to_string(),
                        challenge,
                        authed: false,
                        unix: None,
                        trees: HashMap::new(),
                        next_tree: 1,
                        files: HashMap::new(),
                        next_file: 1,
                    },
                );
                Smb2Reply::SessionSetup {
                    status: ntstatus::STATUS_MORE_PROCESSING_REQUIRED,
                    session: id,
                    challenge: Some(challenge),
                }
            }
            // phase two: verify the proof against the stored hash
            (Some(id), Some(proof)) => {
                let challenge = {
                    let sessions = self.sessions();
                    match sessions.get(&id) {
                        Some(s) => s.challenge,
                        None => {
                            return Smb2Reply::SessionSetup {
                                status: ntstatus::STATUS_USER_SESSION_DELETED,
                                session: id,
                                challenge: None,
                            }
                        }
                    }
                };
                let creds = Credentials::Smb { user: user.to_string(), challenge, proof };
                match self.svc.registry.resolver().resolve(&creds) {
                    Ok(principal) => {
                        let mut sessions = self.sessions();
                        if let Some(sess) = sessions.get_mut(&id) {
                            sess.authed = true;
                            sess.unix =
                                Some((principal.uid, principal.gid, principal.groups.clone()));
                        }
                        debug!(session = id, user, "smb session authenticated");
                        Smb2Reply::SessionSetup {
                            status: ntstatus::STATUS_SUCCESS,
                            session: id,
                            challenge: None,
                        }
                    }
                    Err(_) => Smb2Reply::SessionSetup {
                        status: ntstatus::STATUS_LOGON_FAILURE,
                        session: id,
                        challenge: None,
                    },
                }
            }
            (Some(id), None) => Smb2Reply::SessionSetup {
                status: ntstatus::STATUS_INVALID_PARAMETER,
                session: id,
                challenge: None,
            },
        }
    }

    async fn logoff(&self, session: u64) -> Smb2Reply {
        let Some(sess) = self.sessions().remove(&session) else {
            return Smb2Reply::Logoff { status: ntstatus::STATUS_USER_SESSION_DELETED };
        };
        // drop all engine state the session held
        let client = SMB_CLIENT_TAG | sess.id;
        if let Some((uid, gid, gids)) = sess.unix {
            let creds = Credentials::Unix { uid, gid, gids };
            for file in sess.files.values() {
                if let Ok(ctx) = self.op_ctx(&creds, file.share_tag, client) {
                    let _ = self.svc.engine.close(&ctx, file.engine_open).await;
                }
            }
        }
        Smb2Reply::Logoff { status: ntstatus::STATUS_SUCCESS }
    }

    fn tree_connect(&self, session: u64, path: &str) -> Smb2Reply {
        // accept both UNC-ish ("\\server\export") and plain ("/export")
        let share_name = match path.rsplit(['\\', '/']).find(|c| !c.is_empty()) {
            Some(last) => format!("/{last}"),
            None => {
                return Smb2Reply::TreeConnect {
                    status: ntstatus::STATUS_OBJECT_NAME_INVALID,
                    tree: 0,
                }
            }
        };
        if self.svc.registry.share(&share_name).is_none() {
            return Smb2Reply::TreeConnect {
                status: ntstatus::STATUS_BAD_NETWORK_NAME,
                tree: 0,
            };
        }
        let mut sessions = self.sessions();
        let Some(sess) = sessions.get_mut(&session) else {
            return Smb2Reply::TreeConnect {
                status: ntstatus::STATUS_USER_SESSION_DELETED,
                tree: 0,
            };
        };
        if !sess.authed {
            return Smb2Reply::TreeConnect { status: ntstatus::STATUS_ACCESS_DENIED, tree: 0 };
        }
        let tree = sess.next_tree;
        sess.next_tree += 1;
        sess.trees.insert(tree, share_name);
        Smb2Reply::TreeConnect { status: ntstatus::STATUS_SUCCESS, tree }
    }

    fn tree_disconnect(&self, session: u64, tree: u32) -> Smb2Reply {
        let mut sessions = self.sessions();
        match sessions.get_mut(&session) {
            Some(sess) => {
                if sess.trees.remove(&tree).is_some() {
                    Smb2Reply::TreeDisconnect { status: ntstatus::STATUS_SUCCESS }
                } else {
                    Smb2Reply::TreeDisconnect { status: ntstatus::STATUS_INVALID_PARAMETER }
                }
            }
            None => {
                Smb2Reply::TreeDisconnect { status: ntstatus::STATUS_USER_SESSION_DELETED }
            }
        }
    }

    async fn create(
        &self,
        session: u64,
        tree: u32,
        path: &str,
        access: u32,
        share_access: u32,
        disposition: SmbCreateDisposition,
    ) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Create { status, file: 0, attrs: None },
        };
        let share_name = {
            let sessions = self.sessions();
            let Some(sess) = sessions.get(&session) else {
                return Smb2Reply::Create {
                    status: ntstatus::STATUS_USER_SESSION_DELETED,
                    file: 0,
                    attrs: None,
                };
            };
            match sess.trees.get(&tree) {
                Some(name) => name.clone(),
                None => {
                    return Smb2Reply::Create {
                        status: ntstatus::STATUS_INVALID_PARAMETER,
                        file: 0,
                        attrs: None,
                    }
                }
            }
        };
        let ctx = match self.svc.op_context_for_share(&creds, &share_name) {
            Ok(ctx) => ctx.with_client(client),
            Err(err) => {
                return Smb2Reply::Create { status: err.ntstatus(), file: 0, attrs: None }
            }
        };

        let resolved = self.resolve_path(&ctx, path, disposition).await;
        let (inode, attrs) = match resolved {
            Ok(v) => v,
            Err(err) => {
                return Smb2Reply::Create { status: err.ntstatus(), file: 0, attrs: None }
            }
        };

        let is_dir = attrs.kind == InodeKind::Directory;
        let engine_open = if is_dir {
            // directories are enumeration handles; no share reservation
            0
        } else {
            let deny = AccessBits((!share_access & 0x3) as u8);
            let owner = OpenOwner { client, owner: session.to_be_bytes().to_vec() };
            match self
                .svc
                .engine
                .open(&ctx, inode, owner, AccessBits((access & 0x3) as u8), deny)
                .await
            {
                Ok(open) => open.id,
                Err(EngineError::Denied) => {
                    return Smb2Reply::Create {
                        status: ntstatus::STATUS_SHARING_VIOLATION,
                        file: 0,
                        attrs: None,
                    }
                }
                Err(err) => {
                    return Smb2Reply::Create { status: err.ntstatus(), file: 0, attrs: None }
                }
            }
        };

        if disposition == SmbCreateDisposition::OverwriteIf && !is_dir && attrs.size > 0 {
            let truncate = SetAttrPatch { size: Some(0), ..Default::default() };
            if let Err(err) = self.svc.engine.set_attr(&ctx, inode, &truncate).await {
                return Smb2Reply::Create { status: err.ntstatus(), file: 0, attrs: None };
            }
        }

        let mut sessions = self.sessions();
        let Some(sess) = sessions.get_mut(&session) else {
            return Smb2Reply::Create {
                status: ntstatus::STATUS_USER_SESSION_DELETED,
                file: 0,
                attrs: None,
            };
        };
        let file = sess.next_file;
        sess.next_file += 1;
        sess.files.insert(
            file,
            SmbFile {
                share_tag: ctx.share.tag,
                inode,
                engine_open,
                dir_cursor: (0, 0, false),
                is_dir,
            },
        );
        Smb2Reply::Create { status: ntstatus::STATUS_SUCCESS, file, attrs: Some(attrs) }
    }

    /// Walks a backslash-separated path from the share root, creating the
    /// final component when the disposition asks for it.
    async fn resolve_path(
        &self,
        ctx: &OpContext,
        path: &str,
        disposition: SmbCreateDisposition,
    ) -> Result<(InodeId, Attrs), EngineError> {
        let root = ctx.share.meta.root().await.map_err(EngineError::from_store)?;
        let components: Vec<&str> =
            path.split(['\\', '/']).filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            let attrs = self.svc.engine.get_attr(ctx, root).await?;
            return Ok((root, attrs));
        }
        let mut dir = root;
        for component in &components[..components.len() - 1] {
            let (id, attrs) = self.svc.engine.lookup(ctx, dir, component).await?;
            if attrs.kind != InodeKind::Directory {
                return Err(EngineError::NotDir);
            }
            dir = id;
        }
        let last = components[components.len() - 1];
        match disposition {
            SmbCreateDisposition::Open => self.svc.engine.lookup(ctx, dir, last).await,
            SmbCreateDisposition::Create => {
                self.svc
                    .engine
                    .create(ctx, dir, last, &SetAttrPatch::default(), CreateDisposition::Guarded)
                    .await
            }
            SmbCreateDisposition::OpenIf | SmbCreateDisposition::OverwriteIf => {
                self.svc
                    .engine
                    .create(ctx, dir, last, &SetAttrPatch::default(), CreateDisposition::Unchecked)
                    .await
            }
        }
    }

    async fn close(&self, session: u64, file: u64) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Close { status },
        };
        let removed = {
            let mut sessions = self.sessions();
            sessions.get_mut(&session).and_then(|s| s.files.remove(&file))
        };
        let Some(f) = removed else {
            return Smb2Reply::Close { status: ntstatus::STATUS_INVALID_HANDLE };
        };
        if f.is_dir {
            return Smb2Reply::Close { status: ntstatus::STATUS_SUCCESS };
        }
        match self.op_ctx(&creds, f.share_tag, client) {
            Ok(ctx) => match self.svc.engine.close(&ctx, f.engine_open).await {
                Ok(()) => Smb2Reply::Close { status: ntstatus::STATUS_SUCCESS },
                Err(err) => Smb2Reply::Close { status: err.ntstatus() },
            },
            Err(status) => Smb2Reply::Close { status },
        }
    }

    async fn read(&self, session: u64, file: u64, offset: u64, count: u32) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Read { status, data: Vec::new(), eof: false },
        };
        let (share_tag, inode, _, is_dir) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Read { status, data: Vec::new(), eof: false },
        };
        if is_dir {
            return Smb2Reply::Read {
                status: ntstatus::STATUS_FILE_IS_A_DIRECTORY,
                data: Vec::new(),
                eof: false,
            };
        }
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::Read { status, data: Vec::new(), eof: false },
        };
        let count = count.min(self.svc.settings.current().max_read_size);
        match self.svc.engine.read(&ctx, inode, offset, count as usize).await {
            Ok((data, eof)) => {
                if data.is_empty() && eof {
                    Smb2Reply::Read { status: ntstatus::STATUS_END_OF_FILE, data, eof }
                } else {
                    Smb2Reply::Read { status: ntstatus::STATUS_SUCCESS, data, eof }
                }
            }
            Err(err) => {
                Smb2Reply::Read { status: err.ntstatus(), data: Vec::new(), eof: false }
            }
        }
    }

    async fn write(&self, session: u64, file: u64, offset: u64, data: &[u8]) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Write { status, count: 0 },
        };
        let (share_tag, inode, _, is_dir) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Write { status, count: 0 },
        };
        if is_dir {
            return Smb2Reply::Write {
                status: ntstatus::STATUS_FILE_IS_A_DIRECTORY,
                count: 0,
            };
        }
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::Write { status, count: 0 },
        };
        match self.svc.engine.write(&ctx, inode, offset, data, Stability::Unstable).await {
            Ok((count, _verifier)) => {
                Smb2Reply::Write { status: ntstatus::STATUS_SUCCESS, count }
            }
            Err(err) => Smb2Reply::Write { status: err.ntstatus(), count: 0 },
        }
    }

    async fn flush(&self, session: u64, file: u64) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Flush { status },
        };
        let (share_tag, inode, _, _) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Flush { status },
        };
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::Flush { status },
        };
        match self.svc.engine.commit(&ctx, inode).await {
            Ok(_) => Smb2Reply::Flush { status: ntstatus::STATUS_SUCCESS },
            Err(err) => Smb2Reply::Flush { status: err.ntstatus() },
        }
    }

    async fn query_directory(&self, session: u64, file: u64, restart: bool) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::QueryDirectory { status, entries: Vec::new() },
        };
        let (share_tag, inode, _, is_dir) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::QueryDirectory { status, entries: Vec::new() },
        };
        if !is_dir {
            return Smb2Reply::QueryDirectory {
                status: ntstatus::STATUS_NOT_A_DIRECTORY,
                entries: Vec::new(),
            };
        }
        let (cookie, verifier, done) = {
            let mut sessions = self.sessions();
            let Some(sess) = sessions.get_mut(&session) else {
                return Smb2Reply::QueryDirectory {
                    status: ntstatus::STATUS_USER_SESSION_DELETED,
                    entries: Vec::new(),
                };
            };
            let Some(f) = sess.files.get_mut(&file) else {
                return Smb2Reply::QueryDirectory {
                    status: ntstatus::STATUS_INVALID_HANDLE,
                    entries: Vec::new(),
                };
            };
            if restart {
                f.dir_cursor = (0, 0, false);
            }
            f.dir_cursor
        };
        if done {
            return Smb2Reply::QueryDirectory {
                status: ntstatus::STATUS_NO_MORE_FILES,
                entries: Vec::new(),
            };
        }
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::QueryDirectory { status, entries: Vec::new() },
        };
        let presented = (cookie != 0).then_some(verifier);
        match self.svc.engine.readdir(&ctx, inode, cookie, presented, 128).await {
            Ok(page) => {
                let next_cookie =
                    page.entries.last().map(|e| e.cookie).unwrap_or(cookie);
                {
                    let mut sessions = self.sessions();
                    if let Some(f) =
                        sessions.get_mut(&session).and_then(|s| s.files.get_mut(&file))
                    {
                        f.dir_cursor = (next_cookie, page.verifier, page.eof);
                    }
                }
                if page.entries.is_empty() {
                    return Smb2Reply::QueryDirectory {
                        status: ntstatus::STATUS_NO_MORE_FILES,
                        entries: Vec::new(),
                    };
                }
                Smb2Reply::QueryDirectory {
                    status: ntstatus::STATUS_SUCCESS,
                    entries: page
                        .entries
                        .into_iter()
                        .map(|e| (e.name, e.attrs))
                        .collect(),
                }
            }
            Err(err) => {
                Smb2Reply::QueryDirectory { status: err.ntstatus(), entries: Vec::new() }
            }
        }
    }

    async fn query_info(&self, session: u64, file: u64) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::QueryInfo { status, attrs: None },
        };
        let (share_tag, inode, _, _) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::QueryInfo { status, attrs: None },
        };
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::QueryInfo { status, attrs: None },
        };
        match self.svc.engine.get_attr(&ctx, inode).await {
            Ok(attrs) => {
                Smb2Reply::QueryInfo { status: ntstatus::STATUS_SUCCESS, attrs: Some(attrs) }
            }
            Err(err) => Smb2Reply::QueryInfo { status: err.ntstatus(), attrs: None },
        }
    }

    async fn set_info(&self, session: u64, file: u64, patch: &SetAttrPatch) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::SetInfo { status },
        };
        let (share_tag, inode, _, _) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::SetInfo { status },
        };
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::SetInfo { status },
        };
        match self.svc.engine.set_attr(&ctx, inode, patch).await {
            Ok(_) => Smb2Reply::SetInfo { status: ntstatus::STATUS_SUCCESS },
            Err(err) => Smb2Reply::SetInfo { status: err.ntstatus() },
        }
    }

    async fn lock(
        &self,
        session: u64,
        file: u64,
        offset: u64,
        length: u64,
        exclusive: bool,
        fail_immediately: bool,
    ) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Lock { status },
        };
        let (share_tag, inode, _, _) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Lock { status },
        };
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::Lock { status },
        };
        let owner = LockOwner { client, owner: file.to_be_bytes().to_vec() };
        let kind = if exclusive { LockKind::Exclusive } else { LockKind::Shared };
        match self
            .svc
            .engine
            .lock(
                &ctx,
                inode,
                &owner,
                LockRange::new(offset, length),
                kind,
                !fail_immediately,
            )
            .await
        {
            Ok(()) => Smb2Reply::Lock { status: ntstatus::STATUS_SUCCESS },
            Err(err) => Smb2Reply::Lock { status: err.ntstatus() },
        }
    }

    async fn unlock(&self, session: u64, file: u64, offset: u64, length: u64) -> Smb2Reply {
        let (creds, client) = match self.session_identity(session) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Unlock { status },
        };
        let (share_tag, inode, _, _) = match self.file_ref(session, file) {
            Ok(v) => v,
            Err(status) => return Smb2Reply::Unlock { status },
        };
        let ctx = match self.op_ctx(&creds, share_tag, client) {
            Ok(ctx) => ctx,
            Err(status) => return Smb2Reply::Unlock { status },
        };
        let owner = LockOwner { client, owner: file.to_be_bytes().to_vec() };
        self.svc.engine.unlock(&ctx, inode, &owner, LockRange::new(offset, length));
        Smb2Reply::Unlock { status: ntstatus::STATUS_SUCCESS }
    }
}
