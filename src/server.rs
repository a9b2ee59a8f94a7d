//! Connection handling and shutdown sequencing.
//!
//! The server accepts TCP connections and runs one worker task per
//! connection, pulling decoded requests off the connection's message
//! stream in FIFO order, the ordering the protocols require within a
//! connection. The wire codec is a pluggable boundary: a
//! [`MessageCodec`] turns an accepted socket into a [`MessageStream`] of
//! decoded requests and consumes decoded replies.
//!
//! A panicking request is isolated to itself: the worker catches the
//! unwind, answers with a fault reply and keeps serving the connection.
//! Shutdown stops the accept loop, drains live connections up to the
//! configured timeout, then flushes every share's write cache
//! best-effort.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatch::mount::{MountDispatcher, MountReply, MountRequest};
use crate::dispatch::nfs3::{DupCache, Nfs3Dispatcher, Nfs3Reply, Nfs3Request};
use crate::dispatch::nfs4::{Compound, CompoundReply, Nfs4Dispatcher};
use crate::dispatch::portmap::{PortmapDispatcher, PortmapReply, PortmapRequest};
use crate::dispatch::smb2::{Smb2Dispatcher, Smb2Reply, Smb2Request};
use crate::dispatch::ServiceContext;
use crate::ident::Credentials;
use crate::settings::SettingsHandle;

/// A decoded request as produced by a wire codec.
#[derive(Debug)]
pub enum DecodedRequest {
    Nfs3 { xid: u32, creds: Credentials, body: Nfs3Request },
    Nfs4 { creds: Credentials, compound: Compound },
    Mount { creds: Credentials, body: MountRequest },
    Portmap { body: PortmapRequest },
    Smb2 { body: Smb2Request },
}

/// A decoded reply for the codec to serialize.
#[derive(Debug)]
pub enum DecodedReply {
    Nfs3 { xid: u32, body: Arc<Nfs3Reply> },
    Nfs4 { body: Arc<CompoundReply> },
    Mount { body: MountReply },
    Portmap { body: PortmapReply },
    Smb2 { body: Smb2Reply },
    /// Request processing failed outside protocol semantics (worker
    /// panic); codecs emit an RPC SYSTEM_ERR or SMB unexpected-error.
    Fault { xid: Option<u32> },
}

/// One connection's stream of decoded messages.
#[async_trait]
pub trait MessageStream: Send {
    /// The next decoded request, or `None` at end of stream.
    async fn next_request(&mut self) -> std::io::Result<Option<DecodedRequest>>;

    /// Sends one decoded reply.
    async fn send_reply(&mut self, reply: DecodedReply) -> std::io::Result<()>;
}

/// Factory turning accepted sockets into message streams.
pub trait MessageCodec: Send + Sync + 'static {
    fn attach(&self, socket: TcpStream, peer: SocketAddr) -> Box<dyn MessageStream>;
}

/// All protocol routers bundled for connection workers.
pub struct Services {
    pub nfs3: Nfs3Dispatcher,
    pub nfs4: Nfs4Dispatcher,
    pub smb2: Smb2Dispatcher,
    pub mount: MountDispatcher,
    pub portmap: PortmapDispatcher,
    pub svc: ServiceContext,
}

impl Services {
    pub fn new(svc: ServiceContext, portmap: PortmapDispatcher) -> Services {
        Services {
            nfs3: Nfs3Dispatcher::new(svc.clone()),
            nfs4: Nfs4Dispatcher::new(svc.clone()),
            smb2: Smb2Dispatcher::new(svc.clone()),
            mount: MountDispatcher::new(svc.clone()),
            portmap,
            svc,
        }
    }

    fn fault_for(request: &DecodedRequest) -> DecodedReply {
        match request {
            DecodedRequest::Nfs3 { xid, .. } => DecodedReply::Fault { xid: Some(*xid) },
            _ => DecodedReply::Fault { xid: None },
        }
    }

    /// Routes one request, isolating panics to this request.
    pub async fn handle(
        &self,
        dup: &DupCache,
        client_addr: &str,
        request: DecodedRequest,
    ) -> DecodedReply {
        let fault = Self::fault_for(&request);
        let work = std::panic::AssertUnwindSafe(self.route(dup, client_addr, request));
        match work.catch_unwind().await {
            Ok(reply) => reply,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(detail = %detail, "request worker panicked; replying with fault");
                fault
            }
        }
    }

    async fn route(
        &self,
        dup: &DupCache,
        client_addr: &str,
        request: DecodedRequest,
    ) -> DecodedReply {
        match request {
            DecodedRequest::Nfs3 { xid, creds, body } => DecodedReply::Nfs3 {
                xid,
                body: self.nfs3.handle(dup, xid, &creds, body).await,
            },
            DecodedRequest::Nfs4 { creds, compound } => DecodedReply::Nfs4 {
                body: self.nfs4.handle(&creds, compound).await,
            },
            DecodedRequest::Mount { creds, body } => DecodedReply::Mount {
                body: self.mount.handle(client_addr, &creds, body).await,
            },
            DecodedRequest::Portmap { body } => DecodedReply::Portmap {
                body: self.portmap.handle(body),
            },
            DecodedRequest::Smb2 { body } => DecodedReply::Smb2 {
                body: self.smb2.handle(body).await,
            },
        }
    }
}

/// The accepting server.
pub struct Server<C: MessageCodec> {
    listener: TcpListener,
    codec: Arc<C>,
    services: Arc<Services>,
    settings: SettingsHandle,
    shutdown_tx: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
}

impl<C: MessageCodec> Server<C> {
    /// Binds the listener.
    pub async fn bind(
        addr: &str,
        codec: C,
        services: Arc<Services>,
        settings: SettingsHandle,
    ) -> Result<Server<C>> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {:?}", listener.local_addr()?);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Server {
            listener,
            codec: Arc::new(codec),
            services,
            settings,
            shutdown_tx,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The bound port (useful when binding port 0).
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// A handle that triggers shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Accepts and serves connections until shutdown is signalled, then
    /// drains workers and flushes write caches.
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            warn!(?err, "accept failed");
                            continue;
                        }
                    };
                    let max = self.settings.current().max_connections;
                    if self.active.load(Ordering::Acquire) >= max {
                        warn!(%peer, "connection limit reached, refusing");
                        continue;
                    }
                    let _ = socket.set_nodelay(true);
                    info!(%peer, "accepted connection");
                    let stream = self.codec.attach(socket, peer);
                    let services = self.services.clone();
                    let active = self.active.clone();
                    let conn_shutdown = self.shutdown_tx.subscribe();
                    active.fetch_add(1, Ordering::AcqRel);
                    workers.spawn(async move {
                        process_connection(stream, services, peer, conn_shutdown).await;
                        active.fetch_sub(1, Ordering::AcqRel);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                // reap finished workers so the set stays small
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        info!("shutdown: draining connections");
        let drain = self.settings.current().shutdown_wait();
        if tokio::time::timeout(drain, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("shutdown drain timed out, aborting remaining connections");
            workers.shutdown().await;
        }

        // flush buffered writes best-effort
        for share in self.services.svc.registry.share_snapshots() {
            self.services.svc.engine.flush_share(share).await;
        }
        info!("shutdown complete");
        Ok(())
    }
}

/// Serves one connection: FIFO request processing, one reply per request.
/// Dropping the stream cancels any in-flight request (its future is
/// dropped mid-await), which releases engine locks on unwind.
async fn process_connection(
    mut stream: Box<dyn MessageStream>,
    services: Arc<Services>,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let dup = DupCache::default();
    let client_addr = peer.to_string();
    loop {
        let request = tokio::select! {
            request = stream.next_request() => request,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(%peer, "closing connection for shutdown");
                    return;
                }
                continue;
            }
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(%peer, "connection closed by peer");
                return;
            }
            Err(err) => {
                debug!(%peer, ?err, "connection read failed");
                return;
            }
        };
        let reply = services.handle(&dup, &client_addr, request).await;
        if let Err(err) = stream.send_reply(reply).await {
            debug!(%peer, ?err, "connection write failed");
            return;
        }
    }
}
