mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

use quayfs::dispatch::portmap::{
    PortmapDispatcher, PortmapReply, PortmapRequest, PortmapTable, Transport, PROG_NFS,
};
use quayfs::server::{
    DecodedReply, DecodedRequest, MessageCodec, MessageStream, Server, Services,
};
use quayfs::store::{MetaStore, PayloadStore};

use support::Fixture;

/// Test codec: every connection issues one scripted GETPORT request and
/// forwards the reply to the test through a channel.
struct ScriptCodec {
    replies: mpsc::UnboundedSender<DecodedReply>,
}

struct ScriptStream {
    sent: bool,
    replies: mpsc::UnboundedSender<DecodedReply>,
}

#[async_trait]
impl MessageStream for ScriptStream {
    async fn next_request(&mut self) -> std::io::Result<Option<DecodedRequest>> {
        if self.sent {
            return Ok(None);
        }
        self.sent = true;
        Ok(Some(DecodedRequest::Portmap {
            body: PortmapRequest::GetPort {
                program: PROG_NFS,
                version: 3,
                transport: Transport::Tcp,
            },
        }))
    }

    async fn send_reply(&mut self, reply: DecodedReply) -> std::io::Result<()> {
        let _ = self.replies.send(reply);
        Ok(())
    }
}

impl MessageCodec for ScriptCodec {
    fn attach(&self, _socket: TcpStream, _peer: SocketAddr) -> Box<dyn MessageStream> {
        Box::new(ScriptStream { sent: false, replies: self.replies.clone() })
    }
}

fn services(fx: &Fixture) -> Arc<Services> {
    let portmap = PortmapDispatcher::new(PortmapTable::with_defaults(111, 2049));
    Arc::new(Services::new(fx.svc.clone(), portmap))
}

async fn connect(port: u16) -> TcpStream {
    let socket = TcpSocket::new_v4().unwrap();
    socket.connect(format!("127.0.0.1:{port}").parse().unwrap()).await.unwrap()
}

#[tokio::test]
async fn connections_are_served_and_shutdown_drains() {
    let fx = Fixture::new();
    let (tx, mut replies) = mpsc::unbounded_channel();
    let server = Server::bind(
        "127.0.0.1:0",
        ScriptCodec { replies: tx },
        services(&fx),
        fx.settings.clone(),
    )
    .await
    .unwrap();
    let port = server.local_port();
    let shutdown = server.shutdown_handle();
    let serve = tokio::spawn(async move { server.serve().await });

    // two connections, one scripted request each
    let _c1 = connect(port).await;
    let _c2 = connect(port).await;
    for _ in 0..2 {
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("reply arrives")
            .expect("channel open");
        match reply {
            DecodedReply::Portmap { body } => {
                assert_eq!(body, PortmapReply::Port(2049));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), serve)
        .await
        .expect("serve returns after shutdown")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_flushes_buffered_writes() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let f = fx.make_file("dirty", b"").await;
    fx.engine
        .write(&ctx, f, 0, b"unflushed", quayfs::engine::Stability::Unstable)
        .await
        .unwrap();
    assert!(fx.share().write_cache.snapshot(f).is_some());

    let (tx, _replies) = mpsc::unbounded_channel();
    let server = Server::bind(
        "127.0.0.1:0",
        ScriptCodec { replies: tx },
        services(&fx),
        fx.settings.clone(),
    )
    .await
    .unwrap();
    let shutdown = server.shutdown_handle();
    let serve = tokio::spawn(async move { server.serve().await });

    shutdown.send(true).unwrap();
    serve.await.unwrap().unwrap();

    // the write cache was flushed on the way down
    assert!(fx.share().write_cache.snapshot(f).is_none());
    let (key, size) = fx.share().meta.get_content(f).await.unwrap().unwrap();
    assert_eq!(size, 9);
    assert_eq!(fx.payload.get(&key).await.unwrap(), b"unflushed");
}
