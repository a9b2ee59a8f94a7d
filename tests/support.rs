#![allow(dead_code)]

use std::sync::Arc;

use quayfs::cache::ReadCache;
use quayfs::dispatch::ServiceContext;
use quayfs::engine::{Engine, OpContext, Stability};
use quayfs::ident::{Permission, Principal};
use quayfs::inode::{InodeId, SetAttrPatch};
use quayfs::registry::{Registry, ShareBinding};
use quayfs::settings::{Settings, SettingsHandle};
use quayfs::share::{ShareConfig, ShareSnapshot};
use quayfs::store::memory::{MemoryMetaStore, MemoryPayloadStore};
use quayfs::store::MetaStore;
use quayfs::v4::V4State;

/// A fresh server core over in-memory stores with one share at
/// `/export`. Every test builds its own; nothing is shared process-wide.
pub struct Fixture {
    pub registry: Arc<Registry>,
    pub engine: Arc<Engine>,
    pub v4: Arc<V4State>,
    pub settings: SettingsHandle,
    pub svc: ServiceContext,
    pub payload: Arc<MemoryPayloadStore>,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Fixture {
        Fixture::build(settings, Arc::new(MemoryPayloadStore::new()))
    }

    pub fn without_incremental() -> Fixture {
        Fixture::build(
            Settings::default(),
            Arc::new(MemoryPayloadStore::without_incremental()),
        )
    }

    fn build(settings: Settings, payload: Arc<MemoryPayloadStore>) -> Fixture {
        let settings = SettingsHandle::new(settings);
        let registry = Arc::new(Registry::new());
        registry.register_meta_store("meta", Arc::new(MemoryMetaStore::new()));
        registry.register_payload_store("payload", payload.clone());
        registry.register_read_cache("read", Arc::new(ReadCache::new(64 * 1024 * 1024)));
        registry
            .add_share(
                ShareConfig::new("/export"),
                ShareBinding {
                    meta: "meta".into(),
                    payload: "payload".into(),
                    read_cache: Some("read".into()),
                    write_cache: None,
                },
            )
            .expect("add share");

        let engine = Arc::new(Engine::new(settings.clone()));
        let v4 = Arc::new(V4State::new(
            0x5157_4159,
            engine.clone(),
            registry.clone(),
            settings.clone(),
        ));
        let svc =
            ServiceContext::new(registry.clone(), engine.clone(), v4.clone(), settings.clone());
        Fixture { registry, engine, v4, settings, svc, payload }
    }

    pub fn share(&self) -> ShareSnapshot {
        self.registry.share("/export").expect("share exists")
    }

    pub async fn root(&self) -> InodeId {
        self.share().meta.root().await.expect("share root")
    }

    /// Context for an ordinary read-write user.
    pub fn ctx(&self) -> OpContext {
        OpContext::new(
            Principal { uid: 1000, gid: 1000, groups: vec![1000] },
            Permission::ReadWrite,
            self.share(),
        )
    }

    /// Context for a different unprivileged user.
    pub fn other_ctx(&self) -> OpContext {
        OpContext::new(
            Principal { uid: 2000, gid: 2000, groups: vec![2000] },
            Permission::ReadWrite,
            self.share(),
        )
    }

    pub fn fh(&self, id: InodeId) -> Vec<u8> {
        self.svc.handles.encode(self.share().tag, id)
    }

    /// Creates a file under the root and writes `data` through the engine
    /// with a stable (committing) write.
    pub async fn make_file(&self, name: &str, data: &[u8]) -> InodeId {
        let ctx = self.ctx();
        let root = self.root().await;
        let (id, _) = self
            .engine
            .create(
                &ctx,
                root,
                name,
                &SetAttrPatch::default(),
                quayfs::engine::CreateDisposition::Unchecked,
            )
            .await
            .expect("create file");
        if !data.is_empty() {
            self.engine
                .write(&ctx, id, 0, data, Stability::FileSync)
                .await
                .expect("write file");
        }
        id
    }

    /// Reads a whole file through the engine.
    pub async fn read_all(&self, id: InodeId) -> Vec<u8> {
        let ctx = self.ctx();
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let (chunk, eof) = self
                .engine
                .read(&ctx, id, offset, 1 << 20)
                .await
                .expect("read file");
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
            if eof || chunk.is_empty() {
                break;
            }
        }
        out
    }
}
