//! Process-wide catalogue of stores, caches, shares and identities.
//!
//! The registry is read-mostly: mutation happens under a single writer
//! lock, readers take cheap snapshots on entry. There are no ambient
//! singletons: everything that needs the registry receives an explicit
//! `Arc<Registry>`, and tests build a fresh one each.
//!
//! Stores and caches are registered under names; a share binds to them by
//! name when it is added, and the binding is resolved once at that point
//! so per-request snapshot assembly never fails on a dangling reference.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::cache::{ReadCache, WriteCache};
use crate::ident::{Group, IdentResolver, User};
use crate::pseudofs::PseudoFs;
use crate::share::{ShareConfig, ShareSnapshot};
use crate::store::{MetaStore, PayloadStore};

/// Registry failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownMetaStore(String),
    UnknownPayloadStore(String),
    UnknownReadCache(String),
    UnknownWriteCache(String),
    UnknownShare(String),
    DuplicateShare(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for RegistryError {}

/// Names binding a share to registered stores and caches. A missing write
/// cache gets a dedicated default arena; a missing read cache means reads
/// always go to the payload store.
#[derive(Debug, Clone, Default)]
pub struct ShareBinding {
    pub meta: String,
    pub payload: String,
    pub read_cache: Option<String>,
    pub write_cache: Option<String>,
}

struct ShareRecord {
    tag: u64,
    config: Arc<ShareConfig>,
    meta: Arc<dyn MetaStore>,
    payload: Arc<dyn PayloadStore>,
    read_cache: Option<Arc<ReadCache>>,
    write_cache: Arc<WriteCache>,
}

impl ShareRecord {
    fn snapshot(&self) -> ShareSnapshot {
        ShareSnapshot {
            tag: self.tag,
            config: self.config.clone(),
            meta: self.meta.clone(),
            payload: self.payload.clone(),
            read_cache: self.read_cache.clone(),
            write_cache: self.write_cache.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    meta_stores: HashMap<String, Arc<dyn MetaStore>>,
    payload_stores: HashMap<String, Arc<dyn PayloadStore>>,
    read_caches: HashMap<String, Arc<ReadCache>>,
    write_caches: HashMap<String, Arc<WriteCache>>,
    shares: HashMap<String, ShareRecord>,
    tags: HashMap<u64, String>,
    next_tag: u64,
    users: HashMap<String, Arc<User>>,
    groups: HashMap<String, Arc<Group>>,
    resolver: Arc<IdentResolver>,
    pseudo: Arc<PseudoFs>,
    generation: u64,
}

/// The catalogue.
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        let inner = Inner {
            next_tag: 1, // tag 0 is the pseudo-fs
            pseudo: Arc::new(PseudoFs::build(std::iter::empty())),
            ..Default::default()
        };
        Registry { inner: RwLock::new(inner) }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn register_meta_store(&self, name: impl Into<String>, store: Arc<dyn MetaStore>) {
        self.write().meta_stores.insert(name.into(), store);
    }

    pub fn register_payload_store(&self, name: impl Into<String>, store: Arc<dyn PayloadStore>) {
        self.write().payload_stores.insert(name.into(), store);
    }

    pub fn register_read_cache(&self, name: impl Into<String>, cache: Arc<ReadCache>) {
        self.write().read_caches.insert(name.into(), cache);
    }

    pub fn register_write_cache(&self, name: impl Into<String>, cache: Arc<WriteCache>) {
        self.write().write_caches.insert(name.into(), cache);
    }

    /// Adds a share, resolving its bindings and assigning a tag. Rebuilds
    /// the pseudo-fs; in-flight operations keep their old snapshot.
    pub fn add_share(
        &self,
        config: ShareConfig,
        binding: ShareBinding,
    ) -> Result<(), RegistryError> {
        let mut inner = self.write();
        if inner.shares.contains_key(&config.name) {
            return Err(RegistryError::DuplicateShare(config.name));
        }
        let meta = inner
            .meta_stores
            .get(&binding.meta)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMetaStore(binding.meta.clone()))?;
        let payload = inner
            .payload_stores
            .get(&binding.payload)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPayloadStore(binding.payload.clone()))?;
        let read_cache = match &binding.read_cache {
            Some(name) => Some(
                inner
                    .read_caches
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RegistryError::UnknownReadCache(name.clone()))?,
            ),
            None => None,
        };
        let write_cache = match &binding.write_cache {
            Some(name) => inner
                .write_caches
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownWriteCache(name.clone()))?,
            None => Arc::new(WriteCache::default()),
        };

        let tag = inner.next_tag;
        inner.next_tag += 1;
        let name = config.name.clone();
        let record = ShareRecord {
            tag,
            config: Arc::new(config),
            meta,
            payload,
            read_cache,
            write_cache,
        };
        inner.tags.insert(tag, name.clone());
        inner.shares.insert(name.clone(), record);
        inner.rebuild_pseudo();
        info!(share = %name, tag, "share added");
        Ok(())
    }

    /// Removes a share and rebuilds the pseudo-fs.
    pub fn remove_share(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let record = inner
            .shares
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownShare(name.to_string()))?;
        inner.tags.remove(&record.tag);
        inner.rebuild_pseudo();
        info!(share = %name, "share removed");
        Ok(())
    }

    /// Snapshot of a share by export name.
    pub fn share(&self, name: &str) -> Option<ShareSnapshot> {
        self.read().shares.get(name).map(ShareRecord::snapshot)
    }

    /// Snapshot of a share by filehandle tag.
    pub fn share_by_tag(&self, tag: u64) -> Option<ShareSnapshot> {
        let inner = self.read();
        let name = inner.tags.get(&tag)?;
        inner.shares.get(name).map(ShareRecord::snapshot)
    }

    /// The active share configurations, for exports enumeration.
    pub fn shares(&self) -> Vec<Arc<ShareConfig>> {
        let mut shares: Vec<Arc<ShareConfig>> =
            self.read().shares.values().map(|r| r.config.clone()).collect();
        shares.sort_by(|a, b| a.name.cmp(&b.name));
        shares
    }

    /// Snapshots of every share, for shutdown flushing.
    pub fn share_snapshots(&self) -> Vec<ShareSnapshot> {
        self.read().shares.values().map(ShareRecord::snapshot).collect()
    }

    pub fn add_user(&self, user: User) {
        let mut inner = self.write();
        inner.users.insert(user.name.clone(), Arc::new(user));
        inner.rebuild_resolver();
    }

    pub fn remove_user(&self, name: &str) {
        let mut inner = self.write();
        if inner.users.remove(name).is_some() {
            inner.rebuild_resolver();
        }
    }

    pub fn add_group(&self, group: Group) {
        let mut inner = self.write();
        inner.groups.insert(group.name.clone(), Arc::new(group));
    }

    /// The identity resolver built from the current user table.
    pub fn resolver(&self) -> Arc<IdentResolver> {
        self.read().resolver.clone()
    }

    /// The current pseudo-fs snapshot.
    pub fn pseudofs(&self) -> Arc<PseudoFs> {
        self.read().pseudo.clone()
    }

    /// Bumped on every share add/remove.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }
}

impl Inner {
    fn rebuild_pseudo(&mut self) {
        let configs: Vec<Arc<ShareConfig>> =
            self.shares.values().map(|r| r.config.clone()).collect();
        self.pseudo = Arc::new(PseudoFs::build(configs.iter()));
        self.generation += 1;
    }

    fn rebuild_resolver(&mut self) {
        self.resolver = Arc::new(IdentResolver::new(self.users.values().cloned()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pseudofs::PseudoLookup;
    use crate::store::memory::{MemoryMetaStore, MemoryPayloadStore};

    fn registry_with_stores() -> Registry {
        let registry = Registry::new();
        registry.register_meta_store("meta", Arc::new(MemoryMetaStore::new()));
        registry.register_payload_store("payload", Arc::new(MemoryPayloadStore::new()));
        registry
    }

    fn binding() -> ShareBinding {
        ShareBinding { meta: "meta".into(), payload: "payload".into(), ..Default::default() }
    }

    #[test]
    fn share_snapshot_resolves_bindings() {
        let registry = registry_with_stores();
        registry.add_share(ShareConfig::new("/export"), binding()).unwrap();
        let snapshot = registry.share("/export").unwrap();
        assert_eq!(snapshot.name(), "/export");
        assert_eq!(snapshot.tag, 1);
        assert!(registry.share_by_tag(1).is_some());
    }

    #[test]
    fn dangling_binding_is_rejected() {
        let registry = Registry::new();
        let err = registry.add_share(ShareConfig::new("/export"), binding()).unwrap_err();
        assert_eq!(err, RegistryError::UnknownMetaStore("meta".into()));
    }

    #[test]
    fn share_churn_rebuilds_pseudofs() {
        let registry = registry_with_stores();
        registry.add_share(ShareConfig::new("/a"), binding()).unwrap();
        let before = registry.pseudofs();
        registry.add_share(ShareConfig::new("/b"), binding()).unwrap();
        let after = registry.pseudofs();

        // the old snapshot is unchanged, the new one sees both shares
        assert!(before.lookup(before.root(), "b").is_none());
        assert_eq!(
            after.lookup(after.root(), "b"),
            Some(PseudoLookup::Junction("/b".into()))
        );

        registry.remove_share("/a").unwrap();
        assert!(registry.pseudofs().lookup(0, "a").is_none());
        assert!(registry.share("/a").is_none());
    }

    #[test]
    fn duplicate_share_rejected() {
        let registry = registry_with_stores();
        registry.add_share(ShareConfig::new("/export"), binding()).unwrap();
        let err = registry.add_share(ShareConfig::new("/export"), binding()).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateShare("/export".into()));
    }
}
