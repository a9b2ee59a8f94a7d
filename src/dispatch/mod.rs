//! Protocol dispatchers.
//!
//! Each submodule is a thin router from *decoded* wire operations to
//! engine and v4-state calls. Wire codecs live outside the core; what
//! crosses this boundary is already parsed into the operation types the
//! routers declare, and what comes back is a decoded reply for the codec
//! to serialize. The routers own exactly three jobs: protocol-specific
//! preconditions, error-code translation, and protocol state that has no
//! engine meaning (duplicate-request caches, compound current-filehandle,
//! SMB session/tree tables).

pub mod mount;
pub mod nfs3;
pub mod nfs4;
pub mod portmap;
pub mod smb2;

use std::sync::Arc;

use crate::engine::{Engine, OpContext};
use crate::error::{EngineError, EngineResult};
use crate::handle::{DecodedHandle, HandleCodec};
use crate::ident::{Credentials, Permission};
use crate::registry::Registry;
use crate::settings::SettingsHandle;
use crate::v4::V4State;

/// Shared state handed to every dispatcher.
#[derive(Clone)]
pub struct ServiceContext {
    pub registry: Arc<Registry>,
    pub engine: Arc<Engine>,
    pub v4: Arc<V4State>,
    pub settings: SettingsHandle,
    pub handles: HandleCodec,
}

impl ServiceContext {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<Engine>,
        v4: Arc<V4State>,
        settings: SettingsHandle,
    ) -> ServiceContext {
        let handles = HandleCodec::new(v4.boot_instance());
        ServiceContext { registry, engine, v4, settings, handles }
    }

    /// Builds an operation context for a decoded handle: resolves the
    /// share, the principal and its permission on that share.
    pub(crate) fn op_context(
        &self,
        creds: &Credentials,
        handle: &DecodedHandle,
    ) -> EngineResult<OpContext> {
        let share = self
            .registry
            .share_by_tag(handle.share_tag)
            .ok_or(EngineError::StaleHandle)?;
        let resolver = self.registry.resolver();
        let principal = resolver.resolve(creds)?;
        let permission =
            resolver.permission_for(&principal, share.name(), share.config.default_permission);
        if permission == Permission::None {
            return Err(EngineError::NotPerm);
        }
        Ok(OpContext::new(principal, permission, share))
    }

    /// Like [`Self::op_context`] but for a share resolved by name (mount
    /// path, SMB tree connect).
    pub(crate) fn op_context_for_share(
        &self,
        creds: &Credentials,
        share_name: &str,
    ) -> EngineResult<OpContext> {
        let share = self.registry.share(share_name).ok_or(EngineError::NoEntry)?;
        let resolver = self.registry.resolver();
        let principal = resolver.resolve(creds)?;
        let permission =
            resolver.permission_for(&principal, share.name(), share.config.default_permission);
        if permission == Permission::None {
            return Err(EngineError::NotPerm);
        }
        Ok(OpContext::new(principal, permission, share))
    }
}
