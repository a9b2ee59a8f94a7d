//! Server tunables with live reload.
//!
//! Settings form a versioned row: every accepted patch bumps the version
//! monotonically. Patches validate unless forced, and a dry run returns
//! the would-be row without publishing it. A watcher task polls a TOML
//! file and applies its contents as a patch, so operators edit tunables
//! without a restart; consumers subscribe through a watch channel and see
//! each published snapshot at their next operation.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::share::BlockedOp;

/// NFS protocol versions the server can speak.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum ProtoVersion {
    #[serde(rename = "3")]
    V3,
    #[serde(rename = "4.0")]
    V40,
    #[serde(rename = "4.1")]
    V41,
}

/// One settings row. Field names match the persisted keys; durations are
/// in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Monotonically increasing row version; bumped on every accepted
    /// patch, never taken from a file.
    #[serde(skip)]
    pub version: u64,
    pub min_version: ProtoVersion,
    pub max_version: ProtoVersion,
    pub lease_time: u64,
    pub grace_period: u64,
    pub delegation_recall_timeout: u64,
    pub callback_timeout: u64,
    pub lease_break_timeout: u64,
    pub shutdown_timeout: u64,
    pub max_connections: usize,
    pub max_clients: usize,
    pub max_compound_ops: usize,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub preferred_transfer_size: u32,
    pub session_slots: usize,
    pub delegations_enabled: bool,
    pub blocked_operations: Vec<BlockedOp>,
    pub portmapper_enabled: bool,
    pub portmapper_port: u16,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            version: 0,
            min_version: ProtoVersion::V3,
            max_version: ProtoVersion::V41,
            lease_time: 90,
            grace_period: 90,
            delegation_recall_timeout: 5,
            callback_timeout: 5,
            lease_break_timeout: 35,
            shutdown_timeout: 30,
            max_connections: 1024,
            max_clients: 1024,
            max_compound_ops: 64,
            max_read_size: 1024 * 1024,
            max_write_size: 1024 * 1024,
            preferred_transfer_size: 256 * 1024,
            session_slots: 32,
            delegations_enabled: true,
            blocked_operations: Vec::new(),
            portmapper_enabled: true,
            portmapper_port: 111,
        }
    }
}

impl Settings {
    pub fn lease_period(&self) -> Duration {
        Duration::from_secs(self.lease_time)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    pub fn recall_wait(&self) -> Duration {
        Duration::from_secs(self.delegation_recall_timeout)
    }

    pub fn callback_wait(&self) -> Duration {
        Duration::from_secs(self.callback_timeout)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Validates cross-field consistency.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.min_version > self.max_version {
            return Err(SettingsError::invalid("min_version exceeds max_version"));
        }
        if self.lease_time == 0 {
            return Err(SettingsError::invalid("lease_time must be positive"));
        }
        if self.callback_timeout == 0 {
            return Err(SettingsError::invalid("callback_timeout must be positive"));
        }
        if self.max_read_size == 0 || self.max_write_size == 0 {
            return Err(SettingsError::invalid("transfer sizes must be positive"));
        }
        if self.preferred_transfer_size > self.max_read_size {
            return Err(SettingsError::invalid(
                "preferred_transfer_size exceeds max_read_size",
            ));
        }
        if self.session_slots == 0 {
            return Err(SettingsError::invalid("session_slots must be positive"));
        }
        if self.max_compound_ops == 0 {
            return Err(SettingsError::invalid("max_compound_ops must be positive"));
        }
        Ok(())
    }
}

/// A partial settings update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsPatch {
    pub min_version: Option<ProtoVersion>,
    pub max_version: Option<ProtoVersion>,
    pub lease_time: Option<u64>,
    pub grace_period: Option<u64>,
    pub delegation_recall_timeout: Option<u64>,
    pub callback_timeout: Option<u64>,
    pub lease_break_timeout: Option<u64>,
    pub shutdown_timeout: Option<u64>,
    pub max_connections: Option<usize>,
    pub max_clients: Option<usize>,
    pub max_compound_ops: Option<usize>,
    pub max_read_size: Option<u32>,
    pub max_write_size: Option<u32>,
    pub preferred_transfer_size: Option<u32>,
    pub session_slots: Option<usize>,
    pub delegations_enabled: Option<bool>,
    pub blocked_operations: Option<Vec<BlockedOp>>,
    pub portmapper_enabled: Option<bool>,
    pub portmapper_port: Option<u16>,
}

impl SettingsPatch {
    fn apply(&self, base: &Settings) -> Settings {
        let mut next = base.clone();
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = &self.$field {
                    next.$field = v.clone();
                })*
            };
        }
        take!(
            min_version,
            max_version,
            lease_time,
            grace_period,
            delegation_recall_timeout,
            callback_timeout,
            lease_break_timeout,
            shutdown_timeout,
            max_connections,
            max_clients,
            max_compound_ops,
            max_read_size,
            max_write_size,
            preferred_transfer_size,
            session_slots,
            delegations_enabled,
            blocked_operations,
            portmapper_enabled,
            portmapper_port
        );
        next
    }
}

/// Settings errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    Invalid(String),
    Parse(String),
}

impl SettingsError {
    fn invalid(msg: &str) -> SettingsError {
        SettingsError::Invalid(msg.to_string())
    }
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Invalid(m) => write!(f, "invalid settings: {m}"),
            SettingsError::Parse(m) => write!(f, "settings parse error: {m}"),
        }
    }
}

impl std::error::Error for SettingsError {}

/// Shared handle publishing settings snapshots.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: std::sync::Arc<watch::Sender<std::sync::Arc<Settings>>>,
}

impl Default for SettingsHandle {
    fn default() -> Self {
        SettingsHandle::new(Settings::default())
    }
}

impl SettingsHandle {
    pub fn new(initial: Settings) -> SettingsHandle {
        let (tx, _) = watch::channel(std::sync::Arc::new(initial));
        SettingsHandle { tx: std::sync::Arc::new(tx) }
    }

    /// The current snapshot.
    pub fn current(&self) -> std::sync::Arc<Settings> {
        self.tx.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<std::sync::Arc<Settings>> {
        self.tx.subscribe()
    }

    /// Applies a patch. Validation failures reject the patch unless
    /// `force` is set; `dry_run` returns the would-be row without
    /// publishing.
    pub fn apply(
        &self,
        patch: &SettingsPatch,
        force: bool,
        dry_run: bool,
    ) -> Result<std::sync::Arc<Settings>, SettingsError> {
        let current = self.current();
        let mut next = patch.apply(&current);
        next.version = current.version + 1;
        if let Err(err) = next.validate() {
            if !force {
                return Err(err);
            }
            warn!("applying settings patch despite validation failure: {err}");
        }
        let next = std::sync::Arc::new(next);
        if !dry_run {
            self.tx.send_replace(next.clone());
            debug!(version = next.version, "settings updated");
        }
        Ok(next)
    }
}

/// Spawns the file watcher: polls `path` at `poll` cadence and applies the
/// file contents as a patch whenever the modification time changes.
pub fn spawn_file_watcher(
    handle: SettingsHandle,
    path: PathBuf,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_mtime = None;
        loop {
            tokio::time::sleep(poll).await;
            let mtime = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if last_mtime == Some(mtime) {
                continue;
            }
            last_mtime = Some(mtime);
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(err) => {
                    warn!("failed to read settings file {:?}: {err}", path);
                    continue;
                }
            };
            match toml::from_str::<SettingsPatch>(&contents) {
                Ok(patch) => {
                    if let Err(err) = handle.apply(&patch, false, false) {
                        warn!("rejected settings reload from {:?}: {err}", path);
                    }
                }
                Err(err) => warn!("unparseable settings file {:?}: {err}", path),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn patch_bumps_version_and_publishes() {
        let handle = SettingsHandle::default();
        let patch = SettingsPatch { lease_time: Some(30), ..Default::default() };
        let next = handle.apply(&patch, false, false).unwrap();
        assert_eq!(next.version, 1);
        assert_eq!(handle.current().lease_time, 30);
    }

    #[test]
    fn dry_run_does_not_publish() {
        let handle = SettingsHandle::default();
        let patch = SettingsPatch { lease_time: Some(30), ..Default::default() };
        let preview = handle.apply(&patch, false, true).unwrap();
        assert_eq!(preview.lease_time, 30);
        assert_eq!(handle.current().lease_time, 90);
        assert_eq!(handle.current().version, 0);
    }

    #[test]
    fn invalid_patch_rejected_unless_forced() {
        let handle = SettingsHandle::default();
        let patch = SettingsPatch { lease_time: Some(0), ..Default::default() };
        assert!(handle.apply(&patch, false, false).is_err());
        assert_eq!(handle.current().version, 0);
        handle.apply(&patch, true, false).unwrap();
        assert_eq!(handle.current().lease_time, 0);
    }

    #[test]
    fn patch_parses_from_partial_toml() {
        let patch: SettingsPatch =
            toml::from_str("lease_time = 45\nblocked_operations = [\"rename\"]").unwrap();
        assert_eq!(patch.lease_time, Some(45));
        assert_eq!(patch.blocked_operations, Some(vec![BlockedOp::Rename]));
    }

    #[tokio::test]
    async fn file_watcher_applies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        tokio::fs::write(&path, "lease_time = 15").await.unwrap();

        let handle = SettingsHandle::default();
        let mut sub = handle.subscribe();
        let task = spawn_file_watcher(handle.clone(), path, Duration::from_millis(10));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                sub.changed().await.unwrap();
                if sub.borrow().lease_time == 15 {
                    break;
                }
            }
        })
        .await
        .expect("watcher applied the file");
        task.abort();
    }
}
