//! The persistent binding registry (spec.md §4.B): the durable mapping
//! from bus-ids to shared status, plus the transient attachment state
//! that is rebuilt on every restart (invariant 3, spec.md §3).
//!
//! Durability is a JSON file under the registry root, written with the
//! write-tmp-then-rename pattern so a crash mid-write never corrupts
//! the previous good state (same approach as a `wormhole.json`
//! rewrite in the pack's CLI tooling).

use crate::bus_id::BusId;
use crate::privilege::PrivilegeChecker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// The durable fields of a bound device (spec.md §3 "SharedDevice").
/// `attachment` is intentionally not part of this type: it is
/// transient and lives only in [`RegistryEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDeviceRecord {
    pub bus_id: BusId,
    pub persistent_guid: Uuid,
    pub stub_description: String,
    pub instance_id: String,
}

/// spec.md §3 "AttachmentState".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttachmentState {
    #[default]
    Unattached,
    Attached {
        client_address: SocketAddr,
        session_id: u64,
    },
}

/// A read-only snapshot combining durable and transient state, as
/// returned by `listShared`/`listPersisted`.
#[derive(Debug, Clone)]
pub struct SharedDevice {
    pub record: SharedDeviceRecord,
    pub attachment: AttachmentState,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    record: SharedDeviceRecord,
    attachment: AttachmentState,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("bus-id {0} is already shared")]
    AlreadyShared(BusId),
    #[error("bus-id {0} is not currently present")]
    NotPresent(BusId),
    #[error("caller lacks write access to the registry")]
    AccessDenied,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnbindError {
    #[error("bus-id {0} is not shared")]
    NotShared(BusId),
    #[error("no shared device with guid {0}")]
    NotFound(Uuid),
    #[error("caller lacks write access to the registry")]
    AccessDenied,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("bus-id {0} is already attached")]
    AlreadyAttached(BusId),
    #[error("bus-id {0} is not shared")]
    NotShared(BusId),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    devices: Vec<SharedDeviceRecord>,
}

/// The registry itself. Cheap to clone: the state lives behind an
/// `Arc<Mutex<_>>`, matching the rest of the core's "coarse lock,
/// narrow critical section" style.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<Uuid, RegistryEntry>>>,
    path: PathBuf,
    privilege: Arc<dyn PrivilegeChecker>,
}

impl Registry {
    /// Loads the registry from `path` if it exists; otherwise starts
    /// empty (first run). Every entry's `AttachmentState` starts
    /// `Unattached` regardless of what was persisted, because
    /// attachment is never written to disk.
    pub async fn open(path: impl Into<PathBuf>, privilege: Arc<dyn PrivilegeChecker>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut map = HashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes)
                    .map_err(|e| anyhow::anyhow!("corrupt registry at {}: {e}", path.display()))?;
                for record in state.devices {
                    map.insert(
                        record.persistent_guid,
                        RegistryEntry {
                            record,
                            attachment: AttachmentState::Unattached,
                        },
                    );
                }
                info!(count = map.len(), path = %path.display(), "loaded binding registry");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no existing registry, starting empty");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(map)),
            path,
            privilege,
        })
    }

    async fn persist(&self, map: &HashMap<Uuid, RegistryEntry>) -> anyhow::Result<()> {
        let state = PersistedState {
            devices: map.values().map(|e| e.record.clone()).collect(),
        };
        let json = serde_json::to_vec_pretty(&state)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    fn check_write_access(&self) -> Result<(), ()> {
        if self.privilege.has_write_access() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Idempotent: binding an already-shared bus-id is `AlreadyShared`,
    /// not a panic or silent overwrite (spec.md §7 "Binding operations
    /// are idempotent").
    pub async fn bind(
        &self,
        bus_id: BusId,
        description: String,
        instance_id: String,
        currently_present: bool,
    ) -> Result<Uuid, BindError> {
        if self.check_write_access().is_err() {
            return Err(BindError::AccessDenied);
        }
        if !currently_present {
            return Err(BindError::NotPresent(bus_id));
        }
        let mut map = self.inner.lock().await;
        if map.values().any(|e| e.record.bus_id == bus_id) {
            return Err(BindError::AlreadyShared(bus_id));
        }
        let guid = Uuid::new_v4();
        let record = SharedDeviceRecord {
            bus_id,
            persistent_guid: guid,
            stub_description: description,
            instance_id,
        };
        map.insert(
            guid,
            RegistryEntry {
                record,
                attachment: AttachmentState::Unattached,
            },
        );
        self.persist(&map).await.map_err(|e| {
            warn!("failed to persist registry after bind: {e:#}");
            BindError::AccessDenied
        })?;
        info!(%bus_id, %guid, "bound device");
        Ok(guid)
    }

    pub async fn unbind(&self, bus_id: BusId) -> Result<(), UnbindError> {
        if self.check_write_access().is_err() {
            return Err(UnbindError::AccessDenied);
        }
        let mut map = self.inner.lock().await;
        let guid = map
            .iter()
            .find(|(_, e)| e.record.bus_id == bus_id)
            .map(|(g, _)| *g)
            .ok_or(UnbindError::NotShared(bus_id))?;
        map.remove(&guid);
        self.persist(&map).await.map_err(|e| {
            warn!("failed to persist registry after unbind: {e:#}");
            UnbindError::AccessDenied
        })?;
        info!(%bus_id, "unbound device");
        Ok(())
    }

    pub async fn unbind_by_guid(&self, guid: Uuid) -> Result<(), UnbindError> {
        if self.check_write_access().is_err() {
            return Err(UnbindError::AccessDenied);
        }
        let mut map = self.inner.lock().await;
        if map.remove(&guid).is_none() {
            return Err(UnbindError::NotFound(guid));
        }
        self.persist(&map).await.map_err(|e| {
            warn!("failed to persist registry after unbind: {e:#}");
            UnbindError::AccessDenied
        })?;
        info!(%guid, "unbound device by guid");
        Ok(())
    }

    pub async fn unbind_all(&self) -> Result<(), UnbindError> {
        if self.check_write_access().is_err() {
            return Err(UnbindError::AccessDenied);
        }
        let mut map = self.inner.lock().await;
        map.clear();
        self.persist(&map).await.map_err(|e| {
            warn!("failed to persist registry after unbind-all: {e:#}");
            UnbindError::AccessDenied
        })?;
        info!("unbound all devices");
        Ok(())
    }

    /// Atomic test-and-set: only one caller observes success for a
    /// given bus-id (spec.md §4.B "Concurrency", invariant 1).
    pub async fn mark_attached(
        &self,
        bus_id: BusId,
        client_address: SocketAddr,
        session_id: u64,
    ) -> Result<(), AttachError> {
        let mut map = self.inner.lock().await;
        let entry = map
            .values_mut()
            .find(|e| e.record.bus_id == bus_id)
            .ok_or(AttachError::NotShared(bus_id))?;
        if entry.attachment != AttachmentState::Unattached {
            return Err(AttachError::AlreadyAttached(bus_id));
        }
        entry.attachment = AttachmentState::Attached {
            client_address,
            session_id,
        };
        info!(%bus_id, %client_address, "marked attached");
        Ok(())
    }

    /// Idempotent no-op if the bus-id is unknown or already detached.
    pub async fn mark_detached(&self, bus_id: BusId) {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.values_mut().find(|e| e.record.bus_id == bus_id) {
            entry.attachment = AttachmentState::Unattached;
            info!(%bus_id, "marked detached");
        }
    }

    pub async fn is_shared(&self, bus_id: BusId) -> bool {
        self.inner.lock().await.values().any(|e| e.record.bus_id == bus_id)
    }

    pub async fn list_shared(&self) -> Vec<SharedDevice> {
        self.inner
            .lock()
            .await
            .values()
            .map(|e| SharedDevice {
                record: e.record.clone(),
                attachment: e.attachment.clone(),
            })
            .collect()
    }

    /// Those in `listShared()` whose bus-id has no matching connected
    /// device (spec.md §4.B).
    pub async fn list_persisted(&self, currently_connected: &[BusId]) -> Vec<SharedDevice> {
        self.inner
            .lock()
            .await
            .values()
            .filter(|e| !currently_connected.contains(&e.record.bus_id))
            .map(|e| SharedDevice {
                record: e.record.clone(),
                attachment: e.attachment.clone(),
            })
            .collect()
    }
}

/// Default root for the persisted registry file, analogous to
/// spec.md §6's `SOFTWARE/<product>/Devices` hive key.
pub fn default_registry_path() -> PathBuf {
    Path::new("/var/lib/usbipd/devices.json").to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::{AlwaysAllow, AlwaysDeny};

    async fn open_tmp(privilege: Arc<dyn PrivilegeChecker>) -> (Registry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let reg = Registry::open(path, privilege).await.unwrap();
        (reg, dir)
    }

    #[tokio::test]
    async fn bind_unbind_restores_empty_state() {
        let (reg, _dir) = open_tmp(Arc::new(AlwaysAllow)).await;
        let b = "3-4".parse().unwrap();
        reg.bind(b, "desc".into(), "USB\\VID_0000&PID_0000".into(), true)
            .await
            .unwrap();
        assert_eq!(reg.list_shared().await.len(), 1);
        reg.unbind(b).await.unwrap();
        assert_eq!(reg.list_shared().await.len(), 0);
    }

    #[tokio::test]
    async fn double_bind_then_unbind_same_as_single() {
        let (reg, _dir) = open_tmp(Arc::new(AlwaysAllow)).await;
        let b = "3-4".parse().unwrap();
        reg.bind(b, "desc".into(), "inst".into(), true).await.unwrap();
        assert_eq!(
            reg.bind(b, "desc".into(), "inst".into(), true).await,
            Err(BindError::AlreadyShared(b))
        );
        reg.unbind(b).await.unwrap();
        assert_eq!(reg.list_shared().await.len(), 0);
    }

    #[tokio::test]
    async fn bind_rejects_absent_device() {
        let (reg, _dir) = open_tmp(Arc::new(AlwaysAllow)).await;
        let b = "3-4".parse().unwrap();
        assert_eq!(
            reg.bind(b, "desc".into(), "inst".into(), false).await,
            Err(BindError::NotPresent(b))
        );
    }

    #[tokio::test]
    async fn mutations_denied_without_privilege() {
        let (reg, _dir) = open_tmp(Arc::new(AlwaysDeny)).await;
        let b = "3-4".parse().unwrap();
        assert_eq!(
            reg.bind(b, "desc".into(), "inst".into(), true).await,
            Err(BindError::AccessDenied)
        );
    }

    #[tokio::test]
    async fn attach_exclusivity() {
        let (reg, _dir) = open_tmp(Arc::new(AlwaysAllow)).await;
        let b = "3-4".parse().unwrap();
        reg.bind(b, "desc".into(), "inst".into(), true).await.unwrap();
        let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        reg.mark_attached(b, addr, 1).await.unwrap();
        assert_eq!(
            reg.mark_attached(b, addr, 2).await,
            Err(AttachError::AlreadyAttached(b))
        );
        reg.mark_detached(b).await;
        reg.mark_attached(b, addr, 3).await.unwrap();
    }

    #[tokio::test]
    async fn restart_resets_attachment_but_keeps_binding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let b = "3-4".parse().unwrap();
        {
            let reg = Registry::open(&path, Arc::new(AlwaysAllow)).await.unwrap();
            reg.bind(b, "desc".into(), "inst".into(), true).await.unwrap();
            let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
            reg.mark_attached(b, addr, 1).await.unwrap();
        }
        let reg = Registry::open(&path, Arc::new(AlwaysAllow)).await.unwrap();
        let shared = reg.list_shared().await;
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].attachment, AttachmentState::Unattached);
    }

    #[tokio::test]
    async fn list_persisted_excludes_connected() {
        let (reg, _dir) = open_tmp(Arc::new(AlwaysAllow)).await;
        let present = "3-4".parse().unwrap();
        let unplugged = "5-6".parse().unwrap();
        reg.bind(present, "d".into(), "i".into(), true).await.unwrap();
        reg.bind(unplugged, "d".into(), "i".into(), true).await.unwrap();
        let persisted = reg.list_persisted(&[present]).await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].record.bus_id, unplugged);
    }
}
