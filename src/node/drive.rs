//! Drive reconciler
//!
//! Drives one node's Drive records through their lifecycle:
//!
//! ```text
//! Available ──format──▶ Ready ◀──▶ InUse
//!     ▲                   │
//!     └──unrelease── Released ◀──release
//!
//! any ──delete──▶ Terminating ──(no volumes)──▶ unmount, drop data-protection
//! ```
//!
//! Host side effects (unmount, mkfs, mount) happen first; the record is then
//! written with a single CAS so a failed reconcile leaves no half-applied
//! state behind.

use super::config::{NodeConfig, DEFAULT_MOUNT_OPTIONS};
use crate::controlplane::validation::validate_drive;
use crate::crd::{
    condition, AccessTier, Drive, DrivePhase, DriveRequest, DriveStatus,
    DATA_PROTECTION_FINALIZER,
};
use crate::dispatcher::{EventKind, Handler};
use crate::domain::ports::{MountFlags, Runtime, UnmountFlags};
use crate::error::{Error, Result};
use crate::hardware::mount::{force_unmount, safe_mount, safe_unmount};
use crate::hardware::probe;
use crate::labels::{get_label, LabelKey};
use crate::store::{retry_on_conflict, retry_on_conflict_opt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciles the Drive records of one node
pub struct DriveReconciler {
    rt: Runtime,
    config: Arc<NodeConfig>,
}

impl DriveReconciler {
    pub fn new(rt: Runtime, config: Arc<NodeConfig>) -> Self {
        Self { rt, config }
    }

    /// Bring `drive` one step closer to its desired state
    pub async fn reconcile(&self, drive: &Drive) -> Result<()> {
        if drive.is_terminating() {
            return self.terminate(drive).await;
        }
        match drive.spec.request {
            Some(DriveRequest::Release) => return self.release(drive).await,
            Some(DriveRequest::Unrelease) => return self.unrelease(drive).await,
            None => {}
        }
        if drive.spec.owned && drive.spec.requested_format.is_some() {
            return self.format_and_mount(drive).await;
        }
        self.settle(drive).await
    }

    // =========================================================================
    // Formatting
    // =========================================================================

    async fn format_and_mount(&self, drive: &Drive) -> Result<()> {
        let name = drive.name_any();
        let status = drive.status_or_default();

        let rejection = match validate_drive(None, drive) {
            Err(rejection) => Some(rejection.reason().to_string()),
            Ok(()) if status.drive_status != DrivePhase::Available => {
                Some(format!("Drive is {} and cannot be formatted", status.drive_status))
            }
            Ok(()) => None,
        };
        if let Some(message) = rejection {
            warn!(drive = %name, path = %status.path, reason = %message, "format request rejected");
            return self.reject_format(&name, &message).await;
        }

        let Some(request) = drive.spec.requested_format.clone() else {
            return Ok(());
        };
        let device = PathBuf::from(&status.path);

        for mount_point in status.mount_points.iter().chain(Some(&status.mountpoint)) {
            if mount_point.is_empty() {
                continue;
            }
            let mounter = Arc::clone(&self.rt.mounter);
            let target = PathBuf::from(mount_point);
            self.rt
                .blocking("force_unmount", move || force_unmount(mounter.as_ref(), &target))
                .await?;
        }

        let fs_uuid = uuid::Uuid::new_v4().to_string();
        info!(drive = %name, path = %status.path, fs_uuid = %fs_uuid, "formatting drive");
        self.rt
            .formatter
            .format_xfs(&device, &fs_uuid, request.force)
            .await?;

        let probe_device = device.clone();
        let fs = self
            .rt
            .blocking("probe", move || probe::probe_device_filesystem(&probe_device, 0))
            .await?;
        if fs.uuid != fs_uuid {
            return Err(Error::Corrupt {
                device: status.path.clone(),
                offset: 0,
                reason: format!("superblock UUID {} does not match {}", fs.uuid, fs_uuid),
            });
        }

        let target = if request.mountpoint.is_empty() {
            self.config.drive_mount_path(&fs_uuid)
        } else {
            PathBuf::from(&request.mountpoint)
        };
        let options: Vec<String> = if request.mount_options.is_empty() {
            DEFAULT_MOUNT_OPTIONS.iter().map(|o| o.to_string()).collect()
        } else {
            request.mount_options.clone()
        };

        let mounter = Arc::clone(&self.rt.mounter);
        let (mount_source, mount_target, data) = (device.clone(), target.clone(), options.join(","));
        self.rt
            .blocking("mount", move || {
                safe_mount(
                    mounter.as_ref(),
                    &mount_source,
                    &mount_target,
                    "xfs",
                    MountFlags::default(),
                    &data,
                )
            })
            .await?;

        let access_tier = get_label(drive.labels(), LabelKey::ACCESS_TIER)
            .and_then(AccessTier::parse)
            .unwrap_or_default();
        let topology = self.config.topology();
        let target = target.display().to_string();
        let now = self.rt.now();

        retry_on_conflict(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
            d.spec.requested_format = None;
            d.add_finalizer(DATA_PROTECTION_FINALIZER);
            let s = d.status.get_or_insert_with(DriveStatus::default);
            s.filesystem = "xfs".to_string();
            s.filesystem_uuid = fs_uuid.clone();
            s.total_capacity = fs.total_capacity;
            s.allocated_capacity = 0;
            s.free_capacity = fs.total_capacity;
            s.mountpoint = target.clone();
            s.mount_points = vec![target.clone()];
            s.mount_options = options.clone();
            s.access_tier = access_tier;
            s.topology = topology.clone();
            for c in [
                condition::OWNED,
                condition::FORMATTED,
                condition::MOUNTED,
                condition::INITIALIZED,
                condition::READY,
            ] {
                s.set_condition(c, true, "Formatted", "", now);
            }
            s.drive_status = DrivePhase::Ready;
            Ok(true)
        })
        .await?;

        info!(drive = %name, mountpoint = %target, capacity = fs.total_capacity, "drive is ready");
        Ok(())
    }

    async fn reject_format(&self, name: &str, message: &str) -> Result<()> {
        let now = self.rt.now();
        retry_on_conflict_opt(self.rt.drives.as_ref(), name, |d: &mut Drive| {
            d.spec.requested_format = None;
            d.status
                .get_or_insert_with(DriveStatus::default)
                .set_condition(condition::INITIALIZED, false, "FormatRejected", message, now);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Release
    // =========================================================================

    async fn release(&self, drive: &Drive) -> Result<()> {
        let name = drive.name_any();
        let status = drive.status_or_default();

        if status.drive_status != DrivePhase::Ready || drive.has_volume_finalizers() {
            warn!(drive = %name, status = %status.drive_status, "only Ready drives without volumes can be released");
            return self.clear_request(&name).await;
        }

        if !status.mountpoint.is_empty() {
            let mounter = Arc::clone(&self.rt.mounter);
            let target = PathBuf::from(&status.mountpoint);
            self.rt
                .blocking("unmount", move || {
                    safe_unmount(mounter.as_ref(), &target, UnmountFlags::default())
                })
                .await?;
        }

        let now = self.rt.now();
        retry_on_conflict(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
            d.spec.request = None;
            d.spec.owned = false;
            let s = d.status.get_or_insert_with(DriveStatus::default);
            s.mountpoint.clear();
            s.mount_points.clear();
            s.mount_options.clear();
            s.set_condition(condition::OWNED, false, "Released", "", now);
            s.set_condition(condition::MOUNTED, false, "Released", "", now);
            s.set_condition(condition::READY, false, "Released", "", now);
            s.drive_status = DrivePhase::Released;
            Ok(true)
        })
        .await?;
        info!(drive = %name, "drive released");
        Ok(())
    }

    async fn unrelease(&self, drive: &Drive) -> Result<()> {
        let name = drive.name_any();
        if drive.phase() != DrivePhase::Released {
            debug!(drive = %name, status = %drive.phase(), "unrelease ignored");
            return self.clear_request(&name).await;
        }

        let now = self.rt.now();
        retry_on_conflict(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
            d.spec.request = None;
            d.remove_finalizer(DATA_PROTECTION_FINALIZER);
            let s = d.status.get_or_insert_with(DriveStatus::default);
            s.set_condition(condition::INITIALIZED, false, "Unreleased", "", now);
            s.drive_status = DrivePhase::Available;
            Ok(true)
        })
        .await?;
        info!(drive = %name, "drive unreleased");
        Ok(())
    }

    async fn clear_request(&self, name: &str) -> Result<()> {
        retry_on_conflict_opt(self.rt.drives.as_ref(), name, |d: &mut Drive| {
            Ok(d.spec.request.take().is_some())
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    async fn terminate(&self, drive: &Drive) -> Result<()> {
        let name = drive.name_any();
        let now = self.rt.now();

        if drive.has_volume_finalizers() {
            retry_on_conflict_opt(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
                let s = d.status.get_or_insert_with(DriveStatus::default);
                if s.drive_status == DrivePhase::Terminating {
                    return Ok(false);
                }
                s.drive_status = DrivePhase::Terminating;
                s.set_condition(condition::READY, false, "Terminating", "", now);
                Ok(true)
            })
            .await?;
            info!(drive = %name, volumes = ?drive.volume_names(), "drive terminating; waiting for volumes");
            return Ok(());
        }

        let mountpoint = drive.status_or_default().mountpoint;
        if !mountpoint.is_empty() {
            let mounter = Arc::clone(&self.rt.mounter);
            let target = PathBuf::from(&mountpoint);
            self.rt
                .blocking("force_unmount", move || force_unmount(mounter.as_ref(), &target))
                .await?;
        }

        retry_on_conflict_opt(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
            d.remove_finalizer(DATA_PROTECTION_FINALIZER);
            let s = d.status.get_or_insert_with(DriveStatus::default);
            s.drive_status = DrivePhase::Terminating;
            s.mountpoint.clear();
            s.mount_points.clear();
            s.set_condition(condition::MOUNTED, false, "Terminating", "", now);
            s.set_condition(condition::READY, false, "Terminating", "", now);
            Ok(true)
        })
        .await?;

        if drive.metadata.deletion_timestamp.is_none() {
            match self.rt.drives.delete(&name).await {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        info!(drive = %name, "drive torn down");
        Ok(())
    }

    // =========================================================================
    // Steady State
    // =========================================================================

    async fn settle(&self, drive: &Drive) -> Result<()> {
        let now = self.rt.now();
        let mut probe = drive.clone();
        if !settle_phase(&mut probe, now) {
            return Ok(());
        }
        let name = drive.name_any();
        let updated = retry_on_conflict_opt(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
            Ok(settle_phase(d, now))
        })
        .await?;
        if let Some(d) = updated {
            debug!(drive = %name, status = %d.phase(), "drive phase settled");
        }
        Ok(())
    }
}

/// Derive InUse/Ready from the volume finalizers, the Ready condition from
/// the lifecycle conditions, and free capacity from allocations. Returns
/// whether anything changed.
pub fn settle_phase(drive: &mut Drive, now: DateTime<Utc>) -> bool {
    let has_volumes = drive.has_volume_finalizers();
    let Some(s) = drive.status.as_mut() else {
        return false;
    };
    let before = s.clone();

    s.drive_status = match s.drive_status {
        DrivePhase::Ready if has_volumes => DrivePhase::InUse,
        DrivePhase::InUse if !has_volumes => DrivePhase::Ready,
        phase => phase,
    };
    let ready =
        s.is_initialized() && matches!(s.drive_status, DrivePhase::Ready | DrivePhase::InUse);
    if s.condition_true(condition::READY) != ready {
        s.set_condition(condition::READY, ready, "Reconciled", "", now);
    }
    if matches!(s.drive_status, DrivePhase::Ready | DrivePhase::InUse) {
        s.free_capacity = s.total_capacity.saturating_sub(s.allocated_capacity);
    }

    *s != before
}

#[async_trait]
impl Handler<Drive> for DriveReconciler {
    async fn handle(&self, kind: EventKind, drive: &Drive) -> Result<()> {
        if drive.node_name() != self.config.node_id {
            return Ok(());
        }
        if kind == EventKind::Delete {
            debug!(drive = %drive.name_any(), "drive record removed");
            return Ok(());
        }
        // Work from the latest version; the queued copy may be stale.
        match self.rt.drives.get_opt(&drive.name_any()).await? {
            Some(latest) => self.reconcile(&latest).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{volume_finalizer, DriveSpec, RequestedFormat};
    use crate::labels::set_label;
    use crate::testing::{runtime, Fakes};
    use tempfile::TempDir;

    const SIZE: u64 = 8 * 1024 * 1024;

    struct Env {
        _dir: TempDir,
        device: PathBuf,
        reconciler: DriveReconciler,
        rt: Runtime,
        fakes: Fakes,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("sdb");
        std::fs::write(&device, vec![0u8; SIZE as usize]).unwrap();

        let (rt, fakes) = runtime();
        fakes.mounter.register_device(&device, 8, 16);
        let config = Arc::new(NodeConfig {
            node_id: "node1".into(),
            mount_root: dir.path().join("mnt"),
            ..Default::default()
        });
        Env {
            reconciler: DriveReconciler::new(rt.clone(), config),
            _dir: dir,
            device,
            rt,
            fakes,
        }
    }

    async fn seed(env: &Env, format: Option<RequestedFormat>) -> Drive {
        let mut d = Drive::new(
            "node1-sdb",
            DriveSpec {
                owned: format.is_some(),
                requested_format: format,
                ..Default::default()
            },
        );
        set_label(d.labels_mut(), LabelKey::ACCESS_TIER, "Hot");
        d.status = Some(DriveStatus {
            drive_status: DrivePhase::Available,
            node_name: "node1".into(),
            path: env.device.display().to_string(),
            total_capacity: SIZE,
            free_capacity: SIZE,
            ..Default::default()
        });
        env.rt.drives.create(&d).await.unwrap()
    }

    fn xfs() -> Option<RequestedFormat> {
        Some(RequestedFormat {
            filesystem: "xfs".into(),
            ..Default::default()
        })
    }

    async fn reconcile(env: &Env, name: &str) -> Option<Drive> {
        let d = env.rt.drives.get(name).await.unwrap();
        env.reconciler.reconcile(&d).await.unwrap();
        env.rt.drives.get_opt(name).await.unwrap()
    }

    async fn ready_drive(env: &Env) -> Drive {
        seed(env, xfs()).await;
        reconcile(env, "node1-sdb").await.unwrap()
    }

    #[tokio::test]
    async fn test_format_mounts_and_protects() {
        let env = env();
        let d = ready_drive(&env).await;
        let s = d.status.clone().unwrap();

        assert_eq!(s.drive_status, DrivePhase::Ready);
        assert!(s.is_initialized());
        assert!(s.condition_true(condition::READY));
        assert!(d.has_finalizer(DATA_PROTECTION_FINALIZER));
        assert!(d.spec.requested_format.is_none());
        assert_eq!(s.access_tier, AccessTier::Hot);
        assert_eq!(s.total_capacity, SIZE);
        assert_eq!(s.free_capacity + s.allocated_capacity, s.total_capacity);
        assert_eq!(s.mount_options, vec!["prjquota"]);

        let formatted = env.fakes.formatter.formatted();
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0].1, s.filesystem_uuid);
        assert!(s.mountpoint.ends_with(&s.filesystem_uuid));
        let mount = env.fakes.mounter.mounted_at(s.mountpoint.as_ref()).unwrap();
        assert_eq!((mount.major, mount.minor), (8, 16));
    }

    #[tokio::test]
    async fn test_rejected_format_is_recorded_once() {
        let env = env();
        seed(
            &env,
            Some(RequestedFormat {
                filesystem: "ext4".into(),
                ..Default::default()
            }),
        )
        .await;

        let d = reconcile(&env, "node1-sdb").await.unwrap();
        let s = d.status.unwrap();
        assert!(d.spec.requested_format.is_none());
        assert_eq!(s.drive_status, DrivePhase::Available);
        assert!(!s.condition_true(condition::INITIALIZED));
        assert!(s
            .conditions
            .iter()
            .any(|c| c.message == "Only XFS is supported"));
        assert!(env.fakes.formatter.formatted().is_empty());
    }

    #[tokio::test]
    async fn test_volume_finalizers_drive_in_use() {
        let env = env();
        let mut d = ready_drive(&env).await;
        d.add_finalizer(&volume_finalizer("pvc-1"));
        env.rt.drives.update(&d).await.unwrap();

        let d = reconcile(&env, "node1-sdb").await.unwrap();
        assert_eq!(d.phase(), DrivePhase::InUse);

        let mut d = d;
        d.remove_finalizer(&volume_finalizer("pvc-1"));
        env.rt.drives.update(&d).await.unwrap();
        let d = reconcile(&env, "node1-sdb").await.unwrap();
        assert_eq!(d.phase(), DrivePhase::Ready);
    }

    #[tokio::test]
    async fn test_release_and_unrelease() {
        let env = env();
        let mut d = ready_drive(&env).await;
        let mountpoint = d.status_or_default().mountpoint;
        d.spec.request = Some(DriveRequest::Release);
        env.rt.drives.update(&d).await.unwrap();

        let d = reconcile(&env, "node1-sdb").await.unwrap();
        assert_eq!(d.phase(), DrivePhase::Released);
        assert!(!d.spec.owned);
        assert!(d.spec.request.is_none());
        assert!(d.has_finalizer(DATA_PROTECTION_FINALIZER));
        assert!(env.fakes.mounter.mounted_at(mountpoint.as_ref()).is_none());

        let mut d = d;
        d.spec.request = Some(DriveRequest::Unrelease);
        env.rt.drives.update(&d).await.unwrap();
        let d = reconcile(&env, "node1-sdb").await.unwrap();
        assert_eq!(d.phase(), DrivePhase::Available);
        assert!(!d.has_finalizer(DATA_PROTECTION_FINALIZER));
    }

    #[tokio::test]
    async fn test_release_of_in_use_drive_is_ignored() {
        let env = env();
        let mut d = ready_drive(&env).await;
        d.add_finalizer(&volume_finalizer("pvc-1"));
        d.spec.request = Some(DriveRequest::Release);
        env.rt.drives.update(&d).await.unwrap();

        let d = reconcile(&env, "node1-sdb").await.unwrap();
        assert!(d.spec.request.is_none());
        assert!(d.spec.owned);
        assert_ne!(d.phase(), DrivePhase::Released);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_volumes() {
        let env = env();
        let mut d = ready_drive(&env).await;
        let mountpoint = d.status_or_default().mountpoint;
        d.add_finalizer(&volume_finalizer("pvc-1"));
        env.rt.drives.update(&d).await.unwrap();
        env.rt.drives.delete("node1-sdb").await.unwrap();

        let d = reconcile(&env, "node1-sdb").await.unwrap();
        assert_eq!(d.phase(), DrivePhase::Terminating);
        assert!(env.fakes.mounter.mounted_at(mountpoint.as_ref()).is_some());

        let mut d = d;
        d.remove_finalizer(&volume_finalizer("pvc-1"));
        env.rt.drives.update(&d).await.unwrap();
        assert!(reconcile(&env, "node1-sdb").await.is_none());
        assert!(env.fakes.mounter.mounted_at(mountpoint.as_ref()).is_none());
    }

    #[tokio::test]
    async fn test_other_nodes_are_ignored() {
        let env = env();
        let mut d = seed(&env, xfs()).await;
        d.status.as_mut().unwrap().node_name = "node2".into();
        env.reconciler.handle(EventKind::Update, &d).await.unwrap();
        assert!(env.fakes.formatter.formatted().is_empty());
    }
}
