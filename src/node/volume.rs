//! Node volume service
//!
//! Stages a volume by bind-mounting its data root `<drive mount>/<volume>`
//! onto the CSI staging path under an XFS project quota, then publishes it
//! by bind-mounting the staging path into the container.

use super::config::NodeConfig;
use crate::crd::volume::condition;
use crate::crd::{Drive, Volume, VolumeStatus};
use crate::csi::{
    CsiNode, NodeCapability, NodeGetInfoResponse, NodeGetVolumeStatsRequest,
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, Topology, VolumeUsage, POD_NAMESPACE_CONTEXT_KEY,
    POD_NAME_CONTEXT_KEY,
};
use crate::dispatcher::{EventKind, Handler};
use crate::domain::ports::{MountFlags, Runtime, UnmountFlags};
use crate::error::{Error, ErrorKind, Result};
use crate::hardware::mount::{allocate_project_id, ensure_dir, is_mounted, safe_mount, safe_unmount};
use crate::labels::{LabelKey, LabelSelector};
use crate::metrics;
use crate::store::retry_on_conflict_opt;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{field} missing in request")));
    }
    Ok(())
}

fn remove_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// CSI node service of one node agent
pub struct NodeServer {
    rt: Runtime,
    config: Arc<NodeConfig>,
}

impl NodeServer {
    pub fn new(rt: Runtime, config: Arc<NodeConfig>) -> Self {
        Self { rt, config }
    }

    /// Volume bound to this node
    async fn local_volume(&self, id: &str) -> Result<Volume> {
        let volume = self.rt.volumes.get(id).await?;
        if volume.spec.node_name != self.config.node_id {
            return Err(Error::FailedPrecondition(format!(
                "volume {id} is bound to node {}, not {}",
                volume.spec.node_name, self.config.node_id
            )));
        }
        Ok(volume)
    }

    /// Drive of `volume` and the volume's data root on it
    async fn data_root(&self, volume: &Volume) -> Result<(Drive, PathBuf)> {
        let drive = self.rt.drives.get(&volume.spec.drive).await?;
        let mountpoint = drive.status_or_default().mountpoint;
        if mountpoint.is_empty() {
            return Err(Error::FailedPrecondition(format!(
                "drive {} on node {} is not mounted",
                drive.status_or_default().path,
                self.config.node_id
            )));
        }
        let root = Path::new(&mountpoint).join(volume.name_any());
        Ok((drive, root))
    }

    /// Project id recorded on the volume, or a fresh one clear of its
    /// neighbours on the same drive
    async fn project_id(&self, volume: &Volume) -> Result<u32> {
        let recorded = volume.status_or_default().project_id;
        if recorded != 0 {
            return Ok(recorded);
        }
        let selector = LabelSelector::everything().with(LabelKey::DRIVE, volume.spec.drive.as_str());
        let name = volume.name_any();
        let taken: HashSet<u32> = self
            .rt
            .volumes
            .list(&selector)
            .await?
            .iter()
            .filter(|v| v.name_any() != name)
            .map(|v| v.status_or_default().project_id)
            .filter(|id| *id != 0)
            .collect();
        let uid = volume.uid().unwrap_or_else(|| name.clone());
        Ok(allocate_project_id(&uid, &taken))
    }

    async fn update_status<F>(&self, id: &str, mut apply: F) -> Result<()>
    where
        F: FnMut(&mut VolumeStatus) -> bool,
    {
        retry_on_conflict_opt(self.rt.volumes.as_ref(), id, |v: &mut Volume| {
            Ok(apply(v.status.get_or_insert_with(VolumeStatus::default)))
        })
        .await?;
        Ok(())
    }

    async fn stage(&self, req: &NodeStageVolumeRequest) -> Result<()> {
        let volume = self.local_volume(&req.volume_id).await?;
        let staged_at = volume.status_or_default().staging_path;
        if !staged_at.is_empty() && staged_at != req.staging_target_path {
            return Err(Error::AlreadyExists {
                kind: "StagedVolume".to_string(),
                name: format!("{} at {}", req.volume_id, staged_at),
            });
        }
        let (drive, data_root) = self.data_root(&volume).await?;
        let device = PathBuf::from(drive.status_or_default().path);
        let staging = PathBuf::from(&req.staging_target_path);
        let project_id = self.project_id(&volume).await?;
        let limit = volume.spec.total_capacity;

        let mounter = self.rt.mounter.clone();
        let quota = self.rt.quota.clone();
        let (root, target) = (data_root.clone(), staging.clone());
        self.rt
            .blocking("stage", move || {
                ensure_dir(&root)?;
                safe_mount(mounter.as_ref(), &root, &target, "", MountFlags::bind(), "")?;
                // A zero hard limit reads as "no limit" to XFS.
                if limit == 0 {
                    return Ok(());
                }
                let current = quota.get_project_quota(&device, project_id)?;
                if current.map(|q| q.hard_limit) != Some(limit) {
                    quota.set_project_quota(&device, &root, project_id, limit)?;
                }
                Ok(())
            })
            .await?;

        let now = self.rt.now();
        let staging_path = req.staging_target_path.clone();
        self.update_status(&req.volume_id, |s| {
            let before = s.clone();
            s.staging_path = staging_path.clone();
            s.project_id = project_id;
            if s.available_capacity == 0 && s.used_capacity == 0 {
                s.available_capacity = limit;
            }
            s.set_condition(condition::STAGED, true, "Staged", "", now);
            s.set_condition(condition::READY, true, "Staged", "", now);
            *s != before
        })
        .await?;

        info!(
            volume = %req.volume_id,
            staging = %staging.display(),
            project_id,
            "volume staged"
        );
        Ok(())
    }

    async fn record_failure(&self, id: &str, rung: &'static str, e: &Error) {
        let now = self.rt.now();
        let message = e.to_string();
        let result = self
            .update_status(id, |s| {
                s.set_condition(rung, false, "Failed", &message, now);
                s.set_condition(condition::READY, false, "Failed", &message, now);
                true
            })
            .await;
        if let Err(err) = result {
            debug!(volume = %id, error = %err, "could not record failure");
        }
    }
}

#[async_trait]
impl CsiNode for NodeServer {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<()> {
        require("volume id", &req.volume_id)?;
        require("staging target path", &req.staging_target_path)?;

        let result = self.stage(&req).await;
        metrics::record_stage(result.is_ok());
        if let Err(e) = &result {
            warn!(volume = %req.volume_id, error = %e, "stage failed");
            if !e.is_not_found() && e.kind() != ErrorKind::AlreadyExists {
                self.record_failure(&req.volume_id, condition::STAGED, e).await;
            }
        }
        result
    }

    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<()> {
        require("volume id", &req.volume_id)?;
        require("staging target path", &req.staging_target_path)?;

        let mounter = self.rt.mounter.clone();
        let staging = PathBuf::from(&req.staging_target_path);
        self.rt
            .blocking("unstage", move || {
                safe_unmount(mounter.as_ref(), &staging, UnmountFlags::default())
            })
            .await?;

        let Some(volume) = self.rt.volumes.get_opt(&req.volume_id).await? else {
            return Ok(());
        };
        let project_id = volume.status_or_default().project_id;
        if project_id != 0 {
            if let Some(drive) = self.rt.drives.get_opt(&volume.spec.drive).await? {
                let device = PathBuf::from(drive.status_or_default().path);
                let quota = self.rt.quota.clone();
                self.rt
                    .blocking("quota", move || quota.remove_project_quota(&device, project_id))
                    .await?;
            }
        }

        let now = self.rt.now();
        self.update_status(&req.volume_id, |s| {
            s.staging_path.clear();
            s.set_condition(condition::STAGED, false, "Unstaged", "", now);
            s.set_condition(condition::READY, false, "Unstaged", "", now);
            true
        })
        .await?;
        info!(volume = %req.volume_id, "volume unstaged");
        Ok(())
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<()> {
        require("volume id", &req.volume_id)?;
        require("staging target path", &req.staging_target_path)?;
        require("target path", &req.target_path)?;

        let volume = self.local_volume(&req.volume_id).await?;
        if volume.status_or_default().staging_path != req.staging_target_path {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is not staged at {}",
                req.volume_id, req.staging_target_path
            )));
        }

        let mounter = self.rt.mounter.clone();
        let staging = PathBuf::from(&req.staging_target_path);
        let target = PathBuf::from(&req.target_path);
        let flags = MountFlags::bind().read_only(req.read_only);
        let result = self
            .rt
            .blocking("publish", move || {
                safe_mount(mounter.as_ref(), &staging, &target, "", flags, "")
            })
            .await;
        if let Err(e) = result {
            self.record_failure(&req.volume_id, condition::PUBLISHED, &e).await;
            return Err(e);
        }

        let now = self.rt.now();
        let context = |key: &str| req.volume_context.get(key).cloned().unwrap_or_default();
        let (pod_name, pod_namespace) = (
            context(POD_NAME_CONTEXT_KEY),
            context(POD_NAMESPACE_CONTEXT_KEY),
        );
        self.update_status(&req.volume_id, |s| {
            let before = s.clone();
            s.container_path = req.target_path.clone();
            s.pod_name = pod_name.clone();
            s.pod_namespace = pod_namespace.clone();
            s.set_condition(condition::PUBLISHED, true, "Published", "", now);
            s.set_condition(condition::READY, true, "Published", "", now);
            *s != before
        })
        .await?;

        info!(
            volume = %req.volume_id,
            target = %req.target_path,
            read_only = req.read_only,
            pod = %pod_name,
            "volume published"
        );
        Ok(())
    }

    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<()> {
        require("volume id", &req.volume_id)?;
        require("target path", &req.target_path)?;

        let mounter = self.rt.mounter.clone();
        let target = PathBuf::from(&req.target_path);
        self.rt
            .blocking("unpublish", move || {
                safe_unmount(mounter.as_ref(), &target, UnmountFlags::default())?;
                remove_dir(&target)
            })
            .await?;

        let now = self.rt.now();
        self.update_status(&req.volume_id, |s| {
            if s.container_path.is_empty() && !s.condition_true(condition::PUBLISHED) {
                return false;
            }
            s.container_path.clear();
            s.pod_name.clear();
            s.pod_namespace.clear();
            s.set_condition(condition::PUBLISHED, false, "Unpublished", "", now);
            true
        })
        .await?;
        info!(volume = %req.volume_id, target = %req.target_path, "volume unpublished");
        Ok(())
    }

    async fn get_volume_stats(&self, req: NodeGetVolumeStatsRequest) -> Result<VolumeUsage> {
        require("volume id", &req.volume_id)?;
        require("volume path", &req.volume_path)?;

        let volume = self.local_volume(&req.volume_id).await?;
        let total = volume.spec.total_capacity;
        let project_id = volume.status_or_default().project_id;

        let mut used = 0;
        if project_id != 0 {
            let drive = self.rt.drives.get(&volume.spec.drive).await?;
            let device = PathBuf::from(drive.status_or_default().path);
            let quota = self.rt.quota.clone();
            let current = self
                .rt
                .blocking("quota", move || quota.get_project_quota(&device, project_id))
                .await?;
            used = current.map(|q| q.used_bytes).unwrap_or(0).min(total);
        }

        if volume.status_or_default().used_capacity != used {
            retry_on_conflict_opt(self.rt.volumes.as_ref(), &req.volume_id, |v: &mut Volume| {
                v.set_usage(used);
                Ok(true)
            })
            .await?;
        }

        Ok(VolumeUsage {
            available: (total - used) as i64,
            total: total as i64,
            used: used as i64,
        })
    }

    fn get_capabilities(&self) -> Vec<NodeCapability> {
        vec![NodeCapability::StageUnstageVolume, NodeCapability::GetVolumeStats]
    }

    fn get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: self.config.max_volumes_per_node,
            accessible_topology: Some(Topology {
                segments: self.config.topology(),
            }),
        }
    }
}

// =============================================================================
// Volume record cleanup
// =============================================================================

/// Removes the host footprint of deleted volumes on this node
pub struct VolumeReconciler {
    rt: Runtime,
    config: Arc<NodeConfig>,
}

impl VolumeReconciler {
    pub fn new(rt: Runtime, config: Arc<NodeConfig>) -> Self {
        Self { rt, config }
    }

    async fn cleanup(&self, volume: &Volume) -> Result<()> {
        let name = volume.name_any();
        let Some(drive) = self.rt.drives.get_opt(&volume.spec.drive).await? else {
            debug!(volume = %name, "drive already gone; nothing to clean");
            return Ok(());
        };
        let status = drive.status_or_default();
        if status.mountpoint.is_empty() {
            return Ok(());
        }

        let device = PathBuf::from(&status.path);
        let data_root = Path::new(&status.mountpoint).join(&name);
        let volume_status = volume.status_or_default();
        let project_id = volume_status.project_id;
        // The data root is bind mounted at these; it is never a mount point itself.
        let targets: Vec<PathBuf> = [volume_status.container_path, volume_status.staging_path]
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        let (mounter, quota) = (self.rt.mounter.clone(), self.rt.quota.clone());
        self.rt
            .blocking("volume cleanup", move || {
                for target in &targets {
                    if is_mounted(mounter.as_ref(), target)? {
                        return Err(Error::Busy {
                            device: target.display().to_string(),
                        });
                    }
                }
                if project_id != 0 && quota.get_project_quota(&device, project_id)?.is_some() {
                    quota.remove_project_quota(&device, project_id)?;
                }
                match std::fs::remove_dir_all(&data_root) {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                }
            })
            .await?;

        info!(volume = %name, drive = %drive.name_any(), "volume data removed");
        Ok(())
    }
}

#[async_trait]
impl Handler<Volume> for VolumeReconciler {
    async fn handle(&self, kind: EventKind, volume: &Volume) -> Result<()> {
        if volume.spec.node_name != self.config.node_id {
            return Ok(());
        }
        if kind == EventKind::Delete {
            return self.cleanup(volume).await;
        }
        Ok(())
    }
}
