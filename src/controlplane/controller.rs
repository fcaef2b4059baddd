//! CSI controller service
//!
//! Validates CreateVolume requests, schedules the volume onto a drive, and
//! records the binding as a Volume record. DeleteVolume undoes both.

use super::scheduler::{Placement, Scheduler};
use crate::crd::{AccessTier, Drive, Volume, VolumeSpec};
use crate::csi::{
    AccessMode, ControllerCapability, CreateVolumeRequest, CreateVolumeResponse, CsiController,
    CsiVolume, DeleteVolumeRequest, Topology, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, VolumeCapability, ACCESS_TIER_PARAMETER,
};
use crate::domain::ports::Runtime;
use crate::error::{Error, Result};
use crate::labels::{set_label, LabelKey, CREATED_BY, VERSION};
use async_trait::async_trait;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Controller service settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// CSI driver identity
    pub identity: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            identity: "directpv-min-io".to_string(),
        }
    }
}

fn supported_fs(fs_type: &str) -> bool {
    fs_type.is_empty() || fs_type == "xfs"
}

fn check_capability(cap: &VolumeCapability) -> Result<()> {
    if cap.access_mode != AccessMode::SingleNodeWriter {
        return Err(Error::InvalidArgument(format!(
            "unsupported access mode {:?}; only single node writer is supported",
            cap.access_mode
        )));
    }
    if !supported_fs(&cap.fs_type) {
        return Err(Error::InvalidArgument(format!(
            "unsupported filesystem type {}; only xfs is supported",
            cap.fs_type
        )));
    }
    Ok(())
}

/// Bytes a request asks for: required, else limit, else 0
fn required_bytes(req: &CreateVolumeRequest) -> Result<u64> {
    let Some(range) = req.capacity_range else {
        return Ok(0);
    };
    for (field, value) in [("required", range.required_bytes), ("limit", range.limit_bytes)] {
        if value < 0 {
            return Err(Error::InvalidArgument(format!(
                "negative {field} bytes {value} in capacity range"
            )));
        }
    }
    let bytes = if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    };
    Ok(bytes as u64)
}

/// CSI controller over the Drive and Volume stores
pub struct ControllerServer {
    rt: Runtime,
    config: ControllerConfig,
    scheduler: Scheduler,
    // Stands in for the leader-election lease of a single controller.
    create_lock: Mutex<()>,
}

impl ControllerServer {
    pub fn new(rt: Runtime, config: ControllerConfig) -> Self {
        Self {
            scheduler: Scheduler::new(rt.drives.clone()),
            rt,
            config,
            create_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn placement(req: &CreateVolumeRequest) -> Result<Placement> {
        if req.name.is_empty() {
            return Err(Error::InvalidArgument("volume name missing in request".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }
        req.volume_capabilities.iter().try_for_each(check_capability)?;

        let access_tier = match req.parameters.get(ACCESS_TIER_PARAMETER) {
            None => None,
            Some(value) => match AccessTier::parse(value) {
                Some(tier) if tier != AccessTier::Unknown => Some(tier),
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown access tier {value}; must be one of hot, warm, cold"
                    )))
                }
            },
        };
        let filesystem = req
            .volume_capabilities
            .iter()
            .map(|c| c.fs_type.as_str())
            .find(|fs| !fs.is_empty())
            .unwrap_or("xfs")
            .to_string();

        Ok(Placement {
            volume: req.name.clone(),
            required_bytes: required_bytes(req)?,
            filesystem,
            access_tier,
            topology: req.accessibility_requirements.clone(),
        })
    }

    fn volume_record(name: &str, drive: &Drive, bytes: u64) -> Volume {
        let status = drive.status_or_default();
        let mut volume = Volume::new(
            name,
            VolumeSpec {
                node_name: status.node_name.clone(),
                drive: drive.name_any(),
                drive_path: status.path.clone(),
                total_capacity: bytes,
                ..Default::default()
            },
        );
        let labels = volume.labels_mut();
        set_label(labels, LabelKey::NODE, status.node_name.as_str());
        set_label(labels, LabelKey::DRIVE, drive.name_any().as_str());
        set_label(
            labels,
            LabelKey::DRIVE_PATH,
            crate::labels::sanitize_drive_path(&status.path),
        );
        set_label(labels, LabelKey::CREATED_BY, CREATED_BY);
        set_label(labels, LabelKey::VERSION, VERSION);
        volume
    }

    fn response(volume: &Volume, drive: &Drive) -> CreateVolumeResponse {
        CreateVolumeResponse {
            volume: CsiVolume {
                volume_id: volume.name_any(),
                capacity_bytes: volume.spec.total_capacity as i64,
                volume_context: Default::default(),
                accessible_topology: vec![Topology {
                    segments: drive.status_or_default().topology,
                }],
            },
        }
    }
}

#[async_trait]
impl CsiController for ControllerServer {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let placement = Self::placement(&req)?;
        let _lease = self.create_lock.lock().await;

        let drive = self.scheduler.schedule(&placement).await?;
        let volume = match self.rt.volumes.get_opt(&req.name).await? {
            Some(existing) => {
                debug!(volume = %req.name, "volume record exists");
                existing
            }
            None => {
                let record = Self::volume_record(&req.name, &drive, placement.required_bytes);
                match self.rt.volumes.create(&record).await {
                    Ok(created) => created,
                    Err(e) if e.kind() == crate::error::ErrorKind::AlreadyExists => {
                        self.rt.volumes.get(&req.name).await?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        info!(
            volume = %req.name,
            drive = %drive.name_any(),
            node = %drive.node_name(),
            bytes = placement.required_bytes,
            "volume created"
        );
        Ok(Self::response(&volume, &drive))
    }

    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id missing in request".into()));
        }
        let Some(volume) = self.rt.volumes.get_opt(&req.volume_id).await? else {
            debug!(volume = %req.volume_id, "volume already gone");
            return Ok(());
        };
        if volume.is_staged() || volume.is_published() {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is still staged or published on node {}",
                req.volume_id, volume.spec.node_name
            )));
        }

        // The Volume record is the only link to the bound drive; it goes last.
        self.scheduler
            .release(&volume.spec.drive, &req.volume_id, volume.spec.total_capacity)
            .await?;
        match self.rt.volumes.delete(&req.volume_id).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        info!(volume = %req.volume_id, drive = %volume.spec.drive, "volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id missing in request".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }
        self.rt.volumes.get(&req.volume_id).await?;

        match req.volume_capabilities.iter().try_for_each(check_capability) {
            Ok(()) => Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(req.volume_capabilities),
                message: String::new(),
            }),
            Err(e) => Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: e.to_string(),
            }),
        }
    }

    fn get_capabilities(&self) -> Vec<ControllerCapability> {
        vec![ControllerCapability::CreateDeleteVolume]
    }
}
