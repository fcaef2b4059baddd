//! Device sync
//!
//! Mirrors the device index into Drive records: one record per observed
//! device, keyed by `<node>-<identity>` and matched to existing records by
//! `(major, minor)` so a reformatted device keeps its record.

use super::config::NodeConfig;
use crate::crd::{condition, Drive, DrivePhase, DriveSpec, DriveStatus};
use crate::domain::ports::Runtime;
use crate::error::Result;
use crate::hardware::{Classification, DeviceClassifier, DeviceEvent, DeviceFact, DeviceIndexReader};
use crate::labels::{
    sanitize_drive_path, sanitize_resource_name, set_label, LabelKey, LabelSelector, CREATED_BY,
    VERSION,
};
use crate::metrics;
use crate::store::retry_on_conflict_opt;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps this node's Drive records in step with its devices
pub struct DriveSync {
    rt: Runtime,
    config: Arc<NodeConfig>,
    classifier: DeviceClassifier,
}

impl DriveSync {
    pub fn new(rt: Runtime, config: Arc<NodeConfig>) -> Self {
        let classifier = DeviceClassifier::new(config.mount_root.clone());
        Self {
            rt,
            config,
            classifier,
        }
    }

    /// Record name for a device on this node
    pub fn drive_name(&self, fact: &DeviceFact) -> String {
        let identity = fact.identity().unwrap_or(&fact.name);
        sanitize_resource_name(&format!("{}-{}", self.config.node_id, identity))
    }

    async fn node_drives(&self) -> Result<Vec<Drive>> {
        let selector = LabelSelector::everything().with(LabelKey::NODE, self.config.node_id.as_str());
        self.rt.drives.list(&selector).await
    }

    fn find<'a>(&self, drives: &'a [Drive], fact: &DeviceFact) -> Option<&'a Drive> {
        let name = self.drive_name(fact);
        drives
            .iter()
            .find(|d| {
                let s = d.status.as_ref();
                !d.is_terminating()
                    && s.is_some_and(|s| (s.major_number, s.minor_number) == fact.key())
            })
            .or_else(|| drives.iter().find(|d| d.name_any() == name))
    }

    /// Create or refresh the record of one device
    pub async fn sync_device(&self, fact: &DeviceFact) -> Result<()> {
        let drives = self.node_drives().await?;
        self.sync_device_in(&drives, fact).await
    }

    async fn sync_device_in(&self, drives: &[Drive], fact: &DeviceFact) -> Result<()> {
        let classification = self.classifier.classify(fact);
        let topology = self.config.topology();
        let now = self.rt.now();

        if let Some(existing) = self.find(drives, fact) {
            let name = existing.name_any();
            let updated = retry_on_conflict_opt(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
                Ok(apply_facts(d, fact, &classification, &topology, now))
            })
            .await?;
            if updated.is_some() {
                debug!(drive = %name, device = %fact.path, "drive facts refreshed");
            }
            return Ok(());
        }

        let name = self.drive_name(fact);
        let mut drive = Drive::new(&name, DriveSpec::default());
        let labels = drive.labels_mut();
        set_label(labels, LabelKey::NODE, self.config.node_id.as_str());
        set_label(labels, LabelKey::DRIVE_PATH, sanitize_drive_path(&fact.path));
        set_label(labels, LabelKey::CREATED_BY, CREATED_BY);
        set_label(labels, LabelKey::VERSION, VERSION);
        drive.status = Some(DriveStatus {
            drive_status: classification.phase(),
            node_name: self.config.node_id.clone(),
            ..Default::default()
        });
        apply_facts(&mut drive, fact, &classification, &topology, now);

        match self.rt.drives.create(&drive).await {
            Ok(_) => {
                info!(
                    drive = %name,
                    device = %fact.path,
                    status = %classification.phase(),
                    "drive discovered"
                );
                Ok(())
            }
            // Raced with another sync of the same device; the next event refreshes it.
            Err(e) if e.kind() == crate::error::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// React to a device going away
    pub async fn remove_device(&self, fact: &DeviceFact) -> Result<()> {
        let drives = self.node_drives().await?;
        let Some(drive) = self.find(&drives, fact) else {
            return Ok(());
        };
        self.drive_gone(drive).await
    }

    async fn drive_gone(&self, drive: &Drive) -> Result<()> {
        let name = drive.name_any();
        match drive.phase() {
            DrivePhase::Available | DrivePhase::Unavailable => {
                info!(drive = %name, "device removed; deleting drive");
                match self.rt.drives.delete(&name).await {
                    Err(e) if !e.is_not_found() => Err(e),
                    _ => Ok(()),
                }
            }
            _ => {
                warn!(drive = %name, "device of owned drive went away");
                let now = self.rt.now();
                retry_on_conflict_opt(self.rt.drives.as_ref(), &name, |d: &mut Drive| {
                    let s = d.status.get_or_insert_with(DriveStatus::default);
                    if !s.condition_true(condition::MOUNTED) {
                        return Ok(false);
                    }
                    s.set_condition(condition::MOUNTED, false, "DeviceRemoved", "device not found", now);
                    s.set_condition(condition::READY, false, "DeviceRemoved", "device not found", now);
                    Ok(true)
                })
                .await?;
                Ok(())
            }
        }
    }

    /// Reconcile every record of this node against a full device listing
    pub async fn sync_all(&self, facts: &[DeviceFact]) -> Result<()> {
        let drives = self.node_drives().await?;
        for fact in facts {
            if let Err(e) = self.sync_device_in(&drives, fact).await {
                warn!(device = %fact.path, error = %e, "device sync failed");
            }
        }

        let present: HashSet<(u32, u32)> = facts.iter().map(DeviceFact::key).collect();
        for drive in &drives {
            let key = drive
                .status
                .as_ref()
                .map(|s| (s.major_number, s.minor_number));
            if key.is_some_and(|k| !present.contains(&k)) && !drive.is_terminating() {
                if let Err(e) = self.drive_gone(drive).await {
                    warn!(drive = %drive.name_any(), error = %e, "stale drive cleanup failed");
                }
            }
        }

        self.report().await;
        Ok(())
    }

    /// Handle one device index event
    pub async fn handle_event(&self, event: &DeviceEvent) -> Result<()> {
        match event {
            DeviceEvent::Added(fact) | DeviceEvent::Changed(fact) => self.sync_device(fact).await,
            DeviceEvent::Removed(fact) => self.remove_device(fact).await,
        }
    }

    async fn report(&self) {
        let Ok(drives) = self.node_drives().await else {
            return;
        };
        let mut counts: HashMap<DrivePhase, i64> = HashMap::new();
        for d in &drives {
            *counts.entry(d.phase()).or_default() += 1;
        }
        for phase in [
            DrivePhase::Available,
            DrivePhase::Unavailable,
            DrivePhase::Ready,
            DrivePhase::InUse,
            DrivePhase::Released,
            DrivePhase::Terminating,
        ] {
            metrics::metrics()
                .drives
                .with_label_values(&[&phase.to_string()])
                .set(counts.get(&phase).copied().unwrap_or(0));
        }
    }

    /// Initial full sync, then follow the index until cancelled
    pub async fn run(self, reader: DeviceIndexReader, token: CancellationToken) -> Result<()> {
        let mut events = reader.subscribe();
        self.sync_all(&reader.all()).await?;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("device sync stopping");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(%event, "device event");
                        if let Err(e) = self.handle_event(&event).await {
                            warn!(%event, error = %e, "device event handling failed");
                        }
                        self.report().await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "device events lagged; resyncing");
                        self.sync_all(&reader.all()).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

/// Copy device facts onto a Drive. Owned drives keep their engine mount and
/// capacity accounting; unowned ones are reclassified. Returns whether
/// anything changed.
fn apply_facts(
    drive: &mut Drive,
    fact: &DeviceFact,
    classification: &Classification,
    topology: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> bool {
    let s = drive.status.get_or_insert_with(DriveStatus::default);
    let before = s.clone();

    s.path = fact.path.clone();
    s.major_number = fact.major;
    s.minor_number = fact.minor;
    s.model = fact.model.clone();
    s.serial = fact.serial.clone();
    s.wwid = fact.wwid.clone();
    s.vendor = fact.vendor.clone();
    s.logical_block_size = fact.logical_block_size;
    s.physical_block_size = fact.physical_block_size;
    s.is_virtual = fact.is_virtual;
    s.read_only = fact.read_only;
    s.partition_num = fact.partition_num;
    s.partition_uuid = fact.partition_uuid.clone();
    s.partition_type = fact.partition_type.clone();
    s.partition_table_uuid = fact.partition_table_uuid.clone();
    s.partition_table_type = fact.partition_table_type.clone();
    s.partitioned = fact.partitioned;
    s.swap_on = fact.swap_on;
    s.filesystem = fact.filesystem.clone();
    s.filesystem_uuid = fact.fs_uuid.clone();
    s.master = fact.master().unwrap_or_default().to_string();
    s.dm_name = fact.dm_name.clone();
    s.dm_uuid = fact.dm_uuid.clone();
    s.md_uuid = fact.md_uuid.clone();
    s.mount_points = fact.mount_points();
    s.topology = topology.clone();

    match s.drive_status {
        DrivePhase::Available | DrivePhase::Unavailable => {
            s.drive_status = classification.phase();
            s.mountpoint = fact.first_mount_point().to_string();
            s.mount_options = fact.first_mount_options();
            s.total_capacity = fact.size;
            s.allocated_capacity = 0;
            s.free_capacity = fact.size;
            if classification.is_available() {
                s.conditions
                    .retain(|c| !(c.r#type == condition::INITIALIZED && c.reason == "Unavailable"));
            } else {
                s.set_condition(
                    condition::INITIALIZED,
                    false,
                    "Unavailable",
                    &classification.message(),
                    now,
                );
            }
        }
        DrivePhase::Ready | DrivePhase::InUse => {
            let mounted = s.mount_points.contains(&s.mountpoint);
            if s.condition_true(condition::MOUNTED) != mounted {
                s.set_condition(condition::MOUNTED, mounted, "Probed", "", now);
                let ready = s.is_initialized();
                s.set_condition(condition::READY, ready, "Probed", "", now);
            }
        }
        DrivePhase::Released | DrivePhase::Terminating => {}
    }

    *s != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DATA_PROTECTION_FINALIZER;
    use crate::hardware::discovery::MountInfo;
    use crate::labels::get_label;
    use crate::testing::{runtime, Fakes};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn sync() -> (DriveSync, Runtime, Fakes) {
        let (rt, fakes) = runtime();
        let config = Arc::new(NodeConfig {
            node_id: "node1".into(),
            ..Default::default()
        });
        (DriveSync::new(rt.clone(), config), rt, fakes)
    }

    fn fact(name: &str, minor: u32, size: u64) -> DeviceFact {
        DeviceFact {
            name: name.into(),
            path: format!("/dev/{name}"),
            major: 8,
            minor,
            size,
            serial: format!("SER-{}", name.to_uppercase()),
            logical_block_size: 512,
            physical_block_size: 4096,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_device_creates_available_drive() {
        let (sync, rt, _) = sync();
        sync.sync_device(&fact("sdb", 16, 10 * GIB)).await.unwrap();

        let d = rt.drives.get("node1-ser-sdb").await.unwrap();
        let s = d.status.clone().unwrap();
        assert_eq!(s.drive_status, DrivePhase::Available);
        assert_eq!(s.node_name, "node1");
        assert_eq!(s.total_capacity, 10 * GIB);
        assert_eq!((s.major_number, s.minor_number), (8, 16));
        assert_eq!(get_label(d.labels(), LabelKey::DRIVE_PATH), Some("sdb"));
        assert_eq!(get_label(d.labels(), LabelKey::CREATED_BY), Some(CREATED_BY));
        assert_eq!(s.topology["directpv.min.io/node"], "node1");
    }

    #[tokio::test]
    async fn test_unavailable_reasons_are_recorded() {
        let (sync, rt, _) = sync();
        let mut small = fact("sdc", 32, 512 * 1024);
        small.read_only = true;
        sync.sync_device(&small).await.unwrap();

        let s = rt.drives.get("node1-ser-sdc").await.unwrap().status.unwrap();
        assert_eq!(s.drive_status, DrivePhase::Unavailable);
        assert!(s
            .conditions
            .iter()
            .any(|c| c.message == "too small, read only"));
    }

    #[tokio::test]
    async fn test_reformatted_device_keeps_its_record() {
        let (sync, rt, _) = sync();
        let mut f = fact("sdb", 16, 10 * GIB);
        sync.sync_device(&f).await.unwrap();

        let mut d = rt.drives.get("node1-ser-sdb").await.unwrap();
        d.add_finalizer(DATA_PROTECTION_FINALIZER);
        let s = d.status.as_mut().unwrap();
        s.drive_status = DrivePhase::Ready;
        s.mountpoint = "/var/lib/directpv/mnt/0d4c".into();
        s.set_condition(condition::MOUNTED, true, "Formatted", "", Utc::now());
        rt.drives.update(&d).await.unwrap();

        // The identity moves to the new filesystem UUID.
        f.fs_uuid = "0d4c".into();
        f.filesystem = "xfs".into();
        f.mounts = vec![MountInfo {
            major: 8,
            minor: 16,
            root: "/".into(),
            mount_point: "/var/lib/directpv/mnt/0d4c".into(),
            ..Default::default()
        }];
        sync.sync_device(&f).await.unwrap();

        let all = rt.drives.list(&LabelSelector::everything()).await.unwrap();
        assert_eq!(all.len(), 1);
        let s = all[0].status.clone().unwrap();
        assert_eq!(s.drive_status, DrivePhase::Ready);
        assert_eq!(s.filesystem_uuid, "0d4c");
        assert!(s.condition_true(condition::MOUNTED));
    }

    #[tokio::test]
    async fn test_removal_deletes_unowned_and_flags_owned() {
        let (sync, rt, _) = sync();
        let sdb = fact("sdb", 16, 10 * GIB);
        let sdc = fact("sdc", 32, 10 * GIB);
        sync.sync_all(&[sdb.clone(), sdc.clone()]).await.unwrap();

        let mut owned = rt.drives.get("node1-ser-sdc").await.unwrap();
        owned.add_finalizer(DATA_PROTECTION_FINALIZER);
        let s = owned.status.as_mut().unwrap();
        s.drive_status = DrivePhase::Ready;
        s.set_condition(condition::MOUNTED, true, "Formatted", "", Utc::now());
        rt.drives.update(&owned).await.unwrap();

        sync.sync_all(&[]).await.unwrap();

        assert!(rt.drives.get_opt("node1-ser-sdb").await.unwrap().is_none());
        let kept = rt.drives.get("node1-ser-sdc").await.unwrap();
        assert!(!kept.status.unwrap().condition_true(condition::MOUNTED));
    }
}
