//! Device facts
//!
//! The normalized, transient view of one block device (whole disk or
//! partition) as the prober saw it.

use super::mountinfo::MountInfo;

/// Everything the prober learned about one block device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFact {
    /// Kernel name, e.g. `sdb` or `nvme0n1p2`
    pub name: String,
    /// Canonical device path, e.g. `/dev/sdb`
    pub path: String,
    /// sysfs directory, relative to the sysfs root
    pub devpath: String,
    pub major: u32,
    pub minor: u32,
    /// Size in bytes
    pub size: u64,
    pub read_only: bool,
    pub removable: bool,
    pub is_virtual: bool,
    pub logical_block_size: u64,
    pub physical_block_size: u64,

    pub model: String,
    pub serial: String,
    pub vendor: String,
    pub wwid: String,

    /// Partition number; 0 for a whole disk
    pub partition_num: u32,
    /// Name of the parent disk for partitions
    pub parent: String,
    pub partition_uuid: String,
    pub partition_type: String,
    pub partition_table_uuid: String,
    pub partition_table_type: String,
    /// Whether this device carries a partition table or has partitions
    pub partitioned: bool,

    /// Devices stacked on top of this one (`holders/`)
    pub holders: Vec<String>,
    /// Devices this one is stacked on (`slaves/`)
    pub slaves: Vec<String>,

    pub swap_on: bool,

    pub filesystem: String,
    pub fs_uuid: String,
    pub fs_label: String,
    pub fs_total_capacity: u64,
    pub fs_free_capacity: u64,

    pub mounts: Vec<MountInfo>,

    pub dm_name: String,
    pub dm_uuid: String,
    pub md_uuid: String,
}

impl DeviceFact {
    /// `(major, minor)` of the device
    pub fn key(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    pub fn is_partition(&self) -> bool {
        self.partition_num > 0
    }

    /// Stable identity: fs-uuid, then part-uuid, then WWID, then serial
    pub fn identity(&self) -> Option<&str> {
        [
            self.fs_uuid.as_str(),
            self.partition_uuid.as_str(),
            self.wwid.as_str(),
            self.serial.as_str(),
        ]
        .into_iter()
        .find(|id| !id.is_empty())
    }

    /// Name of the device holding this one, if any
    pub fn master(&self) -> Option<&str> {
        self.holders.first().map(String::as_str)
    }

    /// Distinct mount points, in mount-table order
    pub fn mount_points(&self) -> Vec<String> {
        let mut points: Vec<String> = Vec::new();
        for m in &self.mounts {
            if !points.contains(&m.mount_point) {
                points.push(m.mount_point.clone());
            }
        }
        points
    }

    /// First mount whose root is the filesystem root, else the first mount
    pub fn primary_mount(&self) -> Option<&MountInfo> {
        self.mounts
            .iter()
            .find(|m| m.root == "/")
            .or_else(|| self.mounts.first())
    }

    pub fn first_mount_point(&self) -> &str {
        self.primary_mount()
            .map(|m| m.mount_point.as_str())
            .unwrap_or("")
    }

    pub fn first_mount_options(&self) -> Vec<String> {
        self.primary_mount()
            .map(|m| m.mount_options.clone())
            .unwrap_or_default()
    }

    pub fn is_mounted(&self) -> bool {
        !self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_precedence() {
        let mut fact = DeviceFact {
            serial: "S1".into(),
            ..Default::default()
        };
        assert_eq!(fact.identity(), Some("S1"));

        fact.wwid = "0x5000".into();
        assert_eq!(fact.identity(), Some("0x5000"));

        fact.partition_uuid = "A1B2".into();
        assert_eq!(fact.identity(), Some("A1B2"));

        fact.fs_uuid = "0d4c".into();
        assert_eq!(fact.identity(), Some("0d4c"));

        assert_eq!(DeviceFact::default().identity(), None);
    }

    #[test]
    fn test_primary_mount_prefers_fs_root() {
        let fact = DeviceFact {
            mounts: vec![
                MountInfo {
                    root: "/pvc-1".into(),
                    mount_point: "/staging/pvc-1".into(),
                    ..Default::default()
                },
                MountInfo {
                    root: "/".into(),
                    mount_point: "/var/lib/directpv/mnt/abc".into(),
                    mount_options: vec!["rw".into(), "prjquota".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(fact.first_mount_point(), "/var/lib/directpv/mnt/abc");
        assert_eq!(fact.first_mount_options(), vec!["rw", "prjquota"]);
        assert_eq!(fact.mount_points().len(), 2);
    }
}
