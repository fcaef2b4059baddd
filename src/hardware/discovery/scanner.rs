//! Block Device Scanner
//!
//! Walks `/sys/devices` for `uevent` files, keeps whole disks of the block
//! subsystem, and fills a [`DeviceFact`] for each disk and each partition
//! found in its partition table.

use super::device::DeviceFact;
use super::mountinfo::{self, MountInfo};
use super::udev::UdevData;
use crate::error::{Error, Result};
use crate::hardware::probe::{self, PartitionTable};
use crate::labels::ValueFilter;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the device scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Directory holding device nodes
    pub dev_path: PathBuf,
    /// Path to procfs
    pub proc_path: PathBuf,
    /// udev database directory
    pub udev_data_path: PathBuf,
    /// Manage only loop devices
    pub loopback_only: bool,
    /// Device-name selectors; empty admits everything
    pub device_filter: ValueFilter,
    /// Open device nodes to probe partition tables and superblocks
    pub probe_devices: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sysfs_path: PathBuf::from("/sys"),
            dev_path: PathBuf::from("/dev"),
            proc_path: PathBuf::from("/proc"),
            udev_data_path: PathBuf::from("/run/udev/data"),
            loopback_only: false,
            device_filter: ValueFilter::default(),
            probe_devices: true,
        }
    }
}

/// Parsed `uevent` attributes of a sysfs device directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Uevent {
    pub major: u32,
    pub minor: u32,
    pub devname: String,
    pub devtype: String,
    pub partn: u32,
}

impl Uevent {
    pub(crate) fn parse(contents: &str) -> Option<Self> {
        let mut ev = Uevent::default();
        let mut has_major = false;
        for (key, value) in contents.lines().filter_map(|l| l.split_once('=')) {
            match key {
                "MAJOR" => {
                    ev.major = value.trim().parse().ok()?;
                    has_major = true;
                }
                "MINOR" => ev.minor = value.trim().parse().ok()?,
                "DEVNAME" => ev.devname = value.trim().to_string(),
                "DEVTYPE" => ev.devtype = value.trim().to_string(),
                "PARTN" => ev.partn = value.trim().parse().unwrap_or(0),
                _ => {}
            }
        }
        (has_major && !ev.devname.is_empty()).then_some(ev)
    }
}

/// Host-wide facts shared by every device of one scan
#[derive(Debug, Default)]
struct HostState {
    mounts: BTreeMap<(u32, u32), Vec<MountInfo>>,
    swaps: HashSet<String>,
}

// =============================================================================
// Device Scanner
// =============================================================================

/// Scans block devices on a Linux host
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    config: ScannerConfig,
}

impl DeviceScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Cold scan of every qualifying device and its partitions
    pub fn enumerate(&self) -> Result<Vec<DeviceFact>> {
        let devices_root = self.config.sysfs_path.join("devices");
        if !devices_root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("sysfs unavailable at {}", devices_root.display()),
            )));
        }

        let host = self.host_state();
        let mut disks = Vec::new();
        self.walk(&devices_root, &mut disks)?;
        disks.sort();

        let mut facts = Vec::new();
        for dir in disks {
            match self.probe_disk_dir(&dir, &host) {
                Ok(mut found) => facts.append(&mut found),
                Err(e) => warn!(path = %dir.display(), error = %e, "skipping device"),
            }
        }

        info!(count = facts.len(), "device enumeration complete");
        Ok(facts)
    }

    /// Re-probe the disk at `devpath` (relative to sysfs) together with its
    /// partitions; a partition devpath probes its parent disk
    pub fn probe_devpath(&self, devpath: &str) -> Result<Vec<DeviceFact>> {
        let mut dir = self.config.sysfs_path.join(devpath.trim_start_matches('/'));
        if dir.join("partition").exists() {
            if let Some(parent) = dir.parent() {
                dir = parent.to_path_buf();
            }
        }
        let host = self.host_state();
        self.probe_disk_dir(&dir, &host)
    }

    fn host_state(&self) -> HostState {
        let mounts = match mountinfo::read(&self.config.proc_path.join("1/mountinfo")) {
            Ok(mounts) => mountinfo::by_device(&mounts),
            Err(e) => {
                warn!(error = %e, "unable to read mount table");
                BTreeMap::new()
            }
        };
        HostState {
            mounts,
            swaps: self.read_swaps(),
        }
    }

    /// Device names of active swap areas
    fn read_swaps(&self) -> HashSet<String> {
        let Ok(contents) = fs::read_to_string(self.config.proc_path.join("swaps")) else {
            return HashSet::new();
        };
        contents
            .lines()
            .skip(1)
            .filter_map(|l| l.split_whitespace().next())
            .filter_map(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect()
    }

    /// Collect sysfs directories of qualifying whole disks
    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), error = %e, "unreadable sysfs directory");
                return Ok(());
            }
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;

            // sysfs is full of back-links; only real directories are walked.
            if file_type.is_symlink() || !file_type.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("loop") && !self.config.loopback_only {
                continue;
            }

            if self.is_block_disk(&path) {
                if self.should_include_device(&name) {
                    out.push(path);
                }
                // Partitions are handled with their disk.
                continue;
            }

            self.walk(&path, out)?;
        }
        Ok(())
    }

    fn is_block_disk(&self, dir: &Path) -> bool {
        let in_block_subsystem = fs::read_link(dir.join("subsystem"))
            .ok()
            .and_then(|target| target.file_name().map(|n| n == "block"))
            .unwrap_or(false);
        if !in_block_subsystem {
            return false;
        }
        fs::read_to_string(dir.join("uevent"))
            .ok()
            .and_then(|c| Uevent::parse(&c))
            .map(|ev| ev.devtype == "disk")
            .unwrap_or(false)
    }

    /// Whether a device named `name` is managed by this scanner
    pub fn admits(&self, name: &str) -> bool {
        if name.starts_with("loop") && !self.config.loopback_only {
            return false;
        }
        self.should_include_device(name)
    }

    /// Check if a device should be included
    fn should_include_device(&self, name: &str) -> bool {
        if self.config.loopback_only {
            return name.starts_with("loop") && self.config.device_filter.matches(name);
        }

        // Skip RAM disks
        if name.starts_with("ram") || name.starts_with("zram") {
            return false;
        }

        self.config.device_filter.matches(name)
    }

    /// Facts for a disk directory plus one per partition
    fn probe_disk_dir(&self, dir: &Path, host: &HostState) -> Result<Vec<DeviceFact>> {
        let uevent = fs::read_to_string(dir.join("uevent"))?;
        let ev = Uevent::parse(&uevent).ok_or_else(|| {
            Error::Corrupt {
                device: dir.display().to_string(),
                offset: 0,
                reason: "uevent lacks MAJOR or DEVNAME".into(),
            }
        })?;

        let mut disk = self.base_fact(dir, &ev, host);
        let children = self.partition_dirs(dir);

        let table = if self.config.probe_devices {
            match probe::probe_device_partitions(Path::new(&disk.path), disk.logical_block_size) {
                Ok(table) => Some(table),
                Err(Error::FilesystemNotFound) => None,
                Err(e) => {
                    debug!(device = %disk.path, error = %e, "partition table probe failed");
                    None
                }
            }
        } else {
            None
        };

        disk.partitioned = table.is_some() || !children.is_empty();
        if let Some(table) = &table {
            disk.partition_table_type = table.kind.to_string();
            if disk.partition_table_uuid.is_empty() {
                disk.partition_table_uuid = table.uuid.clone();
            }
        }
        if !disk.partitioned {
            self.fill_filesystem(&mut disk, 0);
        }

        let mut facts = vec![disk.clone()];
        facts.extend(self.partition_facts(&disk, table.as_ref(), &children, host));
        Ok(facts)
    }

    /// Child directories of a disk that are partitions, keyed by number
    fn partition_dirs(&self, dir: &Path) -> BTreeMap<u32, PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return BTreeMap::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| {
                let n = read_attr(&p, "partition")?.parse().ok()?;
                Some((n, p))
            })
            .collect()
    }

    fn partition_facts(
        &self,
        disk: &DeviceFact,
        table: Option<&PartitionTable>,
        children: &BTreeMap<u32, PathBuf>,
        host: &HostState,
    ) -> Vec<DeviceFact> {
        let mut numbers: Vec<u32> = children.keys().copied().collect();
        if let Some(table) = table {
            numbers.extend(table.partitions.iter().map(|p| p.number));
        }
        numbers.sort_unstable();
        numbers.dedup();

        let mut facts = Vec::new();
        for number in numbers {
            let entry = table.and_then(|t| t.partitions.iter().find(|p| p.number == number));

            let mut fact = match children.get(&number) {
                Some(child) => {
                    let ev = fs::read_to_string(child.join("uevent"))
                        .ok()
                        .and_then(|c| Uevent::parse(&c));
                    match ev {
                        Some(ev) => self.base_fact(child, &ev, host),
                        None => continue,
                    }
                }
                None => DeviceFact {
                    name: partition_name(&disk.name, number),
                    path: self.dev_node(&partition_name(&disk.name, number)),
                    logical_block_size: disk.logical_block_size,
                    physical_block_size: disk.physical_block_size,
                    is_virtual: disk.is_virtual,
                    read_only: disk.read_only,
                    ..Default::default()
                },
            };

            fact.partition_num = number;
            fact.parent = disk.name.clone();
            fact.partition_table_type = disk.partition_table_type.clone();
            fact.partition_table_uuid = disk.partition_table_uuid.clone();
            if fact.model.is_empty() {
                fact.model = disk.model.clone();
            }
            if fact.vendor.is_empty() {
                fact.vendor = disk.vendor.clone();
            }

            let offset = match entry {
                Some(p) => {
                    if fact.partition_uuid.is_empty() {
                        fact.partition_uuid = p.part_uuid.clone();
                    }
                    fact.partition_type = p.type_uuid.clone();
                    if fact.size == 0 {
                        fact.size = p.size_bytes();
                    }
                    Some(p.start_offset())
                }
                None => None,
            };

            // Probe through the partition node when present, else through the parent.
            if fact.major != 0 {
                self.fill_filesystem(&mut fact, 0);
            } else if let Some(offset) = offset {
                let parent = disk.path.clone();
                self.fill_filesystem_from(&mut fact, Path::new(&parent), offset);
            }

            facts.push(fact);
        }
        facts
    }

    /// sysfs, udev and host facts for one device directory
    fn base_fact(&self, dir: &Path, ev: &Uevent, host: &HostState) -> DeviceFact {
        let name = Path::new(&ev.devname)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ev.devname.clone());
        let udev = UdevData::read(&self.config.udev_data_path, ev.major, ev.minor)
            .unwrap_or_else(|e| {
                debug!(device = %name, error = %e, "unreadable udev record");
                UdevData::default()
            });

        let sectors: u64 = read_attr(dir, "size").and_then(|s| s.parse().ok()).unwrap_or(0);
        let devpath = dir
            .strip_prefix(&self.config.sysfs_path)
            .map(|p| format!("/{}", p.display()))
            .unwrap_or_default();

        DeviceFact {
            path: self.dev_node(&ev.devname),
            devpath: devpath.clone(),
            major: ev.major,
            minor: ev.minor,
            size: sectors * 512,
            read_only: read_attr(dir, "ro").as_deref() == Some("1"),
            removable: read_attr(dir, "removable").as_deref() == Some("1"),
            is_virtual: devpath.starts_with("/devices/virtual/"),
            logical_block_size: read_attr(dir, "queue/logical_block_size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(512),
            physical_block_size: read_attr(dir, "queue/physical_block_size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(512),
            model: read_attr(dir, "device/model").unwrap_or_else(|| udev.model()),
            serial: udev.serial(),
            vendor: read_attr(dir, "device/vendor").unwrap_or_else(|| udev.vendor()),
            wwid: {
                let wwid = udev.wwid();
                if wwid.is_empty() {
                    read_attr(dir, "wwid")
                        .or_else(|| read_attr(dir, "device/wwid"))
                        .unwrap_or_default()
                } else {
                    wwid
                }
            },
            partition_num: ev.partn,
            partition_uuid: udev.get_or_default("ID_PART_ENTRY_UUID"),
            partition_table_uuid: udev.get_or_default("ID_PART_TABLE_UUID"),
            partition_table_type: udev.get_or_default("ID_PART_TABLE_TYPE"),
            holders: list_dir(&dir.join("holders")),
            slaves: list_dir(&dir.join("slaves")),
            swap_on: host.swaps.contains(&name),
            filesystem: udev.get_or_default("ID_FS_TYPE"),
            fs_uuid: udev.get_or_default("ID_FS_UUID"),
            mounts: host.mounts.get(&(ev.major, ev.minor)).cloned().unwrap_or_default(),
            dm_name: read_attr(dir, "dm/name").unwrap_or_else(|| udev.get_or_default("DM_NAME")),
            dm_uuid: read_attr(dir, "dm/uuid").unwrap_or_else(|| udev.get_or_default("DM_UUID")),
            md_uuid: udev.get_or_default("MD_UUID"),
            name,
            ..Default::default()
        }
    }

    fn fill_filesystem(&self, fact: &mut DeviceFact, offset: u64) {
        let path = PathBuf::from(&fact.path);
        self.fill_filesystem_from(fact, &path, offset);
    }

    /// Probe a superblock; on failure keep whatever udev reported
    fn fill_filesystem_from(&self, fact: &mut DeviceFact, device: &Path, offset: u64) {
        if !self.config.probe_devices {
            return;
        }
        match probe::probe_device_filesystem(device, offset) {
            Ok(fs) => {
                fact.filesystem = fs.fs_type;
                fact.fs_uuid = fs.uuid;
                fact.fs_label = fs.label;
                fact.fs_total_capacity = fs.total_capacity;
                fact.fs_free_capacity = fs.free_capacity;
            }
            Err(Error::FilesystemNotFound) => {}
            Err(e @ Error::Corrupt { .. }) => {
                warn!(device = %fact.path, error = %e, "corrupt superblock, treating as unformatted");
            }
            Err(e) => debug!(device = %fact.path, error = %e, "filesystem probe failed"),
        }
    }

    fn dev_node(&self, devname: &str) -> String {
        self.config.dev_path.join(devname).display().to_string()
    }
}

/// Kernel naming for partition `n` of `disk`
pub fn partition_name(disk: &str, n: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{disk}p{n}")
    } else {
        format!("{disk}{n}")
    }
}

/// Read a sysfs attribute, trimmed; `None` when absent or empty
fn read_attr(base_path: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(base_path.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn list_dir(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// A fake host: sysfs, dev, proc and udev trees under one temp dir
    pub(crate) struct FakeHost {
        pub dir: TempDir,
    }

    impl FakeHost {
        pub(crate) fn new() -> Self {
            let dir = TempDir::new().unwrap();
            for sub in ["sys/devices", "sys/class/block", "dev", "proc/1", "udev"] {
                fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            fs::write(dir.path().join("proc/1/mountinfo"), "").unwrap();
            fs::write(dir.path().join("proc/swaps"), "Filename Type Size Used Priority\n").unwrap();
            Self { dir }
        }

        pub(crate) fn config(&self) -> ScannerConfig {
            ScannerConfig {
                sysfs_path: self.dir.path().join("sys"),
                dev_path: self.dir.path().join("dev"),
                proc_path: self.dir.path().join("proc"),
                udev_data_path: self.dir.path().join("udev"),
                ..Default::default()
            }
        }

        /// Add a block device directory at `devpath` (relative to sysfs)
        pub(crate) fn add_block(
            &self,
            devpath: &str,
            devtype: &str,
            major: u32,
            minor: u32,
            sectors: u64,
        ) -> PathBuf {
            let dir = self.dir.path().join("sys").join(devpath);
            fs::create_dir_all(dir.join("queue")).unwrap();
            let name = dir.file_name().unwrap().to_string_lossy().to_string();
            fs::write(
                dir.join("uevent"),
                format!("MAJOR={major}\nMINOR={minor}\nDEVNAME={name}\nDEVTYPE={devtype}\n"),
            )
            .unwrap();
            fs::write(dir.join("size"), format!("{sectors}\n")).unwrap();
            fs::write(dir.join("ro"), "0\n").unwrap();
            fs::write(dir.join("queue/logical_block_size"), "512\n").unwrap();
            fs::write(dir.join("queue/physical_block_size"), "4096\n").unwrap();
            symlink(self.dir.path().join("sys/class/block"), dir.join("subsystem")).unwrap();
            fs::write(self.dir.path().join("dev").join(&name), b"").unwrap();
            dir
        }

        pub(crate) fn write(&self, rel: &str, contents: &str) {
            let path = self.dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
    }

    #[test]
    fn test_uevent_parse() {
        let ev = Uevent::parse("MAJOR=8\nMINOR=16\nDEVNAME=sdb\nDEVTYPE=disk\n").unwrap();
        assert_eq!((ev.major, ev.minor), (8, 16));
        assert_eq!(ev.devname, "sdb");
        assert_eq!(ev.devtype, "disk");
        assert!(Uevent::parse("DEVTYPE=disk\n").is_none());
    }

    #[test]
    fn test_enumerate_disks_and_partitions() {
        let host = FakeHost::new();
        let sdb = host.add_block("devices/pci0000:00/host0/block/sdb", "disk", 8, 16, 2 * 1024 * 1024);
        host.add_block("devices/pci0000:00/host0/block/sdb/sdb1", "partition", 8, 17, 2048);
        fs::write(sdb.join("sdb1/partition"), "1\n").unwrap();
        host.add_block("devices/pci0000:00/host1/block/sdc", "disk", 8, 32, 4096);
        host.add_block("devices/virtual/block/loop0", "disk", 7, 0, 4096);
        host.write("udev/b8:32", "E:ID_SERIAL_SHORT=SER-C\nE:ID_WWN=0x5000c5\n");
        host.write(
            "proc/1/mountinfo",
            "40 1 8:32 / /data rw,relatime - xfs /dev/sdc rw\n",
        );

        let facts = DeviceScanner::new(host.config()).enumerate().unwrap();
        let names: Vec<&str> = facts.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["sdb", "sdb1", "sdc"]);

        let sdb = &facts[0];
        assert!(sdb.partitioned);
        assert_eq!(sdb.size, 1024 * 1024 * 1024);
        assert_eq!(sdb.physical_block_size, 4096);

        let sdb1 = &facts[1];
        assert_eq!(sdb1.partition_num, 1);
        assert_eq!(sdb1.parent, "sdb");
        assert_eq!((sdb1.major, sdb1.minor), (8, 17));

        let sdc = &facts[2];
        assert!(!sdc.partitioned);
        assert_eq!(sdc.serial, "SER-C");
        assert_eq!(sdc.wwid, "0x5000c5");
        assert_eq!(sdc.first_mount_point(), "/data");
    }

    #[test]
    fn test_loopback_only_and_filter() {
        let host = FakeHost::new();
        host.add_block("devices/pci0000:00/block/sda", "disk", 8, 0, 4096);
        host.add_block("devices/virtual/block/loop0", "disk", 7, 0, 4096);
        host.add_block("devices/virtual/block/loop1", "disk", 7, 1, 4096);

        let mut config = host.config();
        config.loopback_only = true;
        config.device_filter = ValueFilter::parse(&["loop{1...3}"]).unwrap();

        let facts = DeviceScanner::new(config).enumerate().unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].name, "loop1");
        assert!(facts[0].is_virtual);
    }

    #[test]
    fn test_swap_and_holders() {
        let host = FakeHost::new();
        let sdd = host.add_block("devices/pci0000:00/block/sdd", "disk", 8, 48, 4096);
        fs::create_dir_all(sdd.join("holders/dm-0")).unwrap();
        host.add_block("devices/pci0000:00/block/sde", "disk", 8, 64, 4096);
        host.write(
            "proc/swaps",
            "Filename Type Size Used Priority\n/dev/sde partition 2048 0 -2\n",
        );

        let facts = DeviceScanner::new(host.config()).enumerate().unwrap();
        assert_eq!(facts[0].master(), Some("dm-0"));
        assert!(!facts[0].swap_on);
        assert!(facts[1].swap_on);
    }

    #[test]
    fn test_missing_sysfs_is_io_error() {
        let config = ScannerConfig {
            sysfs_path: PathBuf::from("/nonexistent/sys"),
            ..Default::default()
        };
        assert!(matches!(
            DeviceScanner::new(config).enumerate(),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_partition_name() {
        assert_eq!(partition_name("sdb", 1), "sdb1");
        assert_eq!(partition_name("nvme0n1", 2), "nvme0n1p2");
        assert_eq!(partition_name("loop0", 1), "loop0p1");
    }
}
