//! Test doubles
//!
//! In-memory stand-ins for every port on [`Runtime`], plus [`runtime`] which
//! wires them together over in-memory record stores.

use crate::crd::{Drive, Volume};
use crate::domain::ports::{
    Clock, Formatter, MountFlags, Mounter, ObjectStore, ProjectQuota, QuotaManager, Runtime,
    UnmountFlags, WatchEvent, DEFAULT_SYSCALL_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::hardware::discovery::MountInfo;
use crate::hardware::mount::format::check_existing_filesystem;
use crate::hardware::probe::xfs;
use crate::labels::LabelSelector;
use crate::store::MemoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// Mounter
// =============================================================================

/// Mount table kept in memory
#[derive(Default)]
pub struct FakeMounter {
    table: Mutex<Vec<MountInfo>>,
    devices: Mutex<HashMap<PathBuf, (u32, u32)>>,
    next_id: AtomicUsize,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    fail_mounts: AtomicBool,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let mounts of `path` resolve to `(major, minor)`
    pub fn register_device(&self, path: impl Into<PathBuf>, major: u32, minor: u32) {
        self.devices.lock().insert(path.into(), (major, minor));
    }

    /// Seed an existing mount
    pub fn add_mount(&self, major: u32, minor: u32, root: &str, mount_point: &str) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u32 + 100;
        self.table.lock().push(MountInfo {
            mount_id: id,
            major,
            minor,
            root: root.to_string(),
            mount_point: mount_point.to_string(),
            mount_options: vec!["rw".to_string()],
            ..Default::default()
        });
    }

    pub fn set_fail_mounts(&self, fail: bool) {
        self.fail_mounts.store(fail, Ordering::SeqCst);
    }

    pub fn mount_calls(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmount_calls(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    /// The entry mounted at `target`, if any
    pub fn mounted_at(&self, target: &Path) -> Option<MountInfo> {
        let target = target.to_string_lossy();
        self.table
            .lock()
            .iter()
            .find(|m| m.mount_point == target)
            .cloned()
    }

    /// Resolve the device and root a new mount of `source` would show
    fn resolve(&self, source: &Path, bind: bool) -> ((u32, u32), String) {
        if !bind {
            let dev = self.devices.lock().get(source).copied().unwrap_or((0, 0));
            return (dev, "/".to_string());
        }
        // A bind mount inherits the device of the mount containing `source`.
        let table = self.table.lock();
        let parent = table
            .iter()
            .filter(|m| source.starts_with(&m.mount_point))
            .max_by_key(|m| m.mount_point.len());
        match parent {
            Some(m) => {
                let rel = source
                    .strip_prefix(&m.mount_point)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                let root = Path::new(&m.root).join(rel).to_string_lossy().to_string();
                ((m.major, m.minor), root)
            }
            None => ((0, 0), source.to_string_lossy().to_string()),
        }
    }
}

impl Mounter for FakeMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> Result<()> {
        if self.fail_mounts.load(Ordering::SeqCst) {
            return Err(Error::sys("mount", nix::errno::Errno::EIO));
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);

        let ((major, minor), root) = self.resolve(source, flags.bind);
        let mut options = vec![if flags.read_only { "ro" } else { "rw" }.to_string()];
        options.extend(data.split(',').filter(|o| !o.is_empty()).map(str::to_string));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u32 + 100;
        self.table.lock().push(MountInfo {
            mount_id: id,
            major,
            minor,
            root,
            mount_point: target.to_string_lossy().to_string(),
            mount_options: options,
            fs_type: fstype.to_string(),
            source: source.to_string_lossy().to_string(),
            ..Default::default()
        });
        Ok(())
    }

    fn unmount(&self, target: &Path, _flags: UnmountFlags) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        let target = target.to_string_lossy();
        let mut table = self.table.lock();
        // Last mount on top wins, as with the kernel.
        match table.iter().rposition(|m| m.mount_point == target) {
            Some(pos) => {
                table.remove(pos);
                Ok(())
            }
            None => Err(Error::sys("umount2", nix::errno::Errno::EINVAL)),
        }
    }

    fn mounts(&self) -> Result<Vec<MountInfo>> {
        Ok(self.table.lock().clone())
    }
}

// =============================================================================
// Quota
// =============================================================================

/// Project quotas kept in memory, keyed by device and project
#[derive(Default)]
pub struct FakeQuota {
    limits: Mutex<HashMap<(PathBuf, u32), ProjectQuota>>,
    paths: Mutex<HashMap<PathBuf, u32>>,
    sets: AtomicUsize,
}

impl FakeQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quota(&self, device: &Path, project_id: u32) -> Option<ProjectQuota> {
        self.limits.lock().get(&(device.to_path_buf(), project_id)).copied()
    }

    /// Project a directory was tagged with
    pub fn project_of(&self, path: &Path) -> Option<u32> {
        self.paths.lock().get(path).copied()
    }

    pub fn set_usage(&self, device: &Path, project_id: u32, used: u64) {
        if let Some(q) = self.limits.lock().get_mut(&(device.to_path_buf(), project_id)) {
            q.used_bytes = used;
        }
    }

    pub fn set_calls(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.limits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QuotaManager for FakeQuota {
    fn set_project_quota(
        &self,
        device: &Path,
        path: &Path,
        project_id: u32,
        hard_limit: u64,
    ) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().insert(path.to_path_buf(), project_id);
        let mut limits = self.limits.lock();
        let entry = limits
            .entry((device.to_path_buf(), project_id))
            .or_default();
        entry.hard_limit = hard_limit;
        entry.soft_limit = hard_limit;
        Ok(())
    }

    fn get_project_quota(&self, device: &Path, project_id: u32) -> Result<Option<ProjectQuota>> {
        Ok(self.quota(device, project_id))
    }

    fn remove_project_quota(&self, device: &Path, project_id: u32) -> Result<()> {
        self.limits.lock().remove(&(device.to_path_buf(), project_id));
        self.paths.lock().retain(|_, id| *id != project_id);
        Ok(())
    }
}

// =============================================================================
// Formatter
// =============================================================================

/// Writes an XFS superblock into a regular file standing in for a device
pub struct FakeFormatter {
    block_size: u32,
    busy: Mutex<HashSet<PathBuf>>,
    formatted: Mutex<Vec<(PathBuf, String)>>,
}

impl Default for FakeFormatter {
    fn default() -> Self {
        Self {
            block_size: 4096,
            busy: Mutex::new(HashSet::new()),
            formatted: Mutex::new(Vec::new()),
        }
    }
}

impl FakeFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_busy(&self, device: impl Into<PathBuf>) {
        self.busy.lock().insert(device.into());
    }

    /// `(device, fs_uuid)` of every successful format
    pub fn formatted(&self) -> Vec<(PathBuf, String)> {
        self.formatted.lock().clone()
    }
}

#[async_trait]
impl Formatter for FakeFormatter {
    async fn format_xfs(&self, device: &Path, fs_uuid: &str, force: bool) -> Result<()> {
        if self.busy.lock().contains(device) {
            return Err(Error::Busy {
                device: device.display().to_string(),
            });
        }
        check_existing_filesystem(device, force)?;

        let len = std::fs::metadata(device)?.len();
        let dblocks = len / u64::from(self.block_size);
        let sb = xfs::encode(fs_uuid, self.block_size, dblocks, dblocks, "DIRECTPV")?;

        let mut image = std::fs::read(device)?;
        if image.len() < sb.len() {
            image.resize(sb.len(), 0);
        }
        image[..sb.len()].copy_from_slice(&sb);
        std::fs::write(device, image)?;

        self.formatted
            .lock()
            .push((device.to_path_buf(), fs_uuid.to_string()));
        Ok(())
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock that only moves when told to
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// =============================================================================
// Record store
// =============================================================================

/// Store whose writes fail with an I/O error while `fail_writes` is set
pub struct FlakyStore<K: Clone + Send + Sync + 'static> {
    inner: Arc<dyn ObjectStore<K>>,
    fail_writes: AtomicBool,
}

impl<K: Clone + Send + Sync + 'static> FlakyStore<K> {
    pub fn new(inner: Arc<dyn ObjectStore<K>>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "store unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ObjectStore<K> for FlakyStore<K>
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K> {
        self.inner.get(name).await
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        self.inner.list(selector).await
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.check()?;
        self.inner.create(obj).await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.check()?;
        self.inner.update(obj).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(name).await
    }

    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>> {
        self.inner.watch(selector)
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// Concrete handles to the fakes behind a test [`Runtime`]
#[derive(Clone)]
pub struct Fakes {
    pub drives: Arc<MemoryStore<Drive>>,
    pub volumes: Arc<MemoryStore<Volume>>,
    pub mounter: Arc<FakeMounter>,
    pub quota: Arc<FakeQuota>,
    pub formatter: Arc<FakeFormatter>,
    pub clock: Arc<FixedClock>,
}

/// A runtime over fresh fakes
pub fn runtime() -> (Runtime, Fakes) {
    let fakes = Fakes {
        drives: MemoryStore::new(),
        volumes: MemoryStore::new(),
        mounter: Arc::new(FakeMounter::new()),
        quota: Arc::new(FakeQuota::new()),
        formatter: Arc::new(FakeFormatter::new()),
        clock: Arc::new(FixedClock::default()),
    };
    let rt = Runtime {
        drives: fakes.drives.clone(),
        volumes: fakes.volumes.clone(),
        mounter: fakes.mounter.clone(),
        quota: fakes.quota.clone(),
        formatter: fakes.formatter.clone(),
        clock: fakes.clock.clone(),
        syscall_timeout: DEFAULT_SYSCALL_TIMEOUT,
    };
    (rt, fakes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_mount_inherits_device() {
        let mounter = FakeMounter::new();
        mounter.add_mount(8, 16, "/", "/mnt/drive");
        mounter
            .mount(
                Path::new("/mnt/drive/pvc-1"),
                Path::new("/staging/pvc-1"),
                "",
                MountFlags::bind(),
                "",
            )
            .unwrap();

        let m = mounter.mounted_at(Path::new("/staging/pvc-1")).unwrap();
        assert_eq!((m.major, m.minor), (8, 16));
        assert_eq!(m.root, "/pvc-1");

        mounter.unmount(Path::new("/staging/pvc-1"), UnmountFlags::default()).unwrap();
        assert!(mounter.mounted_at(Path::new("/staging/pvc-1")).is_none());
    }

    #[tokio::test]
    async fn test_fake_formatter_writes_superblock() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 1024 * 1024]).unwrap();

        let formatter = FakeFormatter::new();
        let uuid = "0d4c1c2c-7e2b-4b69-9a5a-2b8f6f9a1e11";
        formatter.format_xfs(file.path(), uuid, false).await.unwrap();

        let info = crate::hardware::probe::probe_device_filesystem(file.path(), 0).unwrap();
        assert_eq!(info.uuid, uuid);
        assert_eq!(info.total_capacity, 1024 * 1024);

        // A second format without force hits the existing filesystem.
        assert!(formatter.format_xfs(file.path(), uuid, false).await.is_err());
    }
}
