//! XFS formatting
//!
//! [`Formatter`] that shells out to `mkfs.xfs` after checking that the device
//! is not mounted and, unless forced, carries no filesystem.

use crate::domain::ports::{Formatter, DEFAULT_SYSCALL_TIMEOUT};
use crate::error::{Error, Result};
use crate::hardware::discovery::mountinfo;
use crate::hardware::probe;
use async_trait::async_trait;
use nix::sys::stat::{major, minor, stat};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Label written on every filesystem the engine creates
pub const FS_LABEL: &str = "DIRECTPV";

/// Runs `mkfs.xfs`
#[derive(Debug, Clone)]
pub struct MkfsFormatter {
    mkfs_path: PathBuf,
    mountinfo_path: PathBuf,
    timeout: Duration,
}

impl Default for MkfsFormatter {
    fn default() -> Self {
        Self {
            mkfs_path: PathBuf::from("mkfs.xfs"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            timeout: DEFAULT_SYSCALL_TIMEOUT,
        }
    }
}

impl MkfsFormatter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Arguments for formatting `device` with `fs_uuid`
    pub fn mkfs_args(device: &Path, fs_uuid: &str) -> Vec<String> {
        vec![
            "-f".to_string(),
            "-i".to_string(),
            "maxpct=50".to_string(),
            "-m".to_string(),
            format!("uuid={fs_uuid}"),
            "-L".to_string(),
            FS_LABEL.to_string(),
            device.display().to_string(),
        ]
    }

    fn check_not_mounted(&self, device: &Path) -> Result<()> {
        let st = stat(device).map_err(|e| Error::sys("stat", e))?;
        let (maj, min) = (major(st.st_rdev) as u32, minor(st.st_rdev) as u32);
        let mounts = mountinfo::read(&self.mountinfo_path)?;
        if let Some(m) = mounts.iter().find(|m| m.major == maj && m.minor == min) {
            warn!(device = %device.display(), mount_point = %m.mount_point, "refusing to format mounted device");
            return Err(Error::Busy {
                device: device.display().to_string(),
            });
        }
        Ok(())
    }
}

/// Refuse to overwrite an existing filesystem without `force`
pub fn check_existing_filesystem(device: &Path, force: bool) -> Result<()> {
    if force {
        return Ok(());
    }
    match probe::probe_device_filesystem(device, 0) {
        Ok(fs) => Err(Error::FailedPrecondition(format!(
            "{} already has a {} filesystem; force flag not set",
            device.display(),
            fs.fs_type
        ))),
        Err(Error::FilesystemNotFound) | Err(Error::Corrupt { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl Formatter for MkfsFormatter {
    async fn format_xfs(&self, device: &Path, fs_uuid: &str, force: bool) -> Result<()> {
        self.check_not_mounted(device)?;
        check_existing_filesystem(device, force)?;

        info!(device = %device.display(), fs_uuid, "formatting device with xfs");
        let output = Command::new(&self.mkfs_path)
            .args(Self::mkfs_args(device, fs_uuid))
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("mkfs.xfs {}", device.display()),
                after: self.timeout,
            })??;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "mkfs.xfs {} failed: {}",
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
