//! Host mounter
//!
//! [`Mounter`] over `mount(2)`/`umount2(2)` and `/proc/self/mountinfo`.

use crate::domain::ports::{MountFlags, Mounter, UnmountFlags};
use crate::error::{Error, Result};
use crate::hardware::discovery::mountinfo::{self, MountInfo};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mounter backed by real syscalls
#[derive(Debug, Clone)]
pub struct SysMounter {
    mountinfo_path: PathBuf,
}

impl SysMounter {
    pub fn new() -> Self {
        Self {
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
        }
    }

    /// Read the mount table from `path` instead of `/proc/self/mountinfo`
    pub fn with_mountinfo(path: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo_path: path.into(),
        }
    }
}

impl Default for SysMounter {
    fn default() -> Self {
        Self::new()
    }
}

fn ms_flags(flags: MountFlags) -> MsFlags {
    let mut ms = MsFlags::empty();
    if flags.bind {
        ms |= MsFlags::MS_BIND;
    }
    if flags.read_only {
        ms |= MsFlags::MS_RDONLY;
    }
    ms
}

fn mnt_flags(flags: UnmountFlags) -> MntFlags {
    let mut mnt = MntFlags::empty();
    if flags.force {
        mnt |= MntFlags::MNT_FORCE;
    }
    if flags.detach {
        mnt |= MntFlags::MNT_DETACH;
    }
    if flags.expire {
        mnt |= MntFlags::MNT_EXPIRE;
    }
    mnt
}

impl Mounter for SysMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: &str,
    ) -> Result<()> {
        let fstype = (!fstype.is_empty()).then_some(fstype);
        let data = (!data.is_empty()).then_some(data);

        mount(Some(source), target, fstype, ms_flags(flags), data)
            .map_err(|e| Error::sys("mount", e))?;

        // The kernel ignores MS_RDONLY on the initial bind; a remount applies it.
        if flags.bind && flags.read_only {
            debug!(target = %target.display(), "remounting bind mount read-only");
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| Error::sys("mount", e))?;
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, flags: UnmountFlags) -> Result<()> {
        umount2(target, mnt_flags(flags)).map_err(|e| Error::sys("umount2", e))
    }

    fn mounts(&self) -> Result<Vec<MountInfo>> {
        mountinfo::read(&self.mountinfo_path)
    }
}
