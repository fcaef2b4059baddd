//! Safe mount operations
//!
//! Idempotent wrappers over a [`Mounter`]: mounting onto a path that is
//! already a mount point and unmounting a path that is not are both no-ops.

use crate::domain::ports::{MountFlags, Mounter, UnmountFlags};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::{debug, info};

/// Whether `target` is currently a mount point
pub fn is_mounted(mounter: &dyn Mounter, target: &Path) -> Result<bool> {
    let target = target.to_string_lossy();
    Ok(mounter.mounts()?.iter().any(|m| m.mount_point == target))
}

/// Create `dir` with mode 0755 if absent; fail if it exists but is not a
/// directory
pub fn ensure_dir(dir: &Path) -> Result<()> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::InvalidArgument(format!(
            "{} exists and is not a directory",
            dir.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            DirBuilder::new().recursive(true).mode(0o755).create(dir)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Mount `source` on `target` unless `target` is already a mount point
pub fn safe_mount(
    mounter: &dyn Mounter,
    source: &Path,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> Result<()> {
    ensure_dir(target)?;
    if is_mounted(mounter, target)? {
        debug!(target = %target.display(), "target already mounted");
        return Ok(());
    }

    debug!(
        source = %source.display(),
        target = %target.display(),
        fstype,
        bind = flags.bind,
        read_only = flags.read_only,
        "mounting"
    );
    mounter.mount(source, target, fstype, flags, data)
}

/// Unmount `target` if it is a mount point
pub fn safe_unmount(mounter: &dyn Mounter, target: &Path, flags: UnmountFlags) -> Result<()> {
    if !is_mounted(mounter, target)? {
        debug!(target = %target.display(), "target already unmounted");
        return Ok(());
    }
    mounter.unmount(target, flags)
}

/// Forced, lazy unmount used only when tearing a drive down
pub fn force_unmount(mounter: &dyn Mounter, target: &Path) -> Result<()> {
    info!(target = %target.display(), "force unmounting drive");
    safe_unmount(
        mounter,
        target,
        UnmountFlags {
            force: true,
            detach: true,
            expire: false,
        },
    )
}

/// Fail if two of the given drive mount points are backed by the same device
pub fn validate_drive_mounts(mounter: &dyn Mounter, mount_points: &[String]) -> Result<()> {
    let mounts = mounter.mounts()?;
    let mut seen: HashMap<(u32, u32), &str> = HashMap::new();

    for point in mount_points {
        let Some(m) = mounts.iter().find(|m| &m.mount_point == point) else {
            continue;
        };
        if let Some(other) = seen.insert((m.major, m.minor), point.as_str()) {
            if other != point {
                return Err(Error::FailedPrecondition(format!(
                    "{} and {} are mounts of the same device {}:{}",
                    other, point, m.major, m.minor
                )));
            }
        }
    }
    Ok(())
}
