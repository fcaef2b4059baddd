//! Host-local lock
//!
//! One node agent per host: the agent holds an exclusive `flock` on
//! `<mount-root>/.directpv.lock` for its whole lifetime.

use crate::error::{Error, Result};
use crate::hardware::mount::ensure_dir;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::info;

pub const LOCK_FILE_NAME: &str = ".directpv.lock";

/// Held lock; released on drop
#[derive(Debug)]
pub struct HostLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl HostLock {
    /// Take the lock under `mount_root` without blocking
    pub fn acquire(mount_root: &Path) -> Result<Self> {
        ensure_dir(mount_root)?;
        let path = mount_root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                Error::Busy {
                    device: path.display().to_string(),
                }
            } else {
                Error::sys("flock", errno)
            }
        })?;

        info!(path = %path.display(), "acquired host lock");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
