//! XFS project quotas
//!
//! Project limits are set with `quotactl(Q_XSETQLIM, PRJQUOTA)` and read back
//! with `Q_XGETQUOTA`. A directory joins a project through the
//! `FS_IOC_FSGETXATTR`/`FS_IOC_FSSETXATTR` ioctls with `PROJINHERIT` set, so
//! everything created beneath it is charged to the same project.

use crate::domain::ports::{ProjectQuota, QuotaManager};
use crate::error::{Error, Result};
use nix::errno::Errno;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, info};

// =============================================================================
// Kernel ABI
// =============================================================================

const PRJQUOTA: i32 = 2;
const SUBCMD_SHIFT: i32 = 8;
const Q_XGETQUOTA: i32 = 0x5803;
const Q_XSETQLIM: i32 = 0x5804;

const FS_DQUOT_VERSION: i8 = 1;
const XFS_PROJ_QUOTA: i8 = 2;
const FS_DQ_BSOFT: u16 = 4;
const FS_DQ_BHARD: u16 = 8;

/// Quota limits are expressed in 512-byte basic blocks
const BASIC_BLOCK: u64 = 512;

const FS_XFLAG_PROJINHERIT: u32 = 0x200;

/// `struct fs_disk_quota` from `linux/dqblk_xfs.h`
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct FsDiskQuota {
    version: i8,
    flags: i8,
    fieldmask: u16,
    id: u32,
    blk_hardlimit: u64,
    blk_softlimit: u64,
    ino_hardlimit: u64,
    ino_softlimit: u64,
    bcount: u64,
    icount: u64,
    itimer: i32,
    btimer: i32,
    iwarns: u16,
    bwarns: u16,
    itimer_hi: i8,
    btimer_hi: i8,
    rtbtimer_hi: i8,
    padding2: i8,
    rtb_hardlimit: u64,
    rtb_softlimit: u64,
    rtbcount: u64,
    rtbtimer: i32,
    rtbwarns: u16,
    padding3: i16,
    padding4: [u8; 8],
}

/// `struct fsxattr` from `linux/fs.h`
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FsXattr {
    xflags: u32,
    extsize: u32,
    nextents: u32,
    projid: u32,
    cowextsize: u32,
    pad: [u8; 8],
}

nix::ioctl_read_bad!(fs_ioc_fsgetxattr, 0x801c_581f, FsXattr);
nix::ioctl_write_ptr_bad!(fs_ioc_fssetxattr, 0x401c_5820, FsXattr);

fn qcmd(cmd: i32) -> i32 {
    (cmd << SUBCMD_SHIFT) | PRJQUOTA
}

fn to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BASIC_BLOCK)
}

fn quotactl(cmd: i32, device: &Path, id: u32, dq: &mut FsDiskQuota) -> Result<()> {
    let special = CString::new(device.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument(format!("device path {}", device.display())))?;
    // SAFETY: `special` is NUL-terminated and `dq` is a live fs_disk_quota
    // for the duration of the call.
    let rc = unsafe {
        libc::quotactl(
            qcmd(cmd),
            special.as_ptr(),
            id as libc::c_int,
            (dq as *mut FsDiskQuota).cast::<libc::c_char>(),
        )
    };
    if rc < 0 {
        return Err(Error::sys("quotactl", Errno::last()));
    }
    Ok(())
}

// =============================================================================
// Project IDs
// =============================================================================

/// Project ID for a volume UID: sha256, first four bytes little-endian,
/// linearly probed past `taken` and zero
pub fn allocate_project_id(volume_uid: &str, taken: &HashSet<u32>) -> u32 {
    let digest = Sha256::digest(volume_uid.as_bytes());
    let mut id = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    while id == 0 || taken.contains(&id) {
        id = id.wrapping_add(1);
    }
    id
}

// =============================================================================
// XFS Quota Manager
// =============================================================================

/// [`QuotaManager`] over the XFS quota syscalls
#[derive(Debug, Default, Clone, Copy)]
pub struct XfsQuota;

impl XfsQuota {
    fn set_project_id(path: &Path, project_id: u32) -> Result<()> {
        let dir = File::open(path)?;
        let fd = dir.as_raw_fd();
        let mut attr = FsXattr::default();
        // SAFETY: `fd` stays open for both calls and `attr` matches the
        // kernel's struct fsxattr layout.
        unsafe {
            fs_ioc_fsgetxattr(fd, &mut attr).map_err(|e| Error::sys("FS_IOC_FSGETXATTR", e))?;
        }
        attr.projid = project_id;
        attr.xflags |= FS_XFLAG_PROJINHERIT;
        unsafe {
            fs_ioc_fssetxattr(fd, &attr).map_err(|e| Error::sys("FS_IOC_FSSETXATTR", e))?;
        }
        Ok(())
    }

    fn set_limits(device: &Path, project_id: u32, hard_limit: u64) -> Result<()> {
        let blocks = to_blocks(hard_limit);
        let mut dq = FsDiskQuota {
            version: FS_DQUOT_VERSION,
            flags: XFS_PROJ_QUOTA,
            fieldmask: FS_DQ_BHARD | FS_DQ_BSOFT,
            id: project_id,
            blk_hardlimit: blocks,
            blk_softlimit: blocks,
            ..Default::default()
        };
        quotactl(Q_XSETQLIM, device, project_id, &mut dq)
    }
}

impl QuotaManager for XfsQuota {
    fn set_project_quota(
        &self,
        device: &Path,
        path: &Path,
        project_id: u32,
        hard_limit: u64,
    ) -> Result<()> {
        if let Some(current) = self.get_project_quota(device, project_id)? {
            if current.hard_limit == to_blocks(hard_limit) * BASIC_BLOCK {
                debug!(device = %device.display(), project_id, "quota already set");
                return Ok(());
            }
        }

        Self::set_project_id(path, project_id)?;
        Self::set_limits(device, project_id, hard_limit)?;
        info!(
            device = %device.display(),
            path = %path.display(),
            project_id,
            hard_limit,
            "project quota set"
        );
        Ok(())
    }

    fn get_project_quota(&self, device: &Path, project_id: u32) -> Result<Option<ProjectQuota>> {
        let mut dq = FsDiskQuota::default();
        match quotactl(Q_XGETQUOTA, device, project_id, &mut dq) {
            Ok(()) => {}
            Err(Error::Sys {
                source: Errno::ENOENT | Errno::ESRCH,
                ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        }
        if dq.blk_hardlimit == 0 {
            return Ok(None);
        }
        Ok(Some(ProjectQuota {
            hard_limit: dq.blk_hardlimit * BASIC_BLOCK,
            soft_limit: dq.blk_softlimit * BASIC_BLOCK,
            used_bytes: dq.bcount * BASIC_BLOCK,
        }))
    }

    fn remove_project_quota(&self, device: &Path, project_id: u32) -> Result<()> {
        Self::set_limits(device, project_id, 0)
    }
}
