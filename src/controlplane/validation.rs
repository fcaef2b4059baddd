//! Admission rules
//!
//! Checks applied to a Drive or Volume before a mutation is accepted. The
//! webhook answers with the rejection reason; the drive reconciler applies
//! the same drive rules again right before formatting.

use crate::crd::{Drive, DrivePhase, Volume};
use crate::error::Error;

/// A refused mutation, carrying the user-facing reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection(pub &'static str);

impl Rejection {
    pub const UNAVAILABLE: Rejection = Rejection("Unavailable drives cannot be added/formatted");
    pub const IN_USE: Rejection = Rejection("Drives in use cannot be formatted");
    pub const ROOT_PARTITION: Rejection =
        Rejection("Root partition'ed drives cannot be added/formatted");
    pub const FORCE_UNMOUNT: Rejection = Rejection("Force flag must be set to unmount and format");
    pub const XFS_ONLY: Rejection = Rejection("Only XFS is supported");
    pub const FORCE_REFORMAT: Rejection =
        Rejection("Force flag must be set to override format and remount");
    pub const USED_EXCEEDS_TOTAL: Rejection =
        Rejection("Used capacity cannot exceed total capacity");
    pub const BINDING_CHANGED: Rejection = Rejection("Volume binding cannot be changed");

    pub fn reason(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        Error::FailedPrecondition(r.0.to_string())
    }
}

/// Validate a Drive mutation. `old` is `None` on create.
pub fn validate_drive(old: Option<&Drive>, new: &Drive) -> Result<(), Rejection> {
    let status = new.status_or_default();
    let sets_owned = new.spec.owned && !old.is_some_and(|o| o.spec.owned);

    if status.drive_status == DrivePhase::Unavailable && sets_owned {
        return Err(Rejection::UNAVAILABLE);
    }
    if status.drive_status == DrivePhase::InUse && new.spec.requested_format.is_some() {
        return Err(Rejection::IN_USE);
    }
    if status.mountpoint == "/" && sets_owned {
        return Err(Rejection::ROOT_PARTITION);
    }

    let Some(format) = new.spec.requested_format.as_ref() else {
        return Ok(());
    };
    if !status.mountpoint.is_empty() && !format.force {
        return Err(Rejection::FORCE_UNMOUNT);
    }
    match format.filesystem.as_str() {
        "" => {}
        "xfs" => {
            if !status.filesystem.is_empty() && !format.force {
                return Err(Rejection::FORCE_REFORMAT);
            }
        }
        _ => return Err(Rejection::XFS_ONLY),
    }
    Ok(())
}

/// Validate a Volume mutation. `old` is `None` on create.
pub fn validate_volume(old: Option<&Volume>, new: &Volume) -> Result<(), Rejection> {
    if let Some(status) = new.status.as_ref() {
        if status.used_capacity > new.spec.total_capacity {
            return Err(Rejection::USED_EXCEEDS_TOTAL);
        }
    }
    if let Some(old) = old {
        let rebound = !old.spec.drive.is_empty() && old.spec.drive != new.spec.drive;
        let moved = !old.spec.node_name.is_empty() && old.spec.node_name != new.spec.node_name;
        if rebound || moved {
            return Err(Rejection::BINDING_CHANGED);
        }
    }
    Ok(())
}
