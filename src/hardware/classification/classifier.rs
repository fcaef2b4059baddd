//! Device Classifier
//!
//! Decides whether an observed device can be offered to the operator
//! (`Available`) or must be left alone (`Unavailable`), and why.

use crate::crd::DrivePhase;
use crate::hardware::discovery::DeviceFact;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Devices smaller than this are never offered
pub const MIN_SUPPORTED_DEVICE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// Reasons
// =============================================================================

/// Why a device cannot be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnavailableReason {
    TooSmall,
    ReadOnly,
    Partitioned,
    SwapOn,
    HasMaster,
    MountedOutsideRoot,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            UnavailableReason::TooSmall => "too small",
            UnavailableReason::ReadOnly => "read only",
            UnavailableReason::Partitioned => "partitioned",
            UnavailableReason::SwapOn => "swap on",
            UnavailableReason::HasMaster => "has master device",
            UnavailableReason::MountedOutsideRoot => "mounted outside the engine's mount root",
        };
        f.write_str(reason)
    }
}

/// Outcome of classifying one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub reasons: Vec<UnavailableReason>,
}

impl Classification {
    pub fn is_available(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn phase(&self) -> DrivePhase {
        if self.is_available() {
            DrivePhase::Available
        } else {
            DrivePhase::Unavailable
        }
    }

    /// Reasons joined for a status message, e.g. `"too small, read only"`
    pub fn message(&self) -> String {
        self.reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// =============================================================================
// Device Classifier
// =============================================================================

/// Classifies devices against the engine's mount root
#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    mount_root: PathBuf,
}

impl DeviceClassifier {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Whether `mount_point` lies under the mount root
    pub fn is_engine_mount(&self, mount_point: &str) -> bool {
        Path::new(mount_point).starts_with(&self.mount_root)
    }

    pub fn classify(&self, fact: &DeviceFact) -> Classification {
        let mut reasons = Vec::new();

        if fact.size < MIN_SUPPORTED_DEVICE_SIZE {
            reasons.push(UnavailableReason::TooSmall);
        }
        if fact.read_only {
            reasons.push(UnavailableReason::ReadOnly);
        }
        if fact.partitioned {
            reasons.push(UnavailableReason::Partitioned);
        }
        if fact.swap_on {
            reasons.push(UnavailableReason::SwapOn);
        }
        if fact.master().is_some() {
            reasons.push(UnavailableReason::HasMaster);
        }
        if fact
            .mounts
            .iter()
            .any(|m| !self.is_engine_mount(&m.mount_point))
        {
            reasons.push(UnavailableReason::MountedOutsideRoot);
        }

        let classification = Classification { reasons };
        if !classification.is_available() {
            debug!(
                device = %fact.path,
                reasons = %classification.message(),
                "device is unavailable"
            );
        }
        classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::discovery::MountInfo;

    fn classifier() -> DeviceClassifier {
        DeviceClassifier::new("/var/lib/directpv/mnt")
    }

    fn healthy() -> DeviceFact {
        DeviceFact {
            name: "sdb".into(),
            path: "/dev/sdb".into(),
            size: 10 * 1024 * 1024 * 1024,
            ..Default::default()
        }
    }

    fn mounted_at(point: &str) -> MountInfo {
        MountInfo {
            root: "/".into(),
            mount_point: point.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_healthy_device_is_available() {
        let c = classifier().classify(&healthy());
        assert!(c.is_available());
        assert_eq!(c.phase(), DrivePhase::Available);
    }

    #[test]
    fn test_boundary_reasons() {
        let cases: Vec<(fn(&mut DeviceFact), UnavailableReason)> = vec![
            (|f| f.size = MIN_SUPPORTED_DEVICE_SIZE - 1, UnavailableReason::TooSmall),
            (|f| f.read_only = true, UnavailableReason::ReadOnly),
            (|f| f.partitioned = true, UnavailableReason::Partitioned),
            (|f| f.swap_on = true, UnavailableReason::SwapOn),
            (|f| f.holders = vec!["dm-0".into()], UnavailableReason::HasMaster),
            (|f| f.mounts = vec![mounted_at("/")], UnavailableReason::MountedOutsideRoot),
        ];

        for (mutate, reason) in cases {
            let mut fact = healthy();
            mutate(&mut fact);
            let c = classifier().classify(&fact);
            assert_eq!(c.phase(), DrivePhase::Unavailable);
            assert_eq!(c.reasons, vec![reason]);
        }
    }

    #[test]
    fn test_engine_mount_is_not_a_reason() {
        let mut fact = healthy();
        fact.mounts = vec![mounted_at("/var/lib/directpv/mnt/0d4c")];
        assert!(classifier().classify(&fact).is_available());

        // A sibling with a shared prefix is still outside the root.
        fact.mounts = vec![mounted_at("/var/lib/directpv/mnt2")];
        assert!(!classifier().classify(&fact).is_available());
    }

    #[test]
    fn test_message_joins_reasons() {
        let mut fact = healthy();
        fact.size = 0;
        fact.read_only = true;
        assert_eq!(classifier().classify(&fact).message(), "too small, read only");
    }
}
