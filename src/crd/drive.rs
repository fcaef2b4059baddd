//! DirectPVDrive CRD
//!
//! One record per block device a node agent observes. The spec carries the
//! operator's intent (ownership, format request, release request); the status
//! carries device facts captured by the prober together with the reconciled
//! lifecycle state and capacity accounting.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Condition, ConditionStatus};
use crate::labels::GROUP;

// =============================================================================
// Finalizers
// =============================================================================

/// Finalizer guarding a formatted drive's data until it is released
pub const DATA_PROTECTION_FINALIZER: &str = "directpv.min.io/data-protection";

/// Prefix of per-volume finalizers on a drive
pub const VOLUME_FINALIZER_PREFIX: &str = "directpv.min.io.volume/";

/// Per-volume finalizer string for `volume_name`
pub fn volume_finalizer(volume_name: &str) -> String {
    format!("{}{}", VOLUME_FINALIZER_PREFIX, volume_name)
}

// =============================================================================
// DirectPVDrive CRD
// =============================================================================

/// A block device managed (or merely observed) by a node agent.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "directpv.min.io",
    version = "v1beta1",
    kind = "DirectPVDrive",
    plural = "directpvdrives",
    shortname = "dpvd",
    status = "DriveStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".status.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".status.path"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.driveStatus"}"#,
    printcolumn = r#"{"name": "Free", "type": "integer", "jsonPath": ".status.freeCapacity"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct DriveSpec {
    /// Whether the operator has handed this drive to DirectPV
    #[serde(default)]
    pub owned: bool,

    /// Format request; cleared once applied or rejected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_format: Option<RequestedFormat>,

    /// Opaque taints copied through to the scheduler
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub drive_taint: BTreeMap<String, String>,

    /// Release/unrelease request; cleared once applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<DriveRequest>,
}

/// Alias used throughout the engine
pub type Drive = DirectPVDrive;

// =============================================================================
// Sub-Types
// =============================================================================

/// Desired formatting of a drive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestedFormat {
    /// Filesystem to create; empty means xfs
    #[serde(default)]
    pub filesystem: String,

    /// Overwrite an existing filesystem / unmount a foreign mount
    #[serde(default)]
    pub force: bool,

    /// Purge existing data
    #[serde(default)]
    pub purge: bool,

    /// Mountpoint override; empty means `<mount-root>/<fs-uuid>`
    #[serde(default)]
    pub mountpoint: String,

    /// Mount options
    #[serde(default)]
    pub mount_options: Vec<String>,
}

/// Lifecycle request on an owned drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DriveRequest {
    Release,
    Unrelease,
}

/// Lifecycle state of a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum DrivePhase {
    #[default]
    Available,
    Unavailable,
    Ready,
    InUse,
    Released,
    Terminating,
}

impl std::fmt::Display for DrivePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrivePhase::Available => write!(f, "Available"),
            DrivePhase::Unavailable => write!(f, "Unavailable"),
            DrivePhase::Ready => write!(f, "Ready"),
            DrivePhase::InUse => write!(f, "InUse"),
            DrivePhase::Released => write!(f, "Released"),
            DrivePhase::Terminating => write!(f, "Terminating"),
        }
    }
}

/// User-declared storage class of a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AccessTier {
    #[default]
    Unknown,
    Hot,
    Warm,
    Cold,
}

impl AccessTier {
    /// Parse a tier name case-insensitively; `None` for anything else
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "hot" => Some(AccessTier::Hot),
            "warm" => Some(AccessTier::Warm),
            "cold" => Some(AccessTier::Cold),
            "unknown" | "" => Some(AccessTier::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessTier::Unknown => write!(f, "Unknown"),
            AccessTier::Hot => write!(f, "Hot"),
            AccessTier::Warm => write!(f, "Warm"),
            AccessTier::Cold => write!(f, "Cold"),
        }
    }
}

/// Drive condition types
pub mod condition {
    pub const OWNED: &str = "Owned";
    pub const MOUNTED: &str = "Mounted";
    pub const FORMATTED: &str = "Formatted";
    pub const INITIALIZED: &str = "Initialized";
    pub const READY: &str = "Ready";
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a drive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriveStatus {
    /// Lifecycle state
    #[serde(default)]
    pub drive_status: DrivePhase,

    /// Node the device is attached to
    #[serde(default)]
    pub node_name: String,

    /// Canonical device path
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub major_number: u32,

    #[serde(default)]
    pub minor_number: u32,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub serial: String,

    #[serde(default)]
    pub wwid: String,

    #[serde(default)]
    pub vendor: String,

    #[serde(default)]
    pub logical_block_size: u64,

    #[serde(default)]
    pub physical_block_size: u64,

    /// Capacity in bytes: device size until formatted, filesystem size after
    #[serde(default)]
    pub total_capacity: u64,

    #[serde(default)]
    pub allocated_capacity: u64,

    #[serde(default)]
    pub free_capacity: u64,

    #[serde(default)]
    pub is_virtual: bool,

    #[serde(default)]
    pub read_only: bool,

    /// Partition number; 0 for whole disks
    #[serde(default)]
    pub partition_num: u32,

    #[serde(default)]
    pub partition_uuid: String,

    #[serde(default)]
    pub partition_type: String,

    #[serde(default)]
    pub partition_table_uuid: String,

    #[serde(default)]
    pub partition_table_type: String,

    /// Whether the device itself carries a partition table
    #[serde(default)]
    pub partitioned: bool,

    #[serde(default)]
    pub swap_on: bool,

    #[serde(default)]
    pub filesystem: String,

    #[serde(default)]
    pub filesystem_uuid: String,

    /// First mount point of the device
    #[serde(default)]
    pub mountpoint: String,

    #[serde(default)]
    pub mount_options: Vec<String>,

    /// Every mount point of the device
    #[serde(default)]
    pub mount_points: Vec<String>,

    #[serde(default)]
    pub dm_name: String,

    #[serde(default)]
    pub dm_uuid: String,

    #[serde(default)]
    pub md_uuid: String,

    /// Name of the device holding this one, if any
    #[serde(default)]
    pub master: String,

    #[serde(default)]
    pub access_tier: AccessTier,

    /// Topology segments of the drive's node
    #[serde(default)]
    pub topology: BTreeMap<String, String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl DriveStatus {
    /// Set a condition, stamping the transition time only when status flips
    pub fn set_condition(
        &mut self,
        r#type: &str,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        super::set_condition(&mut self.conditions, r#type, status, reason, message, now);
    }

    /// Whether the given condition is `True`
    pub fn condition_true(&self, r#type: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.r#type == r#type && c.status == ConditionStatus::True)
    }

    /// Owned, mounted and formatted
    pub fn is_initialized(&self) -> bool {
        self.condition_true(condition::OWNED)
            && self.condition_true(condition::MOUNTED)
            && self.condition_true(condition::FORMATTED)
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl DirectPVDrive {
    /// Status, or an empty one if the record has none yet
    pub fn status_or_default(&self) -> DriveStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Lifecycle state
    pub fn phase(&self) -> DrivePhase {
        self.status
            .as_ref()
            .map(|s| s.drive_status)
            .unwrap_or_default()
    }

    /// Node the drive belongs to
    pub fn node_name(&self) -> &str {
        self.status.as_ref().map(|s| s.node_name.as_str()).unwrap_or("")
    }

    /// Whether deletion has been requested
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some() || self.phase() == DrivePhase::Terminating
    }

    /// Volume names bound to this drive, from its per-volume finalizers
    pub fn volume_names(&self) -> Vec<String> {
        self.finalizers()
            .iter()
            .filter_map(|f| f.strip_prefix(VOLUME_FINALIZER_PREFIX))
            .map(str::to_string)
            .collect()
    }

    pub fn has_volume_finalizers(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f.starts_with(VOLUME_FINALIZER_PREFIX))
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Append a finalizer if absent; returns whether it was added
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers_mut().push(finalizer.to_string());
        true
    }

    /// Remove a finalizer; returns whether it was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let finalizers = self.finalizers_mut();
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        before != finalizers.len()
    }

    /// Fully-qualified resource kind for error messages
    pub fn kind_name() -> String {
        format!("directpvdrives.{}", GROUP)
    }
}
