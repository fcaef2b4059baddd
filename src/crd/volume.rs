//! DirectPVVolume CRD
//!
//! A per-pod slice of a drive. The scheduler creates the record and binds it
//! to a drive; the node agent stages and publishes it.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, ConditionStatus};

// =============================================================================
// DirectPVVolume CRD
// =============================================================================

/// A volume carved out of a drive and bind-mounted into a pod.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "directpv.min.io",
    version = "v1beta1",
    kind = "DirectPVVolume",
    plural = "directpvvolumes",
    shortname = "dpvv",
    status = "VolumeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Drive", "type": "string", "jsonPath": ".spec.drive"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.totalCapacity"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Node the bound drive lives on
    pub node_name: String,

    /// Name of the bound drive
    pub drive: String,

    /// Canonical path of the bound drive at bind time
    #[serde(default)]
    pub drive_path: String,

    /// Requested size in bytes
    pub total_capacity: u64,

    #[serde(default)]
    pub access_mode: AccessMode,
}

/// Alias used throughout the engine
pub type Volume = DirectPVVolume;

/// CSI access mode; only single-node-writer is served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AccessMode {
    #[default]
    SingleNodeWriter,
}

/// Volume condition types
pub mod condition {
    pub const STAGED: &str = "Staged";
    pub const PUBLISHED: &str = "Published";
    pub const READY: &str = "Ready";
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of a volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    #[serde(default)]
    pub available_capacity: u64,

    #[serde(default)]
    pub used_capacity: u64,

    /// CSI staging path while staged
    #[serde(default)]
    pub staging_path: String,

    /// Container target path while published
    #[serde(default)]
    pub container_path: String,

    #[serde(default)]
    pub pod_name: String,

    #[serde(default)]
    pub pod_namespace: String,

    /// XFS project id assigned on first stage
    #[serde(default)]
    pub project_id: u32,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl VolumeStatus {
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

    pub fn condition_true(&self, r#type: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.r#type == r#type && c.status == ConditionStatus::True)
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl DirectPVVolume {
    pub fn status_or_default(&self) -> VolumeStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn is_staged(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| !s.staging_path.is_empty())
            .unwrap_or(false)
    }

    pub fn is_published(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| !s.container_path.is_empty())
            .unwrap_or(false)
    }

    /// Recompute available capacity from used; clamps used to total
    pub fn set_usage(&mut self, used: u64) {
        let total = self.spec.total_capacity;
        let status = self.status.get_or_insert_with(VolumeStatus::default);
        status.used_capacity = used.min(total);
        status.available_capacity = total - status.used_capacity;
    }
}
