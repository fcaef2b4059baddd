//! CSI request and response types
//!
//! The subset of the CSI v1 data model the controller and node services
//! speak, as plain serde structs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Volume context key carrying the pod name on publish
pub const POD_NAME_CONTEXT_KEY: &str = "csi.storage.k8s.io/pod.name";

/// Volume context key carrying the pod namespace on publish
pub const POD_NAMESPACE_CONTEXT_KEY: &str = "csi.storage.k8s.io/pod.namespace";

/// CreateVolume parameter selecting a drive access tier
pub const ACCESS_TIER_PARAMETER: &str = "access-tier";

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// How a volume may be accessed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    #[default]
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Requested capability of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    /// Filesystem type of a mount volume; empty means the driver default
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl VolumeCapability {
    /// Single-node-writer mount with the given filesystem
    pub fn single_node_writer(fs_type: &str) -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            fs_type: fs_type.to_string(),
            mount_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerCapability {
    CreateDeleteVolume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Topology segments, e.g. `{"directpv.min.io/zone": "z1"}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

impl Topology {
    pub fn new<I, K, V>(segments: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            segments: segments
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Controller messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

/// A provisioned volume as reported back to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: CsiVolume,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// Echo of the capabilities when every one is supported
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: String,
}

// ---------------------------------------------------------------------------
// Node messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: VolumeCapability,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
}

/// Byte usage of a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub available: i64,
    pub total: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    /// 0 means no limit
    pub max_volumes_per_node: i64,
    pub accessible_topology: Option<Topology>,
}

/// Identity of the plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}
