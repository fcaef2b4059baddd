//! Node agent configuration

use crate::labels::LabelKey;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default root under which drives are mounted
pub const DEFAULT_MOUNT_ROOT: &str = "/var/lib/directpv/mnt";

/// Default kubelet plugin registration root
pub const DEFAULT_PLUGINS_DIR: &str = "/var/lib/kubelet/plugins";

/// Default mount options for a freshly formatted drive
pub const DEFAULT_MOUNT_OPTIONS: &[&str] = &["prjquota"];

/// Node agent configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name of this node in the orchestrator
    pub node_id: String,
    /// CSI driver identity
    pub identity: String,
    pub rack: String,
    pub zone: String,
    pub region: String,
    pub mount_root: PathBuf,
    pub plugins_dir: PathBuf,
    /// CSI endpoint URI
    pub endpoint: String,
    /// Maximum volumes per node reported by NodeGetInfo; 0 is unlimited
    pub max_volumes_per_node: i64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            identity: "directpv-min-io".to_string(),
            rack: "default".to_string(),
            zone: "default".to_string(),
            region: "default".to_string(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            plugins_dir: PathBuf::from(DEFAULT_PLUGINS_DIR),
            endpoint: "unix:///csi/csi.sock".to_string(),
            max_volumes_per_node: 0,
        }
    }
}

impl NodeConfig {
    /// Topology segments this node advertises
    pub fn topology(&self) -> BTreeMap<String, String> {
        [
            (LabelKey::TOPOLOGY_IDENTITY, &self.identity),
            (LabelKey::TOPOLOGY_NODE, &self.node_id),
            (LabelKey::TOPOLOGY_RACK, &self.rack),
            (LabelKey::TOPOLOGY_ZONE, &self.zone),
            (LabelKey::TOPOLOGY_REGION, &self.region),
        ]
        .into_iter()
        .map(|(k, v)| (k.as_str().to_string(), v.clone()))
        .collect()
    }

    /// Mount path of a drive with filesystem UUID `fs_uuid`
    pub fn drive_mount_path(&self, fs_uuid: &str) -> PathBuf {
        self.mount_root.join(fs_uuid)
    }

    /// Housekeeping directory next to the CSI socket
    pub fn data_dir(&self) -> PathBuf {
        self.plugins_dir.join(&self.identity).join("data-dir")
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_segments() {
        let config = NodeConfig {
            node_id: "node1".into(),
            region: "r1".into(),
            ..Default::default()
        };
        let topology = config.topology();
        assert_eq!(topology.len(), 5);
        assert_eq!(topology["directpv.min.io/node"], "node1");
        assert_eq!(topology["directpv.min.io/region"], "r1");
        assert_eq!(
            config.drive_mount_path("0d4c"),
            PathBuf::from("/var/lib/directpv/mnt/0d4c")
        );
    }
}
