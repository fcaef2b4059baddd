//! CSI Service Surface
//!
//! Service traits for the controller and node planes, their request and
//! response types, the mapping of engine errors onto gRPC status codes, and
//! the framed socket transport that serves them.

pub mod endpoint;
pub mod status;
pub mod transport;
pub mod types;

pub use endpoint::{parse_endpoint, prepare_socket};
pub use transport::{CsiClient, CsiMessage, CsiServer, RpcStatus};
pub use types::*;

use crate::error::Result;
use async_trait::async_trait;

/// Controller plane: provisioning against the fleet's drives
#[async_trait]
pub trait CsiController: Send + Sync {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<CreateVolumeResponse>;

    /// Idempotent; an unknown volume succeeds
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<()>;

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse>;

    fn get_capabilities(&self) -> Vec<ControllerCapability>;
}

/// Node plane: host mounts and quotas for volumes bound to this node.
///
/// Every operation is safe to retry.
#[async_trait]
pub trait CsiNode: Send + Sync {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<()>;

    async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<()>;

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<()>;

    async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<()>;

    async fn get_volume_stats(&self, req: NodeGetVolumeStatsRequest) -> Result<VolumeUsage>;

    fn get_capabilities(&self) -> Vec<NodeCapability>;

    fn get_info(&self) -> NodeGetInfoResponse;
}
