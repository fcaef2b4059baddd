//! Framed CSI transport
//!
//! Requests and responses travel over the plugin's unix socket as
//! length-prefixed JSON frames. A connection carries any number of
//! request/response pairs, answered in the order they arrive.

use super::{
    ControllerCapability, CreateVolumeRequest, CreateVolumeResponse, CsiController, CsiNode,
    DeleteVolumeRequest, NodeCapability, NodeGetInfoResponse, NodeGetVolumeStatsRequest,
    NodePublishVolumeRequest, NodeStageVolumeRequest, NodeUnpublishVolumeRequest,
    NodeUnstageVolumeRequest, PluginInfo, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, VolumeUsage,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, info, instrument, warn};

/// Largest frame either side accepts
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

// =============================================================================
// Messages
// =============================================================================

/// One frame on the wire: a request or the response to one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity ------------------------------------------------------
    GetPluginInfo,
    Probe,

    // ----- Controller ----------------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ControllerGetCapabilities,

    // ----- Node ----------------------------------------------------------
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    NodeGetVolumeStats(NodeGetVolumeStatsRequest),
    NodeGetCapabilities,
    NodeGetInfo,

    // ----- Responses -----------------------------------------------------
    PluginInfo(PluginInfo),
    Ready(bool),
    VolumeCreated(CreateVolumeResponse),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    ControllerCapabilities(Vec<ControllerCapability>),
    NodeCapabilities(Vec<NodeCapability>),
    NodeInfo(NodeGetInfoResponse),
    VolumeStats(VolumeUsage),
    /// Success with no payload
    Ok,
    Error(RpcStatus),
}

impl CsiMessage {
    /// RPC name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetPluginInfo => "GetPluginInfo",
            Self::Probe => "Probe",
            Self::CreateVolume(_) => "CreateVolume",
            Self::DeleteVolume(_) => "DeleteVolume",
            Self::ValidateVolumeCapabilities(_) => "ValidateVolumeCapabilities",
            Self::ControllerGetCapabilities => "ControllerGetCapabilities",
            Self::NodeStageVolume(_) => "NodeStageVolume",
            Self::NodeUnstageVolume(_) => "NodeUnstageVolume",
            Self::NodePublishVolume(_) => "NodePublishVolume",
            Self::NodeUnpublishVolume(_) => "NodeUnpublishVolume",
            Self::NodeGetVolumeStats(_) => "NodeGetVolumeStats",
            Self::NodeGetCapabilities => "NodeGetCapabilities",
            Self::NodeGetInfo => "NodeGetInfo",
            Self::PluginInfo(_) => "PluginInfo",
            Self::Ready(_) => "Ready",
            Self::VolumeCreated(_) => "VolumeCreated",
            Self::CapabilitiesValidated(_) => "CapabilitiesValidated",
            Self::ControllerCapabilities(_) => "ControllerCapabilities",
            Self::NodeCapabilities(_) => "NodeCapabilities",
            Self::NodeInfo(_) => "NodeInfo",
            Self::VolumeStats(_) => "VolumeStats",
            Self::Ok => "Ok",
            Self::Error(_) => "Error",
        }
    }
}

/// gRPC status carried by an error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: i32,
    pub message: String,
}

impl RpcStatus {
    pub fn code(&self) -> Code {
        Code::from_i32(self.code)
    }
}

impl From<Error> for RpcStatus {
    fn from(e: Error) -> Self {
        let status = Status::from(e);
        Self {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
    }
}

fn reply<T>(result: Result<T>, wrap: impl FnOnce(T) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(value) => wrap(value),
        Err(e) => CsiMessage::Error(e.into()),
    }
}

// =============================================================================
// Server
// =============================================================================

/// Serves the identity service plus whichever planes this process runs
pub struct CsiServer {
    plugin: PluginInfo,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl CsiServer {
    pub fn new(plugin: PluginInfo) -> Self {
        Self {
            plugin,
            controller: None,
            node: None,
        }
    }

    pub fn with_controller(mut self, controller: Arc<dyn CsiController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_node(mut self, node: Arc<dyn CsiNode>) -> Self {
        self.node = Some(node);
        self
    }

    /// Bind `socket`; the caller clears any stale socket file first
    pub fn bind(socket: &Path) -> Result<UnixListener> {
        let listener = UnixListener::bind(socket)?;
        info!(socket = %socket.display(), "CSI server listening");
        Ok(listener)
    }

    /// Accept connections on `listener` until `shutdown` is cancelled
    pub async fn serve_on(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "CSI accept failed");
                        continue;
                    }
                },
            };
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, shutdown).await {
                    warn!(error = %e, "CSI connection closed with error");
                }
            });
        }
        info!("CSI server stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, shutdown: CancellationToken) -> Result<()> {
        let mut framed = Framed::new(stream, codec());
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = framed.next() => frame,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            let response = match serde_json::from_slice::<CsiMessage>(&frame?) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => CsiMessage::Error(
                    Error::InvalidArgument(format!("malformed request: {e}")).into(),
                ),
            };
            framed.send(Bytes::from(serde_json::to_vec(&response)?)).await?;
        }
    }

    fn controller(&self) -> Result<&dyn CsiController> {
        self.controller
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("controller service is not served here".into()))
    }

    fn node(&self) -> Result<&dyn CsiNode> {
        self.node
            .as_deref()
            .ok_or_else(|| Error::Unimplemented("node service is not served here".into()))
    }

    /// Run one request against the served planes
    #[instrument(skip_all, fields(rpc = request.name()))]
    pub async fn dispatch(&self, request: CsiMessage) -> CsiMessage {
        debug!("CSI request received");
        match request {
            CsiMessage::GetPluginInfo => CsiMessage::PluginInfo(self.plugin.clone()),
            CsiMessage::Probe => CsiMessage::Ready(true),

            CsiMessage::CreateVolume(req) => match self.controller() {
                Ok(c) => reply(c.create_volume(req).await, CsiMessage::VolumeCreated),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::DeleteVolume(req) => match self.controller() {
                Ok(c) => reply(c.delete_volume(req).await, |()| CsiMessage::Ok),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::ValidateVolumeCapabilities(req) => match self.controller() {
                Ok(c) => reply(
                    c.validate_volume_capabilities(req).await,
                    CsiMessage::CapabilitiesValidated,
                ),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::ControllerGetCapabilities => reply(
                self.controller().map(|c| c.get_capabilities()),
                CsiMessage::ControllerCapabilities,
            ),

            CsiMessage::NodeStageVolume(req) => match self.node() {
                Ok(n) => reply(n.stage_volume(req).await, |()| CsiMessage::Ok),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::NodeUnstageVolume(req) => match self.node() {
                Ok(n) => reply(n.unstage_volume(req).await, |()| CsiMessage::Ok),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::NodePublishVolume(req) => match self.node() {
                Ok(n) => reply(n.publish_volume(req).await, |()| CsiMessage::Ok),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::NodeUnpublishVolume(req) => match self.node() {
                Ok(n) => reply(n.unpublish_volume(req).await, |()| CsiMessage::Ok),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::NodeGetVolumeStats(req) => match self.node() {
                Ok(n) => reply(n.get_volume_stats(req).await, CsiMessage::VolumeStats),
                Err(e) => CsiMessage::Error(e.into()),
            },
            CsiMessage::NodeGetCapabilities => reply(
                self.node().map(|n| n.get_capabilities()),
                CsiMessage::NodeCapabilities,
            ),
            CsiMessage::NodeGetInfo => reply(self.node().map(|n| n.get_info()), CsiMessage::NodeInfo),

            other => {
                warn!(message = other.name(), "response variant received as request");
                CsiMessage::Error(
                    Error::InvalidArgument(format!("{} is not a request", other.name())).into(),
                )
            }
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// One connection to a CSI socket
pub struct CsiClient {
    framed: Framed<UnixStream, LengthDelimitedCodec>,
}

impl CsiClient {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await?;
        Ok(Self {
            framed: Framed::new(stream, codec()),
        })
    }

    /// Send `request` and wait for its response
    pub async fn call(&mut self, request: &CsiMessage) -> Result<CsiMessage> {
        self.framed.send(Bytes::from(serde_json::to_vec(request)?)).await?;
        match self.framed.next().await {
            Some(frame) => Ok(serde_json::from_slice(&frame?)?),
            None => Err(Error::Internal("CSI server closed the connection".into())),
        }
    }
}
