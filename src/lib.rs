//! DirectPV - node-local storage provisioner
//!
//! Discovers block devices on each node, records them as Drive resources,
//! formats and mounts the ones an operator claims, and carves per-pod
//! volumes out of them with XFS project quotas.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── controller ─────────────────────────────┐
//! │   CSI controller (CreateVolume) ──► Scheduler ──► Drive CAS update   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ┌────────────────────────────── webhook ──────────────────────────────┐
//! │   POST /validatedrive  POST /validatevolume  (axum + rustls)         │
//! └─────────────────────────────────────────────────────────────────────┘
//! ┌──────────────────────────── node agent ─────────────────────────────┐
//! │  sysfs / udev / netlink ──► DeviceIndex ──► DriveSync ──► Drives     │
//! │  Dispatcher<Drive>  ──► DriveReconciler  (format, mount, release)    │
//! │  Dispatcher<Volume> ──► VolumeReconciler (data root cleanup)         │
//! │  CSI node (stage, publish) ──► bind mounts + XFS project quota       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`hardware`]: device discovery, probes, classification, mount/quota
//! - [`node`]: the node agent's reconcilers and CSI node service
//! - [`controlplane`]: scheduler, CSI controller service, admission webhook
//! - [`dispatcher`]: watch, queue and retry machinery
//! - [`crd`]: Drive and Volume resources
//! - [`store`]: record stores (orchestrator and in-memory)
//! - [`domain`]: ports and the runtime handle
//! - [`error`]: error types and handling

pub mod controlplane;
pub mod crd;
pub mod csi;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod labels;
pub mod metrics;
pub mod node;
pub mod store;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use controlplane::{ControllerConfig, ControllerServer, Scheduler, WebhookConfig, WebhookServer};

pub use crd::{Drive, DrivePhase, DriveSpec, DriveStatus, Volume, VolumeSpec, VolumeStatus};

pub use domain::ports::{ObjectStore, Runtime};

pub use error::{Error, ErrorAction, ErrorKind, Result};

pub use hardware::{DeviceIndex, DeviceScanner, ScannerConfig};

pub use node::{DriveReconciler, DriveSync, NodeConfig, NodeServer, VolumeReconciler};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
