//! Node Agent Module
//!
//! Everything that runs on a storage node: the device-to-Drive sync loop,
//! the Drive and Volume reconcilers, the CSI node service and the host lock.

pub mod config;
pub mod drive;
pub mod lock;
pub mod sync;
pub mod volume;

pub use config::NodeConfig;
pub use drive::DriveReconciler;
pub use lock::HostLock;
pub use sync::DriveSync;
pub use volume::{NodeServer, VolumeReconciler};
