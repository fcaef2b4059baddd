//! Hardware Discovery Module
//!
//! Enumerates block devices from sysfs, enriches them with udev, mount
//! table and on-disk metadata, and follows kernel uevents afterwards.

pub mod device;
pub mod mountinfo;
pub mod scanner;
pub mod udev;
pub mod uevent;

pub use device::*;
pub use mountinfo::MountInfo;
pub use scanner::{partition_name, DeviceScanner, ScannerConfig};
pub use udev::UdevData;
pub use uevent::{device_events, UeventMessage, UeventSocket};
