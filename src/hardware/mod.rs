//! Hardware Module
//!
//! Device discovery, on-disk metadata probes, classification, the device
//! index, and the mount/format/quota layer.

pub mod classification;
pub mod discovery;
pub mod mount;
pub mod probe;
pub mod registry;

pub use classification::*;
pub use discovery::*;
pub use registry::*;
