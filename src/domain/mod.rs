//! Domain layer
//!
//! Ports for the record stores and host facilities (mounts, quotas,
//! mkfs, clock) and the [`Runtime`] handle that bundles them.

pub mod ports;

pub use ports::*;
