//! Event dispatcher
//!
//! Watch, queue and retry machinery shared by the drive and volume
//! reconcilers.

pub mod controller;
pub mod queue;

pub use controller::{Dispatcher, DispatcherConfig, Handler};
pub use queue::{EventKind, WorkItem, WorkQueue};
