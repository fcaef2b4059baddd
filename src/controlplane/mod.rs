//! Control Plane Module
//!
//! The cluster-wide half of DirectPV: volume placement, the CSI controller
//! service and the admission webhook that guards Drive and Volume records.

pub mod api;
pub mod controller;
pub mod scheduler;
pub mod validation;

pub use api::{AdmissionRouter, WebhookConfig, WebhookServer};
pub use controller::{ControllerConfig, ControllerServer};
pub use scheduler::{select_drive, Placement, Scheduler};
pub use validation::{validate_drive, validate_volume, Rejection};
