//! Mount, format and quota
//!
//! Host-facing implementations of the mount, formatter and quota ports plus
//! the idempotent mount helpers the reconcilers use.

pub mod format;
pub mod ops;
pub mod quota;
pub mod sys;

pub use format::MkfsFormatter;
pub use ops::*;
pub use quota::{allocate_project_id, XfsQuota};
pub use sys::SysMounter;
