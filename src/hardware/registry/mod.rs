//! Device Registry Module
//!
//! The in-memory index of observed devices and the events it fans out.

pub mod events;
pub mod index;

pub use events::*;
pub use index::*;
