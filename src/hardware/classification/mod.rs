//! Hardware Classification Module
//!
//! Classifies observed devices as usable or not.

pub mod classifier;

pub use classifier::*;
