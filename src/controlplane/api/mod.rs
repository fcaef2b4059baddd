//! API Module
//!
//! The admission webhook: review handlers and the HTTPS server around them.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
