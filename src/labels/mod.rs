//! Labels and Identifiers
//!
//! Resource-name and label-value sanitization, well-known label keys,
//! selectors, and ellipsis/glob value matching.

pub mod ellipsis;
pub mod keys;
pub mod sanitize;
pub mod selector;

pub use keys::*;
pub use sanitize::*;
pub use selector::*;
