//! Domain layer types and invariants.

pub mod content;
pub mod error;
pub mod navigation;
pub mod scope;
pub mod types;
