//! Application contracts shared by the cache and its storage adapters.

pub mod cancel;
pub mod error;
pub mod repos;
pub mod serialization;
