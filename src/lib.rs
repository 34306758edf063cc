//! Hybrid published-content cache.
//!
//! Keeps a navigable snapshot of documents, media and members in memory and
//! keeps it consistent with a relational cache table that can be rebuilt and
//! verified against the canonical store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
mod util;
