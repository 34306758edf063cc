//! NuCache in-memory layer.
//!
//! Sits on top of the database cache repository:
//!
//! - **Node table**: one shared snapshot per (node id, preview) row
//! - **Navigation**: lazily hydrated document and media trees plus recycle bins
//! - **Events**: change notifications applied in arrival order by the consumer
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `nucache.toml`:
//!
//! ```toml
//! [cache]
//! auto_consume_interval_ms = 5000
//! consume_batch_limit = 100
//! serve_stale_on_unavailable = true
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
mod events;
mod hybrid;
mod navigation;
mod store;
mod trigger;

pub use config::CacheConfig;
pub use consumer::CacheConsumer;
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use hybrid::{HybridCache, VerifyReport};
pub use navigation::{ContentNavigation, NavigationTrees};
pub use store::{LoadTicket, Lookup, NodeStore};
pub use trigger::CacheTrigger;

/// Metric names emitted by the cache layer.
pub mod metric_names {
    pub use super::consumer::{METRIC_CACHE_CONSUME_MS, METRIC_EVENT_REQUEUED};
    pub use super::events::METRIC_EVENT_QUEUE_LEN;
    pub use super::hybrid::{
        METRIC_NODE_HIT, METRIC_NODE_MISS, METRIC_NODE_STALE, METRIC_REBUILD_MS,
        METRIC_REPOSITORY_LOAD_MS, METRIC_STALE_SERVED, METRIC_VERIFY_INCONSISTENT,
    };
    pub use super::navigation::METRIC_NAVIGATION_REHYDRATE;
}
