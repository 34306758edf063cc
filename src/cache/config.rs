//! Cache configuration.
//!
//! Controls event consumption and read-side fallbacks via `nucache.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_REBUILD_PAGE_SIZE: u32 = 500;

/// Cache configuration from `nucache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Auto-consume interval (ms); zero disables the background loop.
    pub auto_consume_interval_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Consume right after publishing from the trigger.
    pub consume_on_write: bool,
    /// Serve a stale in-memory node when the repository cannot be reached.
    pub serve_stale_on_unavailable: bool,
    /// Run `verify_and_repair` during bootstrap.
    pub verify_on_startup: bool,
    /// Let `verify_and_repair` rebuild kinds found inconsistent.
    pub rebuild_on_inconsistency: bool,
    /// Canonical rows read per page during a rebuild.
    pub rebuild_page_size: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            consume_on_write: true,
            serve_stale_on_unavailable: true,
            verify_on_startup: true,
            rebuild_on_inconsistency: true,
            rebuild_page_size: DEFAULT_REBUILD_PAGE_SIZE,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            auto_consume_interval_ms: settings.auto_consume_interval_ms,
            consume_batch_limit: settings.consume_batch_limit.get(),
            consume_on_write: settings.consume_on_write,
            serve_stale_on_unavailable: settings.serve_stale_on_unavailable,
            verify_on_startup: settings.verify_on_startup,
            rebuild_on_inconsistency: settings.rebuild_on_inconsistency,
            rebuild_page_size: settings.rebuild_page_size.get(),
        }
    }
}

impl CacheConfig {
    /// Interval of the background consumer, if enabled.
    pub fn auto_consume_interval(&self) -> Option<Duration> {
        (self.auto_consume_interval_ms > 0)
            .then(|| Duration::from_millis(self.auto_consume_interval_ms))
    }

    /// Batch limit clamped to at least one event.
    pub fn batch_limit(&self) -> usize {
        self.consume_batch_limit.max(1)
    }
}
