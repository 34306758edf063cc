//! Wiring of the cache runtime from resolved settings.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::cancel::CancelToken;
use crate::application::repos::{DatabaseCacheRepository, NavigationRepo};
use crate::cache::{CacheConfig, CacheConsumer, CacheTrigger, EventQueue, HybridCache};
use crate::config::Settings;
use crate::infra::db::PostgresRepositories;
use crate::infra::error::InfraError;

/// Running cache with its write path and optional background consumer.
pub struct CacheRuntime {
    pub cache: Arc<HybridCache>,
    pub trigger: Arc<CacheTrigger>,
    pub consumer: Arc<CacheConsumer>,
    auto_consume: Option<JoinHandle<()>>,
}

impl CacheRuntime {
    pub fn has_auto_consume(&self) -> bool {
        self.auto_consume.is_some()
    }

    /// Stop the background consumer and flush whatever is still queued.
    pub async fn shutdown(mut self) -> Result<usize, InfraError> {
        if let Some(handle) = self.auto_consume.take() {
            handle.abort();
        }
        let flushed = self.consumer.consume_all().await?;
        info!(flushed, "Cache runtime stopped");
        Ok(flushed)
    }
}

impl Drop for CacheRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_consume.take() {
            handle.abort();
        }
    }
}

/// Connect to Postgres, apply migrations and start the cache.
pub async fn start(settings: &Settings) -> Result<CacheRuntime, InfraError> {
    let url = settings.database.url.as_deref().ok_or_else(|| {
        InfraError::configuration("database.url must be set (NUCACHE__DATABASE__URL)")
    })?;

    let pool = PostgresRepositories::connect(
        url,
        settings.database.max_connections.get(),
        settings.database.acquire_timeout,
    )
    .await
    .map_err(|err| InfraError::database(err.to_string()))?;

    if settings.database.run_migrations {
        PostgresRepositories::run_migrations(&pool)
            .await
            .map_err(|err| InfraError::database(err.to_string()))?;
    }

    let repositories = Arc::new(
        PostgresRepositories::new(pool)
            .with_page_size(settings.cache.rebuild_page_size.get() as usize),
    );
    repositories
        .health_check()
        .await
        .map_err(|err| InfraError::database(err.to_string()))?;

    start_with(
        CacheConfig::from(&settings.cache),
        Arc::clone(&repositories) as Arc<dyn DatabaseCacheRepository>,
        repositories as Arc<dyn NavigationRepo>,
    )
    .await
}

/// Assemble the cache over arbitrary repository adapters.
///
/// Runs the startup verification when enabled and spawns the periodic
/// consumer when an interval is configured. Must be called inside a tokio
/// runtime.
pub async fn start_with(
    config: CacheConfig,
    repository: Arc<dyn DatabaseCacheRepository>,
    navigation: Arc<dyn NavigationRepo>,
) -> Result<CacheRuntime, InfraError> {
    let cache = Arc::new(HybridCache::new(config.clone(), repository, navigation));
    let queue = Arc::new(EventQueue::new());
    let consumer = Arc::new(CacheConsumer::new(
        config.clone(),
        Arc::clone(&cache),
        Arc::clone(&queue),
    ));
    let trigger = Arc::new(CacheTrigger::new(
        config.clone(),
        queue,
        Arc::clone(&consumer),
    ));

    if config.verify_on_startup {
        let report = cache.verify_and_repair(&CancelToken::never()).await?;
        if !report.is_consistent() {
            warn!(?report, "Cache rows were inconsistent at startup");
        }
    }

    let auto_consume = config.auto_consume_interval().map(|interval| {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Auto-consume enabled"
        );
        consumer.spawn_auto_consume(interval)
    });

    Ok(CacheRuntime {
        cache,
        trigger,
        consumer,
        auto_consume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::NodeObjectType;
    use crate::infra::memory::InMemoryRepositories;
    use crate::infra::memory::fixtures::{item, node_for};

    fn adapters(
        repo: &Arc<InMemoryRepositories>,
    ) -> (Arc<dyn DatabaseCacheRepository>, Arc<dyn NavigationRepo>) {
        (
            Arc::clone(repo) as Arc<dyn DatabaseCacheRepository>,
            Arc::clone(repo) as Arc<dyn NavigationRepo>,
        )
    }

    #[tokio::test]
    async fn startup_repairs_missing_rows() {
        let repo = Arc::new(InMemoryRepositories::default());
        repo.upsert_item(item(7, NodeObjectType::Member, None, 0));
        assert_eq!(repo.row_count(), 0);

        let config = CacheConfig {
            auto_consume_interval_ms: 0,
            ..Default::default()
        };
        let (db, nav) = adapters(&repo);
        let runtime = start_with(config, db, nav).await.expect("runtime");

        assert!(!runtime.has_auto_consume());
        assert_eq!(repo.row_count(), 1);
        assert_eq!(runtime.cache.get_member(7).await.expect("member").id, 7);
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_events() {
        let repo = Arc::new(InMemoryRepositories::default());
        let config = CacheConfig {
            consume_on_write: false,
            verify_on_startup: false,
            ..Default::default()
        };
        let (db, nav) = adapters(&repo);
        let runtime = start_with(config, db, nav).await.expect("runtime");
        assert!(runtime.has_auto_consume());

        let member = item(8, NodeObjectType::Member, None, 0);
        repo.upsert_item(member.clone());
        runtime
            .trigger
            .member_refreshed(node_for(&member, None, false))
            .await
            .expect("queued");
        assert_eq!(repo.row_count(), 0);

        let flushed = runtime.shutdown().await.expect("shutdown");
        assert_eq!(flushed, 1);
        assert_eq!(repo.row_count(), 1);
    }
}
