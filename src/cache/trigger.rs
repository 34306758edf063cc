//! Cache trigger service.
//!
//! Provides a high-level API for publishing change notifications and
//! optionally consuming them immediately.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::application::error::CacheError;
use crate::domain::content::ContentCacheNode;
use crate::domain::types::{NodeObjectType, PublishedState};

use super::config::CacheConfig;
use super::consumer::CacheConsumer;
use super::events::{EventKind, EventQueue};

/// Entry point for the canonical store to report changes.
///
/// # Usage
///
/// ```ignore
/// // After a document is saved and published:
/// trigger.content_refreshed(node, PublishedState::Publishing).await?;
/// ```
pub struct CacheTrigger {
    config: CacheConfig,
    queue: Arc<EventQueue>,
    consumer: Arc<CacheConsumer>,
}

impl CacheTrigger {
    pub fn new(config: CacheConfig, queue: Arc<EventQueue>, consumer: Arc<CacheConsumer>) -> Self {
        Self {
            config,
            queue,
            consumer,
        }
    }

    /// Publish an event and optionally consume immediately.
    ///
    /// Without `consume_now` the event waits for the background consumer or
    /// the next explicit consumption. An error from immediate consumption
    /// leaves the queue as the consumer's failure policy dictates.
    pub async fn trigger(&self, kind: EventKind, consume_now: bool) -> Result<Uuid, CacheError> {
        let event_id = self.queue.publish(kind);

        if consume_now {
            self.consumer.consume_all().await?;
        } else {
            debug!(%event_id, "Cache event deferred to background consumer");
        }
        Ok(event_id)
    }

    async fn notify(&self, kind: EventKind) -> Result<Uuid, CacheError> {
        self.trigger(kind, self.config.consume_on_write).await
    }

    pub async fn content_refreshed(
        &self,
        node: ContentCacheNode,
        state: PublishedState,
    ) -> Result<Uuid, CacheError> {
        self.notify(EventKind::ContentRefreshed {
            node: Arc::new(node),
            state,
        })
        .await
    }

    pub async fn content_trashed(&self, id: i32, key: Uuid) -> Result<Uuid, CacheError> {
        self.notify(EventKind::ContentTrashed { id, key }).await
    }

    pub async fn content_deleted(&self, id: i32, key: Uuid) -> Result<Uuid, CacheError> {
        self.notify(EventKind::ContentDeleted { id, key }).await
    }

    pub async fn media_refreshed(&self, node: ContentCacheNode) -> Result<Uuid, CacheError> {
        self.notify(EventKind::MediaRefreshed {
            node: Arc::new(node),
        })
        .await
    }

    pub async fn media_trashed(&self, id: i32, key: Uuid) -> Result<Uuid, CacheError> {
        self.notify(EventKind::MediaTrashed { id, key }).await
    }

    pub async fn media_deleted(&self, id: i32, key: Uuid) -> Result<Uuid, CacheError> {
        self.notify(EventKind::MediaDeleted { id, key }).await
    }

    pub async fn member_refreshed(&self, node: ContentCacheNode) -> Result<Uuid, CacheError> {
        self.notify(EventKind::MemberRefreshed {
            node: Arc::new(node),
        })
        .await
    }

    pub async fn member_deleted(&self, id: i32) -> Result<Uuid, CacheError> {
        self.notify(EventKind::MemberDeleted { id }).await
    }

    pub async fn content_types_changed(
        &self,
        object_type: NodeObjectType,
        content_type_ids: Vec<i32>,
    ) -> Result<Uuid, CacheError> {
        self.notify(EventKind::ContentTypesChanged {
            object_type,
            content_type_ids,
        })
        .await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn consumer(&self) -> &Arc<CacheConsumer> {
        &self.consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::repos::{DatabaseCacheRepository, NavigationRepo};
    use crate::cache::hybrid::HybridCache;
    use crate::infra::memory::InMemoryRepositories;
    use crate::infra::memory::fixtures::{item, node_for};

    fn create_trigger(config: CacheConfig) -> (CacheTrigger, Arc<InMemoryRepositories>) {
        let repo = Arc::new(InMemoryRepositories::default());
        let cache = Arc::new(HybridCache::new(
            config.clone(),
            Arc::clone(&repo) as Arc<dyn DatabaseCacheRepository>,
            Arc::clone(&repo) as Arc<dyn NavigationRepo>,
        ));
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(CacheConsumer::new(config.clone(), cache, queue.clone()));

        (CacheTrigger::new(config, queue, consumer), repo)
    }

    fn member(repo: &InMemoryRepositories, id: i32) -> ContentCacheNode {
        let member = item(id, NodeObjectType::Member, None, 0);
        repo.upsert_item(member.clone());
        node_for(&member, None, false)
    }

    #[tokio::test]
    async fn trigger_publishes_event() {
        let (trigger, repo) = create_trigger(CacheConfig::default());
        assert!(trigger.queue.is_empty());

        let node = member(&repo, 30);
        trigger
            .trigger(
                EventKind::MemberRefreshed {
                    node: Arc::new(node),
                },
                false,
            )
            .await
            .unwrap();

        assert_eq!(trigger.queue.len(), 1);
        assert_eq!(repo.row_count(), 0);
    }

    #[tokio::test]
    async fn deferred_writes_wait_for_consumer() {
        let config = CacheConfig {
            consume_on_write: false,
            ..Default::default()
        };
        let (trigger, repo) = create_trigger(config);

        trigger.member_refreshed(member(&repo, 30)).await.unwrap();
        assert_eq!(trigger.queue.len(), 1);

        trigger.consumer().consume().await.unwrap();
        assert_eq!(repo.row_count(), 1);
    }

    #[tokio::test]
    async fn convenience_methods_consume_immediately() {
        let (trigger, repo) = create_trigger(CacheConfig::default());

        trigger.member_refreshed(member(&repo, 30)).await.unwrap();
        assert_eq!(repo.row_count(), 1);

        trigger.member_deleted(30).await.unwrap();
        trigger
            .content_types_changed(NodeObjectType::Document, vec![10])
            .await
            .unwrap();

        assert!(trigger.queue.is_empty());
        assert_eq!(repo.row_count(), 0);
    }
}
