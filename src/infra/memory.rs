//! In-process repository backed by ordered maps.
//!
//! Holds both the canonical items (what a content store would own) and the
//! serialized cache rows derived from them, so the full refresh, rebuild and
//! verify cycle can run without a database.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::cancel::CancelToken;
use crate::application::repos::{
    DatabaseCacheRepository, NavigationRepo, RebuildReport, RepoError, ensure_node_kind,
};
use crate::application::serialization::{ContentCacheDataSerializer, JsonCacheDataSerializer};
use crate::domain::content::{
    CacheRowKey, ContentCacheDataModel, ContentCacheNode, ContentData, NodeShape,
};
use crate::domain::navigation::NavigationModel;
use crate::domain::scope::{ContentTypeScope, RebuildScopes};
use crate::domain::types::{NodeObjectType, PublishedState};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "infra::memory";
const DEFAULT_PAGE_SIZE: usize = 500;

/// Canonical record of one item, independent of the cache rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalItem {
    pub id: i32,
    pub key: Uuid,
    pub object_type: NodeObjectType,
    pub content_type_id: i32,
    pub content_type_key: Uuid,
    pub parent_id: Option<i32>,
    pub sort_order: i32,
    pub trashed: bool,
    pub creator_id: i32,
    pub created_at: OffsetDateTime,
    /// Current (edited) version.
    pub edited: ContentData,
    /// Published version, if the item is published.
    pub published: Option<ContentData>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    data: Value,
    rv: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<i32, CanonicalItem>,
    rows: BTreeMap<CacheRowKey, StoredRow>,
}

impl MemoryState {
    fn shape(&self, item: &CanonicalItem) -> NodeShape {
        NodeShape {
            id: item.id,
            key: item.key,
            object_type: item.object_type,
            content_type_id: item.content_type_id,
            content_type_key: item.content_type_key,
            parent_key: item
                .parent_id
                .and_then(|parent_id| self.items.get(&parent_id))
                .map(|parent| parent.key),
            sort_order: item.sort_order,
            creator_id: item.creator_id,
            created_at: item.created_at,
        }
    }

    fn live_item(&self, id: i32, object_type: NodeObjectType) -> Option<&CanonicalItem> {
        self.items
            .get(&id)
            .filter(|item| item.object_type == object_type && !item.trashed)
    }

    fn live_id_by_key(&self, key: Uuid, object_type: NodeObjectType) -> Option<i32> {
        self.items
            .values()
            .find(|item| item.key == key && item.object_type == object_type && !item.trashed)
            .map(|item| item.id)
    }

    fn has_row(&self, id: i32, preview: bool) -> bool {
        self.rows.contains_key(&CacheRowKey::new(id, preview))
    }

    fn upsert_row(&mut self, key: CacheRowKey, data: Value) {
        self.rows
            .entry(key)
            .and_modify(|row| {
                row.data = data.clone();
                row.rv += 1;
            })
            .or_insert(StoredRow { data, rv: 0 });
    }
}

pub struct InMemoryRepositories {
    state: RwLock<MemoryState>,
    serializer: Box<dyn ContentCacheDataSerializer>,
    page_size: usize,
    offline: AtomicBool,
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            serializer: Box::new(JsonCacheDataSerializer),
            page_size: DEFAULT_PAGE_SIZE,
            offline: AtomicBool::new(false),
        }
    }

    /// Number of canonical items processed per rebuild batch.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make every repository call fail as if the connection were lost.
    pub fn simulate_outage(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn upsert_item(&self, item: CanonicalItem) {
        rw_write(&self.state, SOURCE, "upsert_item")
            .items
            .insert(item.id, item);
    }

    /// Remove a canonical item together with its cache rows.
    pub fn remove_item(&self, id: i32) -> Option<CanonicalItem> {
        let mut state = rw_write(&self.state, SOURCE, "remove_item");
        state.rows.remove(&CacheRowKey::new(id, true));
        state.rows.remove(&CacheRowKey::new(id, false));
        state.items.remove(&id)
    }

    pub fn set_trashed(&self, id: i32, trashed: bool) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "set_trashed");
        match state.items.get_mut(&id) {
            Some(item) => {
                item.trashed = trashed;
                true
            }
            None => false,
        }
    }

    pub fn item(&self, id: i32) -> Option<CanonicalItem> {
        rw_read(&self.state, SOURCE, "item").items.get(&id).cloned()
    }

    pub fn row_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "row_count").rows.len()
    }

    /// Row version counter, bumped on every overwrite.
    pub fn row_version(&self, id: i32, preview: bool) -> Option<i64> {
        rw_read(&self.state, SOURCE, "row_version")
            .rows
            .get(&CacheRowKey::new(id, preview))
            .map(|row| row.rv)
    }

    fn ensure_online(&self) -> Result<(), RepoError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence(
                "in-memory repository is offline",
            ));
        }
        Ok(())
    }

    fn read_source(
        &self,
        id: i32,
        object_type: NodeObjectType,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.ensure_online()?;
        let state = rw_read(&self.state, SOURCE, "read_source");

        let Some(item) = state.live_item(id, object_type) else {
            return Ok(None);
        };
        let Some(row) = state.rows.get(&CacheRowKey::new(id, preview)) else {
            if preview || object_type != NodeObjectType::Document {
                warn!(
                    node_id = id,
                    object_type = object_type.as_str(),
                    "Cache row missing for live item; a rebuild is advisable"
                );
            }
            return Ok(None);
        };

        let model = self.serializer.deserialize(id, &row.data)?;
        Ok(Some(state.shape(item).into_node(preview, model)))
    }

    fn read_by_content_type(
        &self,
        object_type: NodeObjectType,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError> {
        self.ensure_online()?;
        if scope.is_empty() {
            return Ok(Vec::new());
        }
        let state = rw_read(&self.state, SOURCE, "read_by_content_type");

        let mut nodes = Vec::new();
        for item in state.items.values().filter(|item| {
            item.object_type == object_type && !item.trashed && scope.matches(item.content_type_id)
        }) {
            let preview = object_type == NodeObjectType::Document && item.published.is_none();
            let Some(row) = state.rows.get(&CacheRowKey::new(item.id, preview)) else {
                continue;
            };
            let model = self.serializer.deserialize(item.id, &row.data)?;
            nodes.push(state.shape(item).into_node(preview, model));
        }
        Ok(nodes)
    }

    fn write_single_row(
        &self,
        node: &ContentCacheNode,
        object_type: NodeObjectType,
    ) -> Result<(), RepoError> {
        self.ensure_online()?;
        ensure_node_kind(node, object_type)?;
        let data = self.serializer.serialize(&node.to_data_model())?;

        let mut state = rw_write(&self.state, SOURCE, "write_single_row");
        ensure_canonical(&state, node)?;
        state.upsert_row(CacheRowKey::new(node.id, false), data);
        Ok(())
    }

    /// Rows a rebuild derives for one canonical item.
    fn rows_for(&self, item: &CanonicalItem) -> Result<Vec<(CacheRowKey, Value)>, RepoError> {
        ContentCacheDataModel::canonical_rows(
            item.object_type,
            item.edited.clone(),
            item.published.clone(),
        )
        .into_iter()
        .map(|(preview, model)| {
            Ok((
                CacheRowKey::new(item.id, preview),
                self.serializer.serialize(&model)?,
            ))
        })
        .collect()
    }

    fn verify_kind(&self, object_type: NodeObjectType) -> Result<bool, RepoError> {
        self.ensure_online()?;
        let state = rw_read(&self.state, SOURCE, "verify_kind");

        let items_consistent = state
            .items
            .values()
            .filter(|item| item.object_type == object_type)
            .all(|item| match object_type {
                NodeObjectType::Document => {
                    state.has_row(item.id, true)
                        && state.has_row(item.id, false) == item.published.is_some()
                }
                NodeObjectType::Media | NodeObjectType::Member => {
                    state.has_row(item.id, false) && !state.has_row(item.id, true)
                }
            });

        let no_orphans = state
            .rows
            .keys()
            .all(|row_key| state.items.contains_key(&row_key.node_id));

        Ok(items_consistent && no_orphans)
    }
}

impl Default for InMemoryRepositories {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_canonical(state: &MemoryState, node: &ContentCacheNode) -> Result<(), RepoError> {
    match state.items.get(&node.id) {
        Some(item) if item.object_type == node.object_type => Ok(()),
        _ => Err(RepoError::Integrity {
            message: format!("node {} has no canonical record", node.id),
        }),
    }
}

#[async_trait]
impl DatabaseCacheRepository for InMemoryRepositories {
    async fn get_content_source(
        &self,
        id: i32,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.read_source(id, NodeObjectType::Document, preview)
    }

    async fn get_content_source_by_key(
        &self,
        key: Uuid,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.ensure_online()?;
        let id = rw_read(&self.state, SOURCE, "get_content_source_by_key")
            .live_id_by_key(key, NodeObjectType::Document);
        match id {
            Some(id) => self.read_source(id, NodeObjectType::Document, preview),
            None => Ok(None),
        }
    }

    async fn get_media_source(&self, id: i32) -> Result<Option<ContentCacheNode>, RepoError> {
        self.read_source(id, NodeObjectType::Media, false)
    }

    async fn get_media_source_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.ensure_online()?;
        let id = rw_read(&self.state, SOURCE, "get_media_source_by_key")
            .live_id_by_key(key, NodeObjectType::Media);
        match id {
            Some(id) => self.read_source(id, NodeObjectType::Media, false),
            None => Ok(None),
        }
    }

    async fn get_member_source(&self, id: i32) -> Result<Option<ContentCacheNode>, RepoError> {
        self.read_source(id, NodeObjectType::Member, false)
    }

    async fn get_member_source_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.ensure_online()?;
        let id = rw_read(&self.state, SOURCE, "get_member_source_by_key")
            .live_id_by_key(key, NodeObjectType::Member);
        match id {
            Some(id) => self.read_source(id, NodeObjectType::Member, false),
            None => Ok(None),
        }
    }

    async fn get_content_by_content_type_id(
        &self,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError> {
        self.read_by_content_type(NodeObjectType::Document, scope)
    }

    async fn get_media_by_content_type_id(
        &self,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError> {
        self.read_by_content_type(NodeObjectType::Media, scope)
    }

    async fn refresh_content(
        &self,
        node: &ContentCacheNode,
        state: PublishedState,
    ) -> Result<(), RepoError> {
        self.ensure_online()?;
        ensure_node_kind(node, NodeObjectType::Document)?;
        let data = self.serializer.serialize(&node.to_data_model())?;

        let mut guard = rw_write(&self.state, SOURCE, "refresh_content");
        ensure_canonical(&guard, node)?;
        if node.is_draft {
            guard.upsert_row(CacheRowKey::new(node.id, true), data);
        } else if state.keeps_published_row() {
            guard.upsert_row(CacheRowKey::new(node.id, false), data);
        } else {
            guard.rows.remove(&CacheRowKey::new(node.id, false));
        }
        Ok(())
    }

    async fn refresh_media(&self, node: &ContentCacheNode) -> Result<(), RepoError> {
        self.write_single_row(node, NodeObjectType::Media)
    }

    async fn refresh_member(&self, node: &ContentCacheNode) -> Result<(), RepoError> {
        self.write_single_row(node, NodeObjectType::Member)
    }

    async fn delete_content_item(&self, id: i32) -> Result<(), RepoError> {
        self.ensure_online()?;
        let mut state = rw_write(&self.state, SOURCE, "delete_content_item");
        state.rows.remove(&CacheRowKey::new(id, true));
        state.rows.remove(&CacheRowKey::new(id, false));
        Ok(())
    }

    async fn rebuild(
        &self,
        scopes: &RebuildScopes,
        cancel: &CancelToken,
    ) -> Result<RebuildReport, RepoError> {
        self.ensure_online()?;

        let selected: Vec<CanonicalItem> = {
            let state = rw_read(&self.state, SOURCE, "rebuild.select");
            state
                .items
                .values()
                .filter(|item| scopes.for_kind(item.object_type).matches(item.content_type_id))
                .cloned()
                .collect()
        };

        let mut report = RebuildReport::default();
        let mut staged = Vec::with_capacity(selected.len() * 2);
        for page in selected.chunks(self.page_size) {
            if cancel.is_cancelled() {
                debug!(staged = staged.len(), "Rebuild cancelled before commit");
                return Err(RepoError::Cancelled);
            }
            for item in page {
                let rows = self.rows_for(item)?;
                report.add(item.object_type, rows.len() as u64);
                staged.extend(rows);
            }
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        self.ensure_online()?;

        let mut state = rw_write(&self.state, SOURCE, "rebuild.commit");
        for item in &selected {
            state.rows.remove(&CacheRowKey::new(item.id, true));
            state.rows.remove(&CacheRowKey::new(item.id, false));
        }
        for (key, data) in staged {
            state.rows.insert(key, StoredRow { data, rv: 0 });
        }

        Ok(report)
    }

    async fn verify_content_db_cache(&self) -> Result<bool, RepoError> {
        self.verify_kind(NodeObjectType::Document)
    }

    async fn verify_media_db_cache(&self) -> Result<bool, RepoError> {
        self.verify_kind(NodeObjectType::Media)
    }

    async fn verify_member_db_cache(&self) -> Result<bool, RepoError> {
        self.verify_kind(NodeObjectType::Member)
    }
}

#[async_trait]
impl NavigationRepo for InMemoryRepositories {
    async fn navigation_models(
        &self,
        object_type: NodeObjectType,
        trashed: bool,
    ) -> Result<Vec<NavigationModel>, RepoError> {
        self.ensure_online()?;
        let state = rw_read(&self.state, SOURCE, "navigation_models");
        Ok(state
            .items
            .values()
            .filter(|item| item.object_type == object_type && item.trashed == trashed)
            .map(|item| NavigationModel {
                id: item.id,
                key: item.key,
                parent_id: item.parent_id,
                sort_order: item.sort_order,
                content_type_key: item.content_type_key,
            })
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::application::cancel::CancelSource;

    fn repo_with_tree() -> InMemoryRepositories {
        let repo = InMemoryRepositories::new().with_page_size(2);
        repo.upsert_item(published_document(1, None, 0));
        repo.upsert_item(item(2, NodeObjectType::Document, Some(1), 0));
        let mut article = published_document(3, Some(1), 1);
        article.content_type_id = ARTICLE_TYPE_ID;
        article.content_type_key = type_key(ARTICLE_TYPE_ID);
        repo.upsert_item(article);
        repo.upsert_item(item(20, NodeObjectType::Media, None, 0));
        repo.upsert_item(item(30, NodeObjectType::Member, None, 0));
        repo
    }

    #[tokio::test]
    async fn refresh_is_idempotent_per_variant() {
        let repo = repo_with_tree();
        let node = node_for(&repo.item(2).unwrap(), Some(node_key(1)), true);

        repo.refresh_content(&node, PublishedState::Unpublished)
            .await
            .unwrap();
        repo.refresh_content(&node, PublishedState::Unpublished)
            .await
            .unwrap();

        assert_eq!(repo.row_count(), 1);
        assert_eq!(repo.row_version(2, true), Some(1));
        assert_eq!(repo.row_version(2, false), None);
    }

    #[tokio::test]
    async fn refreshed_node_reads_back_equal() {
        let repo = repo_with_tree();
        let draft = node_for(&repo.item(2).unwrap(), Some(node_key(1)), true);
        let published = node_for(&repo.item(1).unwrap(), None, false);

        repo.refresh_content(&draft, PublishedState::Unpublished)
            .await
            .unwrap();
        repo.refresh_content(&published, PublishedState::Publishing)
            .await
            .unwrap();

        assert_eq!(repo.get_content_source(2, true).await.unwrap(), Some(draft));
        let read = repo.get_content_source(1, false).await.unwrap().unwrap();
        assert_eq!(read.data, published.data);
        assert!(!read.is_draft);
        assert_eq!(
            repo.get_content_source_by_key(node_key(1), false)
                .await
                .unwrap()
                .map(|node| node.id),
            Some(1)
        );
    }

    #[tokio::test]
    async fn unpublishing_removes_the_published_row() {
        let repo = repo_with_tree();
        let published = node_for(&repo.item(1).unwrap(), None, false);
        repo.refresh_content(&published, PublishedState::Publishing)
            .await
            .unwrap();
        assert!(repo.get_content_source(1, false).await.unwrap().is_some());

        repo.refresh_content(&published, PublishedState::Unpublishing)
            .await
            .unwrap();

        assert_eq!(repo.get_content_source(1, false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refresh_rejects_unknown_or_mistyped_nodes() {
        let repo = repo_with_tree();
        let mut stranger = node_for(&repo.item(2).unwrap(), None, true);
        stranger.id = 999;
        assert!(matches!(
            repo.refresh_content(&stranger, PublishedState::Unpublished)
                .await,
            Err(RepoError::Integrity { .. })
        ));

        let media = node_for(&repo.item(20).unwrap(), None, false);
        assert!(matches!(
            repo.refresh_content(&media, PublishedState::Published).await,
            Err(RepoError::InvalidInput { .. })
        ));
        repo.refresh_media(&media).await.unwrap();
        assert_eq!(repo.get_media_source(20).await.unwrap(), Some(media));
    }

    #[tokio::test]
    async fn delete_of_absent_item_is_not_an_error() {
        let repo = repo_with_tree();
        repo.delete_content_item(4242).await.unwrap();
        assert_eq!(repo.row_count(), 0);
    }

    #[tokio::test]
    async fn rebuild_then_verify_reports_consistent() {
        let repo = repo_with_tree();
        assert!(!repo.verify_content_db_cache().await.unwrap());

        let report = repo
            .rebuild(&RebuildScopes::all(), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(report.documents, 5);
        assert_eq!(report.media, 1);
        assert_eq!(report.members, 1);
        assert!(repo.verify_content_db_cache().await.unwrap());
        assert!(repo.verify_media_db_cache().await.unwrap());
        assert!(repo.verify_member_db_cache().await.unwrap());
        assert!(repo.get_member_source(30).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn verify_flags_missing_and_stale_published_rows() {
        let repo = repo_with_tree();
        repo.rebuild(&RebuildScopes::all(), &CancelToken::never())
            .await
            .unwrap();

        let published = node_for(&repo.item(3).unwrap(), Some(node_key(1)), false);
        repo.refresh_content(&published, PublishedState::Unpublishing)
            .await
            .unwrap();
        assert!(!repo.verify_content_db_cache().await.unwrap());

        repo.refresh_content(&published, PublishedState::Publishing)
            .await
            .unwrap();
        assert!(repo.verify_content_db_cache().await.unwrap());

        let draft = node_for(&repo.item(2).unwrap(), Some(node_key(1)), false);
        repo.refresh_content(&draft, PublishedState::Published)
            .await
            .unwrap();
        assert!(!repo.verify_content_db_cache().await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_rebuild_leaves_rows_untouched() {
        let repo = repo_with_tree();
        let node = node_for(&repo.item(2).unwrap(), Some(node_key(1)), true);
        repo.refresh_content(&node, PublishedState::Unpublished)
            .await
            .unwrap();

        let source = CancelSource::new();
        source.cancel();
        let result = repo.rebuild(&RebuildScopes::all(), &source.token()).await;

        assert!(matches!(result, Err(RepoError::Cancelled)));
        assert_eq!(repo.row_count(), 1);
        assert_eq!(repo.row_version(2, true), Some(0));
    }

    #[tokio::test]
    async fn scoped_rebuild_only_touches_selected_content_types() {
        let repo = repo_with_tree();
        let scopes = RebuildScopes {
            content: ContentTypeScope::only([ARTICLE_TYPE_ID]),
            media: ContentTypeScope::none(),
            member: ContentTypeScope::none(),
        };

        let report = repo.rebuild(&scopes, &CancelToken::never()).await.unwrap();

        assert_eq!(report.total(), 2);
        assert!(repo.get_content_source(3, false).await.unwrap().is_some());
        assert!(repo.get_content_source(1, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_type_scope_all_differs_from_empty_only() {
        let repo = repo_with_tree();
        repo.rebuild(&RebuildScopes::all(), &CancelToken::never())
            .await
            .unwrap();

        let all = repo
            .get_content_by_content_type_id(&ContentTypeScope::All)
            .await
            .unwrap();
        let none = repo
            .get_content_by_content_type_id(&ContentTypeScope::none())
            .await
            .unwrap();
        let articles = repo
            .get_content_by_content_type_id(&ContentTypeScope::only([ARTICLE_TYPE_ID]))
            .await
            .unwrap();

        assert_eq!(all.len(), 3);
        assert!(none.is_empty());
        assert_eq!(articles.len(), 1);
        assert!(!articles[0].is_draft);
        let unpublished = all.iter().find(|node| node.id == 2).unwrap();
        assert!(unpublished.is_draft);
    }

    #[tokio::test]
    async fn trashed_items_are_hidden_from_reads_and_move_to_bin_models() {
        let repo = repo_with_tree();
        repo.rebuild(&RebuildScopes::all(), &CancelToken::never())
            .await
            .unwrap();
        repo.set_trashed(3, true);

        assert_eq!(repo.get_content_source(3, false).await.unwrap(), None);
        let bin = repo
            .navigation_models(NodeObjectType::Document, true)
            .await
            .unwrap();
        assert_eq!(bin.len(), 1);
        assert_eq!(bin[0].key, node_key(3));
        let main = repo
            .navigation_models(NodeObjectType::Document, false)
            .await
            .unwrap();
        assert_eq!(main.len(), 2);
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let repo = repo_with_tree();
        repo.simulate_outage(true);

        let err = repo.get_content_source(1, true).await.unwrap_err();
        assert!(err.is_transient());
        assert!(repo.verify_media_db_cache().await.is_err());

        repo.simulate_outage(false);
        assert!(repo.get_content_source(1, true).await.is_ok());
    }
}
