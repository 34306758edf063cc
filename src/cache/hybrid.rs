//! Read-through cache over the database cache repository.
//!
//! Reads are served from the node table and fall back to the repository;
//! change notifications write the repository first and then patch memory.
//! Rebuild and verify are serialized against each other.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::application::cancel::CancelToken;
use crate::application::error::{CacheError, NodeRef};
use crate::application::repos::{DatabaseCacheRepository, NavigationRepo, RebuildReport, RepoError};
use crate::domain::content::{CacheRowKey, ContentCacheNode};
use crate::domain::scope::{ContentTypeScope, RebuildScopes};
use crate::domain::types::{NodeObjectType, PublishedState};

use super::config::CacheConfig;
use super::events::EventKind;
use super::navigation::ContentNavigation;
use super::store::{Lookup, NodeStore};

pub const METRIC_NODE_HIT: &str = "nucache_node_hit_total";
pub const METRIC_NODE_MISS: &str = "nucache_node_miss_total";
pub const METRIC_NODE_STALE: &str = "nucache_node_stale_total";
pub const METRIC_STALE_SERVED: &str = "nucache_stale_served_total";
pub const METRIC_REPOSITORY_LOAD_MS: &str = "nucache_repository_load_ms";
pub const METRIC_REBUILD_MS: &str = "nucache_rebuild_ms";
pub const METRIC_VERIFY_INCONSISTENT: &str = "nucache_verify_inconsistent_total";

/// Per-kind outcome of a verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub content: bool,
    pub media: bool,
    pub member: bool,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.content && self.media && self.member
    }

    pub fn for_kind(&self, kind: NodeObjectType) -> bool {
        match kind {
            NodeObjectType::Document => self.content,
            NodeObjectType::Media => self.media,
            NodeObjectType::Member => self.member,
        }
    }

    /// Full rebuild of every inconsistent kind, nothing for the others.
    pub fn repair_scopes(&self) -> RebuildScopes {
        let mut scopes = RebuildScopes::none();
        for kind in NodeObjectType::ALL {
            if !self.for_kind(kind) {
                scopes.set_kind(kind, ContentTypeScope::All);
            }
        }
        scopes
    }
}

pub struct HybridCache {
    config: CacheConfig,
    repository: Arc<dyn DatabaseCacheRepository>,
    store: NodeStore,
    documents: ContentNavigation,
    media: ContentNavigation,
    maintenance: Mutex<()>,
}

impl HybridCache {
    pub fn new(
        config: CacheConfig,
        repository: Arc<dyn DatabaseCacheRepository>,
        navigation: Arc<dyn NavigationRepo>,
    ) -> Self {
        Self {
            config,
            repository,
            store: NodeStore::new(),
            documents: ContentNavigation::new(NodeObjectType::Document, Arc::clone(&navigation)),
            media: ContentNavigation::new(NodeObjectType::Media, navigation),
            maintenance: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Navigation of documents or media; members have no tree.
    pub fn navigation(&self, kind: NodeObjectType) -> Option<&ContentNavigation> {
        match kind {
            NodeObjectType::Document => Some(&self.documents),
            NodeObjectType::Media => Some(&self.media),
            NodeObjectType::Member => None,
        }
    }

    pub fn documents(&self) -> &ContentNavigation {
        &self.documents
    }

    pub fn media(&self) -> &ContentNavigation {
        &self.media
    }

    /// Number of node snapshots held in memory.
    pub fn cached_nodes(&self) -> usize {
        self.store.len()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_content(
        &self,
        id: i32,
        preview: bool,
    ) -> Result<Arc<ContentCacheNode>, CacheError> {
        self.read_through(NodeObjectType::Document, NodeRef::Id(id), preview)
            .await
    }

    pub async fn get_content_by_key(
        &self,
        key: Uuid,
        preview: bool,
    ) -> Result<Arc<ContentCacheNode>, CacheError> {
        self.read_through(NodeObjectType::Document, NodeRef::Key(key), preview)
            .await
    }

    pub async fn get_media(&self, id: i32) -> Result<Arc<ContentCacheNode>, CacheError> {
        self.read_through(NodeObjectType::Media, NodeRef::Id(id), false)
            .await
    }

    pub async fn get_media_by_key(&self, key: Uuid) -> Result<Arc<ContentCacheNode>, CacheError> {
        self.read_through(NodeObjectType::Media, NodeRef::Key(key), false)
            .await
    }

    pub async fn get_member(&self, id: i32) -> Result<Arc<ContentCacheNode>, CacheError> {
        self.read_through(NodeObjectType::Member, NodeRef::Id(id), false)
            .await
    }

    pub async fn get_member_by_key(&self, key: Uuid) -> Result<Arc<ContentCacheNode>, CacheError> {
        self.read_through(NodeObjectType::Member, NodeRef::Key(key), false)
            .await
    }

    async fn read_through(
        &self,
        kind: NodeObjectType,
        node: NodeRef,
        preview: bool,
    ) -> Result<Arc<ContentCacheNode>, CacheError> {
        // Only documents have a draft variant.
        let preview = preview && kind == NodeObjectType::Document;
        let id = match node {
            NodeRef::Id(id) => Some(id),
            NodeRef::Key(key) => self.store.id_for_key(key),
        };

        let mut stale = None;
        if let Some(id) = id {
            match self.store.lookup(CacheRowKey::new(id, preview)) {
                Lookup::Fresh(found) => {
                    if found.object_type != kind {
                        return Err(CacheError::not_found(kind, node));
                    }
                    counter!(METRIC_NODE_HIT, "kind" => kind.as_str()).increment(1);
                    return Ok(found);
                }
                Lookup::Stale(found) => {
                    counter!(METRIC_NODE_STALE, "kind" => kind.as_str()).increment(1);
                    stale = Some(found).filter(|found| found.object_type == kind);
                }
                Lookup::Missing => {
                    counter!(METRIC_NODE_MISS, "kind" => kind.as_str()).increment(1);
                }
            }
        }

        let ticket = self.store.begin_load();
        let started_at = Instant::now();
        let loaded = self.load_source(kind, node, preview).await;
        histogram!(METRIC_REPOSITORY_LOAD_MS, "kind" => kind.as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                if self.config.serve_stale_on_unavailable
                    && err.is_transient()
                    && let Some(found) = stale
                {
                    warn!(
                        kind = kind.as_str(),
                        node_id = found.id,
                        error = %err,
                        "Repository unavailable; serving stale node"
                    );
                    counter!(METRIC_STALE_SERVED, "kind" => kind.as_str()).increment(1);
                    return Ok(found);
                }
                return Err(CacheError::repository(err));
            }
        };

        let Some(found) = loaded else {
            return Err(CacheError::not_found(kind, node));
        };
        let found = Arc::new(found);
        if !self.store.insert_loaded(ticket, Arc::clone(&found)) {
            debug!(
                kind = kind.as_str(),
                node_id = found.id,
                "Loaded node not cached; a newer write won"
            );
        }
        if let Some(navigation) = self.navigation(kind) {
            navigation.ensure_attached(&found);
        }
        Ok(found)
    }

    async fn load_source(
        &self,
        kind: NodeObjectType,
        node: NodeRef,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        let repo = self.repository.as_ref();
        match (kind, node) {
            (NodeObjectType::Document, NodeRef::Id(id)) => repo.get_content_source(id, preview).await,
            (NodeObjectType::Document, NodeRef::Key(key)) => {
                repo.get_content_source_by_key(key, preview).await
            }
            (NodeObjectType::Media, NodeRef::Id(id)) => repo.get_media_source(id).await,
            (NodeObjectType::Media, NodeRef::Key(key)) => repo.get_media_source_by_key(key).await,
            (NodeObjectType::Member, NodeRef::Id(id)) => repo.get_member_source(id).await,
            (NodeObjectType::Member, NodeRef::Key(key)) => repo.get_member_source_by_key(key).await,
        }
    }

    // ========================================================================
    // Change notifications
    // ========================================================================

    /// Apply one change: repository first, then memory.
    #[instrument(skip(self, event), fields(event_kind = event.name(), node_id = ?event.node_id()))]
    pub async fn apply(&self, event: &EventKind) -> Result<(), CacheError> {
        match event {
            EventKind::ContentRefreshed { node, state } => self.refresh_content(node, *state).await,
            EventKind::MediaRefreshed { node } => {
                self.repository
                    .refresh_media(node)
                    .await
                    .map_err(CacheError::repository)?;
                self.install(node);
                self.media.apply_placement(node)
            }
            EventKind::MemberRefreshed { node } => {
                self.repository
                    .refresh_member(node)
                    .await
                    .map_err(CacheError::repository)?;
                self.install(node);
                Ok(())
            }
            EventKind::ContentTrashed { id, key } => {
                self.evict_subtree(&self.documents, *id, *key);
                self.documents.move_to_bin(*key)
            }
            EventKind::MediaTrashed { id, key } => {
                self.evict_subtree(&self.media, *id, *key);
                self.media.move_to_bin(*key)
            }
            EventKind::ContentDeleted { id, key } => {
                self.delete_subtree(&self.documents, *id, *key).await?;
                self.documents.remove(*key)
            }
            EventKind::MediaDeleted { id, key } => {
                self.delete_subtree(&self.media, *id, *key).await?;
                self.media.remove(*key)
            }
            EventKind::MemberDeleted { id } => self.delete_item(*id).await,
            EventKind::ContentTypesChanged {
                object_type,
                content_type_ids,
            } => {
                self.reload_content_types(*object_type, content_type_ids)
                    .await
            }
        }
    }

    async fn refresh_content(
        &self,
        node: &Arc<ContentCacheNode>,
        state: PublishedState,
    ) -> Result<(), CacheError> {
        self.repository
            .refresh_content(node, state)
            .await
            .map_err(CacheError::repository)?;

        if node.is_draft || state.keeps_published_row() {
            self.install(node);
        } else {
            self.store.remove_variant(node.row_key());
        }
        self.documents.apply_placement(node)
    }

    /// Install a refreshed snapshot and drop the sibling variant when its
    /// position in the tree no longer matches.
    fn install(&self, node: &Arc<ContentCacheNode>) {
        let sibling = CacheRowKey::new(node.id, !node.is_draft);
        if let Lookup::Fresh(other) | Lookup::Stale(other) = self.store.lookup(sibling)
            && (other.parent_key != node.parent_key || other.sort_order != node.sort_order)
        {
            self.store.remove_variant(sibling);
        }
        self.store.replace(Arc::clone(node));
    }

    async fn delete_item(&self, id: i32) -> Result<(), CacheError> {
        self.repository
            .delete_content_item(id)
            .await
            .map_err(CacheError::repository)?;
        self.store.remove_node(id);
        Ok(())
    }

    /// Cached ids of the subtree under `key`, the root id excluded.
    fn cached_descendants(
        &self,
        navigation: &ContentNavigation,
        id: i32,
        key: Uuid,
    ) -> Vec<i32> {
        let keys = navigation.subtree_keys(key);
        self.store
            .subtree_ids(navigation.object_type(), key, &keys)
            .into_iter()
            .filter(|descendant| *descendant != id)
            .collect()
    }

    /// Drop a trashed node and every cached descendant from the node table.
    fn evict_subtree(&self, navigation: &ContentNavigation, id: i32, key: Uuid) {
        let descendants = self.cached_descendants(navigation, id, key);
        self.store.remove_node(id);
        for descendant in &descendants {
            self.store.remove_node(*descendant);
        }
        if !descendants.is_empty() {
            debug!(node_id = id, descendants = descendants.len(), "Evicted trashed subtree");
        }
    }

    /// Delete the rows of a node and its cached descendants, then forget them.
    ///
    /// Rows go first so a retry after a failed delete still sees the subtree.
    async fn delete_subtree(
        &self,
        navigation: &ContentNavigation,
        id: i32,
        key: Uuid,
    ) -> Result<(), CacheError> {
        let descendants = self.cached_descendants(navigation, id, key);
        for descendant in &descendants {
            self.repository
                .delete_content_item(*descendant)
                .await
                .map_err(CacheError::repository)?;
        }
        self.delete_item(id).await?;
        for descendant in descendants {
            self.store.remove_node(descendant);
        }
        Ok(())
    }

    async fn reload_content_types(
        &self,
        kind: NodeObjectType,
        content_type_ids: &[i32],
    ) -> Result<(), CacheError> {
        let scope = ContentTypeScope::only(content_type_ids.iter().copied());
        self.store.invalidate_scope(kind, &scope);

        let nodes = match kind {
            NodeObjectType::Document => self.repository.get_content_by_content_type_id(&scope).await,
            NodeObjectType::Media => self.repository.get_media_by_content_type_id(&scope).await,
            NodeObjectType::Member => return Ok(()),
        }
        .map_err(CacheError::repository)?;

        let reloaded = nodes.len();
        for node in nodes {
            self.store.replace(Arc::new(node));
        }
        info!(
            kind = kind.as_str(),
            content_types = ?content_type_ids,
            reloaded,
            "Content types reloaded"
        );
        Ok(())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Wait for running maintenance to finish, giving up on cancellation.
    async fn lock_maintenance(
        &self,
        cancel: &CancelToken,
    ) -> Result<MutexGuard<'_, ()>, CacheError> {
        let mut waiter = cancel.clone();
        tokio::select! {
            guard = self.maintenance.lock() => Ok(guard),
            () = waiter.cancelled() => {
                debug!("Maintenance cancelled while waiting for the lock");
                Err(CacheError::Cancelled)
            }
        }
    }

    /// Regenerate repository rows for `scopes`, then discard the matching
    /// part of memory. A failed or cancelled rebuild leaves memory as is.
    pub async fn rebuild(
        &self,
        scopes: &RebuildScopes,
        cancel: &CancelToken,
    ) -> Result<RebuildReport, CacheError> {
        let _maintenance = self.lock_maintenance(cancel).await?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let started_at = Instant::now();
        let report = self
            .repository
            .rebuild(scopes, cancel)
            .await
            .map_err(CacheError::rebuild)?;

        for kind in NodeObjectType::ALL {
            let scope = scopes.for_kind(kind);
            if scope.is_empty() {
                continue;
            }
            self.store.invalidate_scope(kind, scope);
            if let Some(navigation) = self.navigation(kind) {
                navigation.discard();
            }
        }

        histogram!(METRIC_REBUILD_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            documents = report.documents,
            media = report.media,
            members = report.members,
            "Cache rebuild complete"
        );
        Ok(report)
    }

    pub async fn verify(&self, cancel: &CancelToken) -> Result<VerifyReport, CacheError> {
        let _maintenance = self.lock_maintenance(cancel).await?;
        self.verify_locked(cancel).await
    }

    async fn verify_locked(&self, cancel: &CancelToken) -> Result<VerifyReport, CacheError> {
        let mut outcome = [true; 3];
        for (slot, kind) in outcome.iter_mut().zip(NodeObjectType::ALL) {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            let consistent = match kind {
                NodeObjectType::Document => self.repository.verify_content_db_cache().await,
                NodeObjectType::Media => self.repository.verify_media_db_cache().await,
                NodeObjectType::Member => self.repository.verify_member_db_cache().await,
            }
            .map_err(CacheError::verify)?;

            if !consistent {
                counter!(METRIC_VERIFY_INCONSISTENT, "kind" => kind.as_str()).increment(1);
                warn!(kind = kind.as_str(), "Cache rows inconsistent with canonical store");
            }
            *slot = consistent;
        }

        let [content, media, member] = outcome;
        Ok(VerifyReport {
            content,
            media,
            member,
        })
    }

    /// Verify, then rebuild every inconsistent kind when repair is enabled.
    pub async fn verify_and_repair(&self, cancel: &CancelToken) -> Result<VerifyReport, CacheError> {
        let report = self.verify(cancel).await?;
        if report.is_consistent() {
            return Ok(report);
        }
        if !self.config.rebuild_on_inconsistency {
            warn!(?report, "Cache inconsistent; repair disabled");
            return Ok(report);
        }

        let report_scopes = report.repair_scopes();
        self.rebuild(&report_scopes, cancel).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::cancel::CancelSource;
    use crate::infra::memory::InMemoryRepositories;

    #[test]
    fn repair_scopes_cover_only_inconsistent_kinds() {
        let report = VerifyReport {
            content: true,
            media: false,
            member: true,
        };
        let scopes = report.repair_scopes();

        assert!(!report.is_consistent());
        assert!(scopes.for_kind(NodeObjectType::Document).is_empty());
        assert_eq!(scopes.for_kind(NodeObjectType::Media), &ContentTypeScope::All);
        assert!(scopes.for_kind(NodeObjectType::Member).is_empty());
    }

    #[tokio::test]
    async fn maintenance_waiting_behind_another_run_stops_on_cancel() {
        let repo = Arc::new(InMemoryRepositories::default());
        let cache = HybridCache::new(
            CacheConfig::default(),
            Arc::clone(&repo) as Arc<dyn DatabaseCacheRepository>,
            repo as Arc<dyn NavigationRepo>,
        );
        let _running = cache.maintenance.lock().await;
        let source = CancelSource::new();
        let token = source.token();

        let scopes = RebuildScopes::all();
        let rebuild = cache.rebuild(&scopes, &token);
        let verify = cache.verify(&token);
        source.cancel();

        let (rebuilt, verified) = tokio::time::timeout(
            Duration::from_secs(1),
            async { tokio::join!(rebuild, verify) },
        )
        .await
        .expect("cancellation should release waiting maintenance");
        assert!(matches!(rebuilt, Err(CacheError::Cancelled)));
        assert!(matches!(verified, Err(CacheError::Cancelled)));
    }
}
