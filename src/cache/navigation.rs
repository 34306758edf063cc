//! Lazily hydrated navigation trees for one object type.
//!
//! The main tree holds live nodes, the bin tree holds trashed subtrees.
//! Both are built from the navigation repository on first use and dropped
//! again by [`ContentNavigation::discard`] after a rebuild.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use metrics::counter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::error::CacheError;
use crate::application::repos::NavigationRepo;
use crate::domain::content::ContentCacheNode;
use crate::domain::error::DomainError;
use crate::domain::navigation::NavigationStructure;
use crate::domain::types::NodeObjectType;
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::navigation";

pub const METRIC_NAVIGATION_REHYDRATE: &str = "nucache_navigation_rehydrate_total";

/// Live and trashed structures of one object type.
#[derive(Default)]
pub struct NavigationTrees {
    main: NavigationStructure,
    bin: NavigationStructure,
}

impl NavigationTrees {
    pub fn main(&self) -> &NavigationStructure {
        &self.main
    }

    pub fn bin(&self) -> &NavigationStructure {
        &self.bin
    }
}

pub struct ContentNavigation {
    object_type: NodeObjectType,
    repository: Arc<dyn NavigationRepo>,
    trees: RwLock<Option<Arc<NavigationTrees>>>,
    // Bumped by every mutation; a hydration that raced one is not installed.
    generation: AtomicU64,
}

impl ContentNavigation {
    pub fn new(object_type: NodeObjectType, repository: Arc<dyn NavigationRepo>) -> Self {
        Self {
            object_type,
            repository,
            trees: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn object_type(&self) -> NodeObjectType {
        self.object_type
    }

    pub fn is_loaded(&self) -> bool {
        rw_read(&self.trees, SOURCE, "is_loaded").is_some()
    }

    /// Drop both trees; the next query rehydrates from the repository.
    pub fn discard(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = rw_write(&self.trees, SOURCE, "discard").take().is_some();
        if dropped {
            debug!(kind = self.object_type.as_str(), "Navigation trees discarded");
        }
    }

    fn loaded(&self) -> Option<Arc<NavigationTrees>> {
        rw_read(&self.trees, SOURCE, "loaded").clone()
    }

    fn touch(&self) -> Option<Arc<NavigationTrees>> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.loaded()
    }

    /// Loaded trees, hydrating them first if needed.
    pub async fn trees(&self) -> Result<Arc<NavigationTrees>, CacheError> {
        if let Some(trees) = self.loaded() {
            return Ok(trees);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let main = self
            .repository
            .navigation_models(self.object_type, false)
            .await
            .map_err(CacheError::repository)?;
        let bin = self
            .repository
            .navigation_models(self.object_type, true)
            .await
            .map_err(CacheError::repository)?;

        let trees = Arc::new(NavigationTrees {
            main: NavigationStructure::build(&main),
            bin: NavigationStructure::build(&bin),
        });
        counter!(METRIC_NAVIGATION_REHYDRATE, "kind" => self.object_type.as_str()).increment(1);

        let mut slot = rw_write(&self.trees, SOURCE, "hydrate");
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        if self.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&trees));
            info!(
                kind = self.object_type.as_str(),
                nodes = trees.main.len(),
                trashed = trees.bin.len(),
                "Navigation trees hydrated"
            );
        }
        Ok(trees)
    }

    fn lookup_error(&self, err: DomainError) -> CacheError {
        CacheError::navigation_lookup(self.object_type, err)
    }

    /// Surface a structural failure and drop the trees so they rehydrate.
    fn structural(&self, err: DomainError) -> CacheError {
        warn!(
            kind = self.object_type.as_str(),
            error = %err,
            "Navigation patch failed; trees discarded"
        );
        self.discard();
        CacheError::StructuralInconsistency(err)
    }

    // Mutations. Unloaded trees are left alone: hydration reads the
    // canonical store, which already reflects the change.

    pub fn add(
        &self,
        key: Uuid,
        content_type_key: Uuid,
        parent: Option<Uuid>,
        sort_order: i32,
    ) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        trees
            .main
            .insert(key, content_type_key, parent, Some(sort_order))
            .map_err(|err| self.lookup_error(err))
    }

    /// Re-parent `key` in the main tree; `None` makes it a root.
    pub fn move_to(&self, key: Uuid, target_parent: Option<Uuid>) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        reposition(&trees.main, key, target_parent).map_err(|err| self.lookup_error(err))
    }

    pub fn update_sort_order(&self, key: Uuid, sort_order: i32) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        trees
            .main
            .update_sort_order(key, sort_order)
            .map_err(|err| self.lookup_error(err))
    }

    /// Move the subtree under `key` into the recycle bin.
    pub fn move_to_bin(&self, key: Uuid) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        if !trees.main.contains(&key) {
            return Ok(());
        }
        let nodes = trees
            .main
            .detach_subtree(key)
            .map_err(|err| self.structural(err))?;
        trees
            .bin
            .attach_subtree(nodes, None)
            .map_err(|err| self.structural(err))
    }

    /// Move a trashed subtree back beneath `target_parent`.
    pub fn restore_from_bin(&self, key: Uuid, target_parent: Option<Uuid>) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        if !trees.bin.contains(&key) {
            return Err(self.lookup_error(DomainError::node_not_found(key)));
        }
        if let Some(parent) = target_parent
            && !trees.main.contains(&parent)
        {
            return Err(self.lookup_error(DomainError::node_not_found(parent)));
        }
        let nodes = trees
            .bin
            .detach_subtree(key)
            .map_err(|err| self.structural(err))?;
        trees
            .main
            .attach_subtree(nodes, target_parent)
            .map_err(|err| self.structural(err))
    }

    /// Forget `key` and its descendants, wherever they are.
    pub fn remove(&self, key: Uuid) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        let structure = if trees.main.contains(&key) {
            &trees.main
        } else if trees.bin.contains(&key) {
            &trees.bin
        } else {
            return Ok(());
        };
        structure
            .remove_subtree(key)
            .map(|_| ())
            .map_err(|err| self.structural(err))
    }

    /// `key` followed by its descendants in whichever loaded tree holds it.
    ///
    /// Only `key` itself when the trees are not loaded or do not hold it.
    pub fn subtree_keys(&self, key: Uuid) -> Vec<Uuid> {
        let mut keys = vec![key];
        let Some(trees) = self.loaded() else {
            return keys;
        };
        let structure = if trees.main.contains(&key) {
            &trees.main
        } else if trees.bin.contains(&key) {
            &trees.bin
        } else {
            return keys;
        };
        match structure.descendants_of(key) {
            Ok(descendants) => keys.extend(descendants),
            Err(err) => debug!(
                kind = self.object_type.as_str(),
                error = %err,
                "Subtree walk failed; using the root only"
            ),
        }
        keys
    }

    /// Bring the main tree in line with a refreshed node: insert it, move it
    /// out of the bin, re-parent it, and apply its sort order.
    pub(crate) fn apply_placement(&self, node: &ContentCacheNode) -> Result<(), CacheError> {
        let Some(trees) = self.touch() else {
            return Ok(());
        };
        if let Some(parent) = node.parent_key
            && !trees.main.contains(&parent)
        {
            debug!(
                kind = self.object_type.as_str(),
                node_id = node.id,
                parent = %parent,
                "Parent not in navigation; trees discarded"
            );
            self.discard();
            return Ok(());
        }

        let placed = if trees.main.contains(&node.key) {
            reposition(&trees.main, node.key, node.parent_key)
        } else if trees.bin.contains(&node.key) {
            trees
                .bin
                .detach_subtree(node.key)
                .and_then(|nodes| trees.main.attach_subtree(nodes, node.parent_key))
        } else {
            trees.main.insert(
                node.key,
                node.content_type_key,
                node.parent_key,
                Some(node.sort_order),
            )
        };

        placed
            .and_then(|()| {
                if trees.main.sort_order_of(node.key)? != node.sort_order {
                    trees.main.update_sort_order(node.key, node.sort_order)?;
                }
                Ok(())
            })
            .map_err(|err| self.structural(err))
    }

    /// Add a node found by a read-through load if the loaded trees lack it.
    pub(crate) fn ensure_attached(&self, node: &ContentCacheNode) {
        let Some(trees) = self.loaded() else {
            return;
        };
        if trees.main.contains(&node.key) || trees.bin.contains(&node.key) {
            return;
        }
        let parent_known = node
            .parent_key
            .is_none_or(|parent| trees.main.contains(&parent));
        if !parent_known {
            return;
        }
        if let Err(err) = trees.main.insert(
            node.key,
            node.content_type_key,
            node.parent_key,
            Some(node.sort_order),
        ) {
            debug!(node_id = node.id, error = %err, "Navigation attach skipped");
        }
    }

    // Queries over the main tree.

    pub async fn contains(&self, key: Uuid) -> Result<bool, CacheError> {
        Ok(self.trees().await?.main.contains(&key))
    }

    pub async fn parent(&self, key: Uuid) -> Result<Option<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees.main.parent_of(key).map_err(|err| self.lookup_error(err))
    }

    pub async fn children(&self, key: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees.main.children_of(key).map_err(|err| self.lookup_error(err))
    }

    pub async fn children_of_type(
        &self,
        key: Uuid,
        content_type_key: Uuid,
    ) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees
            .main
            .children_of_type(key, content_type_key)
            .map_err(|err| self.lookup_error(err))
    }

    pub async fn descendants(&self, key: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees
            .main
            .descendants_of(key)
            .map_err(|err| self.lookup_error(err))
    }

    pub async fn descendants_of_type(
        &self,
        key: Uuid,
        content_type_key: Uuid,
    ) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees
            .main
            .descendants_of_type(key, content_type_key)
            .map_err(|err| self.lookup_error(err))
    }

    pub async fn ancestors(&self, key: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees.main.ancestors_of(key).map_err(|err| self.lookup_error(err))
    }

    pub async fn siblings(&self, key: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees.main.siblings_of(key).map_err(|err| self.lookup_error(err))
    }

    pub async fn level(&self, key: Uuid) -> Result<usize, CacheError> {
        let trees = self.trees().await?;
        trees.main.level_of(key).map_err(|err| self.lookup_error(err))
    }

    pub async fn roots(&self) -> Result<Vec<Uuid>, CacheError> {
        Ok(self.trees().await?.main.root_keys())
    }

    pub async fn roots_of_type(&self, content_type_key: Uuid) -> Result<Vec<Uuid>, CacheError> {
        Ok(self.trees().await?.main.root_keys_of_type(content_type_key))
    }

    // Recycle bin.

    pub async fn is_trashed(&self, key: Uuid) -> Result<bool, CacheError> {
        Ok(self.trees().await?.bin.contains(&key))
    }

    pub async fn bin_roots(&self) -> Result<Vec<Uuid>, CacheError> {
        Ok(self.trees().await?.bin.root_keys())
    }

    pub async fn bin_children(&self, key: Uuid) -> Result<Vec<Uuid>, CacheError> {
        let trees = self.trees().await?;
        trees.bin.children_of(key).map_err(|err| self.lookup_error(err))
    }
}

fn reposition(
    structure: &NavigationStructure,
    key: Uuid,
    parent: Option<Uuid>,
) -> Result<(), DomainError> {
    let current = structure.parent_of(key)?;
    if current == parent {
        return Ok(());
    }
    match (parent, current) {
        (Some(target), _) => structure.add_child(target, key),
        (None, Some(old)) => structure.remove_child(old, key),
        (None, None) => Ok(()),
    }
}
