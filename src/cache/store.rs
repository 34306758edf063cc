//! In-memory node table.
//!
//! Holds one shared snapshot per cache row. Entries carry the generation of
//! their kind at insert time; bumping a generation marks every entry of that
//! kind stale without walking the table.
//!
//! Read-through loads race with writes: a load takes a [`LoadTicket`] before
//! calling the repository and may only insert if no write touched the table
//! since. Writers bump the write epoch before changing an entry, and the
//! ticket is checked under the entry's shard lock, so a load can never
//! replace a newer snapshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::domain::content::{CacheRowKey, ContentCacheNode};
use crate::domain::scope::ContentTypeScope;
use crate::domain::types::NodeObjectType;

#[derive(Debug, Clone)]
struct StoredNode {
    node: Arc<ContentCacheNode>,
    generation: u64,
}

/// Result of a lookup in the node table.
#[derive(Debug, Clone)]
pub enum Lookup {
    Fresh(Arc<ContentCacheNode>),
    /// Present but invalidated by a rebuild; usable only as a fallback.
    Stale(Arc<ContentCacheNode>),
    Missing,
}

/// Write epoch observed before a repository load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket {
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct NodeStore {
    entries: DashMap<CacheRowKey, StoredNode>,
    ids_by_key: DashMap<Uuid, i32>,
    generations: [AtomicU64; 3],
    write_epoch: AtomicU64,
}

fn kind_index(object_type: NodeObjectType) -> usize {
    match object_type {
        NodeObjectType::Document => 0,
        NodeObjectType::Media => 1,
        NodeObjectType::Member => 2,
    }
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn generation(&self, object_type: NodeObjectType) -> u64 {
        self.generations[kind_index(object_type)].load(Ordering::SeqCst)
    }

    fn begin_write(&self) {
        self.write_epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn lookup(&self, key: CacheRowKey) -> Lookup {
        let Some(stored) = self.entries.get(&key) else {
            return Lookup::Missing;
        };
        let node = Arc::clone(&stored.node);
        let generation = stored.generation;
        drop(stored);

        if generation == self.generation(node.object_type) {
            Lookup::Fresh(node)
        } else {
            Lookup::Stale(node)
        }
    }

    /// Node id last seen for `key`, if any snapshot has been stored.
    pub fn id_for_key(&self, key: Uuid) -> Option<i32> {
        self.ids_by_key.get(&key).map(|id| *id)
    }

    pub fn begin_load(&self) -> LoadTicket {
        LoadTicket {
            epoch: self.write_epoch.load(Ordering::SeqCst),
        }
    }

    /// Insert a snapshot obtained by a read-through load.
    ///
    /// Returns `false` when a write happened after `ticket` was taken or a
    /// fresh entry is already present; the caller still returns its own copy.
    pub fn insert_loaded(&self, ticket: LoadTicket, node: Arc<ContentCacheNode>) -> bool {
        let generation = self.generation(node.object_type);
        let key = node.key;
        let id = node.id;

        let inserted = match self.entries.entry(node.row_key()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().generation == generation || !self.ticket_valid(ticket) {
                    false
                } else {
                    occupied.insert(StoredNode { node, generation });
                    true
                }
            }
            Entry::Vacant(vacant) => {
                if self.ticket_valid(ticket) {
                    vacant.insert(StoredNode { node, generation });
                    true
                } else {
                    false
                }
            }
        };

        if inserted {
            self.ids_by_key.insert(key, id);
        }
        inserted
    }

    fn ticket_valid(&self, ticket: LoadTicket) -> bool {
        self.write_epoch.load(Ordering::SeqCst) == ticket.epoch
    }

    /// Install the snapshot from a change notification.
    pub fn replace(&self, node: Arc<ContentCacheNode>) {
        self.begin_write();
        let generation = self.generation(node.object_type);
        self.ids_by_key.insert(node.key, node.id);
        self.entries
            .insert(node.row_key(), StoredNode { node, generation });
    }

    /// Drop one variant of a node.
    pub fn remove_variant(&self, key: CacheRowKey) -> Option<Arc<ContentCacheNode>> {
        self.begin_write();
        self.entries.remove(&key).map(|(_, stored)| stored.node)
    }

    /// Drop every variant of a node and its key mapping.
    pub fn remove_node(&self, id: i32) -> usize {
        self.begin_write();
        let mut removed = 0;
        for preview in [true, false] {
            if let Some((_, stored)) = self.entries.remove(&CacheRowKey::new(id, preview)) {
                self.ids_by_key.remove_if(&stored.node.key, |_, mapped| *mapped == id);
                removed += 1;
            }
        }
        removed
    }

    /// Ids of cached nodes of `object_type` in the subtree under `root`.
    ///
    /// `known` lists subtree keys already resolved by navigation. Cached
    /// nodes whose parent chain leads into the subtree are added by walking
    /// parent keys, so descendants are found even when navigation is not
    /// loaded.
    pub fn subtree_ids(
        &self,
        object_type: NodeObjectType,
        root: Uuid,
        known: &[Uuid],
    ) -> Vec<i32> {
        let mut keys: HashSet<Uuid> = known.iter().copied().chain([root]).collect();
        loop {
            let found: Vec<Uuid> = self
                .entries
                .iter()
                .filter(|stored| {
                    stored.node.object_type == object_type
                        && !keys.contains(&stored.node.key)
                        && stored
                            .node
                            .parent_key
                            .is_some_and(|parent| keys.contains(&parent))
                })
                .map(|stored| stored.node.key)
                .collect();
            if found.is_empty() {
                break;
            }
            keys.extend(found);
        }

        let mut ids: Vec<i32> = self
            .entries
            .iter()
            .filter(|stored| {
                stored.node.object_type == object_type && keys.contains(&stored.node.key)
            })
            .map(|stored| stored.node.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Mark every entry of a kind stale.
    pub fn invalidate_kind(&self, object_type: NodeObjectType) {
        self.begin_write();
        self.generations[kind_index(object_type)].fetch_add(1, Ordering::SeqCst);
    }

    /// Evict entries of a kind whose content type is listed.
    pub fn evict_content_types(&self, object_type: NodeObjectType, content_type_ids: &[i32]) -> usize {
        self.begin_write();
        let before = self.entries.len();
        self.entries.retain(|_, stored| {
            !(stored.node.object_type == object_type
                && content_type_ids.contains(&stored.node.content_type_id))
        });
        before.saturating_sub(self.entries.len())
    }

    /// Discard the part of the table covered by `scope`.
    pub fn invalidate_scope(&self, object_type: NodeObjectType, scope: &ContentTypeScope) {
        match scope.ids() {
            None => self.invalidate_kind(object_type),
            Some([]) => {}
            Some(ids) => {
                self.evict_content_types(object_type, ids);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::content::fixtures::document;

    fn node(id: i32, preview: bool) -> Arc<ContentCacheNode> {
        let mut node = document(id, Uuid::from_u128(id as u128), None);
        node.is_draft = preview;
        Arc::new(node)
    }

    #[test]
    fn lookup_distinguishes_variants() {
        let store = NodeStore::new();
        store.replace(node(1, true));

        assert!(matches!(
            store.lookup(CacheRowKey::new(1, true)),
            Lookup::Fresh(_)
        ));
        assert!(matches!(
            store.lookup(CacheRowKey::new(1, false)),
            Lookup::Missing
        ));
        assert_eq!(store.id_for_key(Uuid::from_u128(1)), Some(1));
    }

    #[test]
    fn load_loses_to_a_concurrent_write() {
        let store = NodeStore::new();
        let ticket = store.begin_load();

        let mut newer = (*node(1, true)).clone();
        newer.data.name = "Newer".to_string();
        store.replace(Arc::new(newer));

        assert!(!store.insert_loaded(ticket, node(1, true)));
        match store.lookup(CacheRowKey::new(1, true)) {
            Lookup::Fresh(found) => assert_eq!(found.data.name, "Newer"),
            other => panic!("unexpected lookup: {other:?}"),
        }
    }

    #[test]
    fn load_after_remove_does_not_resurrect() {
        let store = NodeStore::new();
        store.replace(node(1, true));
        let ticket = store.begin_load();
        store.remove_node(1);

        assert!(!store.insert_loaded(ticket, node(1, true)));
        assert!(store.is_empty());
        assert_eq!(store.id_for_key(Uuid::from_u128(1)), None);
    }

    #[test]
    fn loaded_entry_does_not_replace_fresh_entry() {
        let store = NodeStore::new();
        store.replace(node(1, true));
        let ticket = store.begin_load();

        assert!(!store.insert_loaded(ticket, node(1, true)));
    }

    #[test]
    fn invalidated_kind_turns_stale_and_reloads() {
        let store = NodeStore::new();
        store.replace(node(1, true));
        store.invalidate_kind(NodeObjectType::Document);

        assert!(matches!(
            store.lookup(CacheRowKey::new(1, true)),
            Lookup::Stale(_)
        ));

        let ticket = store.begin_load();
        assert!(store.insert_loaded(ticket, node(1, true)));
        assert!(matches!(
            store.lookup(CacheRowKey::new(1, true)),
            Lookup::Fresh(_)
        ));
    }

    #[test]
    fn invalidation_is_per_kind() {
        let store = NodeStore::new();
        let mut member = (*node(2, false)).clone();
        member.object_type = NodeObjectType::Member;
        store.replace(node(1, true));
        store.replace(Arc::new(member));

        store.invalidate_kind(NodeObjectType::Member);

        assert!(matches!(
            store.lookup(CacheRowKey::new(1, true)),
            Lookup::Fresh(_)
        ));
        assert!(matches!(
            store.lookup(CacheRowKey::new(2, false)),
            Lookup::Stale(_)
        ));
    }

    #[test]
    fn scoped_invalidation_evicts_listed_content_types() {
        let store = NodeStore::new();
        let mut other_type = (*node(2, true)).clone();
        other_type.content_type_id = 99;
        store.replace(node(1, true));
        store.replace(Arc::new(other_type));

        store.invalidate_scope(NodeObjectType::Document, &ContentTypeScope::none());
        assert_eq!(store.len(), 2);

        store.invalidate_scope(NodeObjectType::Document, &ContentTypeScope::only([99]));
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.lookup(CacheRowKey::new(1, true)),
            Lookup::Fresh(_)
        ));
    }

    #[test]
    fn subtree_ids_follow_cached_parent_keys() {
        let store = NodeStore::new();
        let root = node(1, true);
        let mut child = (*node(2, true)).clone();
        child.parent_key = Some(root.key);
        let mut grandchild = (*node(3, false)).clone();
        grandchild.parent_key = Some(child.key);
        let unrelated = node(4, true);
        store.replace(Arc::clone(&root));
        store.replace(Arc::new(child));
        store.replace(Arc::new(grandchild));
        store.replace(unrelated);

        assert_eq!(
            store.subtree_ids(NodeObjectType::Document, root.key, &[]),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn subtree_ids_include_descendants_resolved_elsewhere() {
        let store = NodeStore::new();
        // Parent 2 is not cached, so only the supplied keys link 3 to root 1.
        let mut grandchild = (*node(3, true)).clone();
        grandchild.parent_key = Some(Uuid::from_u128(2));
        store.replace(Arc::new(grandchild));

        let root = Uuid::from_u128(1);
        assert!(
            store
                .subtree_ids(NodeObjectType::Document, root, &[])
                .is_empty()
        );
        assert_eq!(
            store.subtree_ids(NodeObjectType::Document, root, &[Uuid::from_u128(2)]),
            vec![3]
        );
    }
}
