//! Key-indexed parent/child forest mirroring the content tree.
//!
//! Nodes reference each other by key only; the structure owns every node.
//! Structural writes hold the topology guard exclusively so that a reader
//! never observes a child set and a parent pointer that disagree.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use super::error::DomainError;
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "domain::navigation";

/// Flat tree row used to hydrate a structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationModel {
    pub id: i32,
    pub key: Uuid,
    pub parent_id: Option<i32>,
    pub sort_order: i32,
    pub content_type_key: Uuid,
}

#[derive(Debug)]
pub struct NavigationNode {
    key: Uuid,
    content_type_key: Uuid,
    sort_order: i32,
    parent: Option<Uuid>,
    children: DashSet<Uuid>,
}

impl NavigationNode {
    pub fn new(key: Uuid, content_type_key: Uuid, sort_order: i32) -> Self {
        Self {
            key,
            content_type_key,
            sort_order,
            parent: None,
            children: DashSet::new(),
        }
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn content_type_key(&self) -> Uuid {
        self.content_type_key
    }

    pub fn sort_order(&self) -> i32 {
        self.sort_order
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn has_child(&self, key: &Uuid) -> bool {
        self.children.contains(key)
    }

    pub fn update_sort_order(&mut self, sort_order: i32) {
        self.sort_order = sort_order;
    }
}

#[derive(Debug, Default)]
pub struct NavigationStructure {
    nodes: DashMap<Uuid, NavigationNode>,
    roots: DashSet<Uuid>,
    topology: RwLock<()>,
}

impl NavigationStructure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a structure from flat rows.
    ///
    /// Rows whose parent is not part of `models` become roots, which is how
    /// trashed subtrees surface at the top of a recycle bin.
    pub fn build(models: &[NavigationModel]) -> Self {
        let structure = Self::new();
        let keys_by_id: HashMap<i32, Uuid> = models.iter().map(|m| (m.id, m.key)).collect();

        for model in models {
            structure.nodes.insert(
                model.key,
                NavigationNode::new(model.key, model.content_type_key, model.sort_order),
            );
        }

        for model in models {
            let parent = model
                .parent_id
                .and_then(|id| keys_by_id.get(&id).copied())
                .filter(|key| *key != model.key);
            match parent {
                Some(parent_key) => {
                    if let Some(parent_node) = structure.nodes.get(&parent_key) {
                        parent_node.children.insert(model.key);
                    }
                    if let Some(mut node) = structure.nodes.get_mut(&model.key) {
                        node.parent = Some(parent_key);
                    }
                }
                None => {
                    structure.roots.insert(model.key);
                }
            }
        }

        structure
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &Uuid) -> bool {
        self.nodes.contains_key(key)
    }

    /// Insert a new node under `parent`, or as a root when `parent` is `None`.
    ///
    /// Without an explicit `sort_order` the node is appended after its
    /// current siblings.
    pub fn insert(
        &self,
        key: Uuid,
        content_type_key: Uuid,
        parent: Option<Uuid>,
        sort_order: Option<i32>,
    ) -> Result<(), DomainError> {
        let _topology = rw_write(&self.topology, SOURCE, "insert");

        if self.nodes.contains_key(&key) {
            return Err(DomainError::already_exists(key));
        }
        if let Some(parent_key) = parent
            && !self.nodes.contains_key(&parent_key)
        {
            return Err(DomainError::node_not_found(parent_key));
        }

        let order = sort_order.unwrap_or_else(|| self.next_order(parent));
        let mut node = NavigationNode::new(key, content_type_key, order);
        node.parent = parent;
        self.nodes.insert(key, node);
        self.link(key, parent);

        Ok(())
    }

    /// Attach an existing node beneath `parent_key`.
    ///
    /// The child's sort order becomes the parent's child count before the
    /// attach. A child attached elsewhere is detached first. Fails without
    /// touching the structure when either key is absent or the attach would
    /// create a cycle.
    pub fn add_child(&self, parent_key: Uuid, child_key: Uuid) -> Result<(), DomainError> {
        let _topology = rw_write(&self.topology, SOURCE, "add_child");

        if !self.nodes.contains_key(&child_key) {
            return Err(DomainError::node_not_found(child_key));
        }
        if !self.nodes.contains_key(&parent_key) {
            return Err(DomainError::node_not_found(parent_key));
        }
        if parent_key == child_key || self.is_ancestor(child_key, parent_key) {
            return Err(DomainError::validation(format!(
                "attaching `{child_key}` beneath `{parent_key}` would create a cycle"
            )));
        }

        let old_parent = self.nodes.get(&child_key).and_then(|node| node.parent);
        if old_parent == Some(parent_key) {
            return Ok(());
        }

        self.unlink(child_key, old_parent);
        let order = self.next_order(Some(parent_key));
        if let Some(mut child) = self.nodes.get_mut(&child_key) {
            child.parent = Some(parent_key);
            child.sort_order = order;
        }
        self.link(child_key, Some(parent_key));

        Ok(())
    }

    /// Detach `child_key` from `parent_key`; the child becomes a root.
    pub fn remove_child(&self, parent_key: Uuid, child_key: Uuid) -> Result<(), DomainError> {
        let _topology = rw_write(&self.topology, SOURCE, "remove_child");

        let current_parent = self
            .nodes
            .get(&child_key)
            .map(|node| node.parent)
            .ok_or_else(|| DomainError::node_not_found(child_key))?;
        if current_parent != Some(parent_key) {
            return Err(DomainError::validation(format!(
                "`{child_key}` is not a child of `{parent_key}`"
            )));
        }

        self.unlink(child_key, current_parent);
        if let Some(mut child) = self.nodes.get_mut(&child_key) {
            child.parent = None;
        }
        self.link(child_key, None);

        Ok(())
    }

    pub fn update_sort_order(&self, key: Uuid, sort_order: i32) -> Result<(), DomainError> {
        let _topology = rw_write(&self.topology, SOURCE, "update_sort_order");

        let mut node = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| DomainError::node_not_found(key))?;
        node.update_sort_order(sort_order);
        Ok(())
    }

    /// Take `key` and all of its descendants out of the structure.
    ///
    /// The returned nodes start with the detached subtree root, whose parent
    /// pointer is cleared; the rest keep their links.
    pub fn detach_subtree(&self, key: Uuid) -> Result<Vec<NavigationNode>, DomainError> {
        let _topology = rw_write(&self.topology, SOURCE, "detach_subtree");

        let parent = self
            .nodes
            .get(&key)
            .map(|node| node.parent)
            .ok_or_else(|| DomainError::node_not_found(key))?;
        let mut keys = vec![key];
        self.collect_descendants(key, &mut keys)?;
        self.unlink(key, parent);

        let mut detached = Vec::with_capacity(keys.len());
        for descendant in keys {
            match self.nodes.remove(&descendant) {
                Some((_, node)) => detached.push(node),
                None => {
                    return Err(DomainError::inconsistent(format!(
                        "child `{descendant}` is listed but missing from the index"
                    )));
                }
            }
        }
        if let Some(root) = detached.first_mut() {
            root.parent = None;
        }

        Ok(detached)
    }

    /// Insert a subtree produced by [`detach_subtree`](Self::detach_subtree).
    ///
    /// The first node becomes a child of `parent` (or a root) and is
    /// appended after its new siblings.
    pub fn attach_subtree(
        &self,
        nodes: Vec<NavigationNode>,
        parent: Option<Uuid>,
    ) -> Result<(), DomainError> {
        let _topology = rw_write(&self.topology, SOURCE, "attach_subtree");

        let Some(root_key) = nodes.first().map(NavigationNode::key) else {
            return Ok(());
        };
        if let Some(existing) = nodes.iter().find(|node| self.nodes.contains_key(&node.key)) {
            return Err(DomainError::already_exists(existing.key));
        }
        if let Some(parent_key) = parent {
            if !self.nodes.contains_key(&parent_key) {
                return Err(DomainError::node_not_found(parent_key));
            }
            if nodes.iter().any(|node| node.key == parent_key) {
                return Err(DomainError::validation(format!(
                    "subtree `{root_key}` cannot be attached beneath itself"
                )));
            }
        }

        let order = self.next_order(parent);
        for mut node in nodes {
            if node.key == root_key {
                node.parent = parent;
                node.sort_order = order;
            }
            self.nodes.insert(node.key, node);
        }
        self.link(root_key, parent);

        Ok(())
    }

    /// Remove `key` and its descendants, returning the removed keys.
    pub fn remove_subtree(&self, key: Uuid) -> Result<Vec<Uuid>, DomainError> {
        Ok(self
            .detach_subtree(key)?
            .into_iter()
            .map(|node| node.key)
            .collect())
    }

    pub fn parent_of(&self, key: Uuid) -> Result<Option<Uuid>, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "parent_of");
        self.nodes
            .get(&key)
            .map(|node| node.parent)
            .ok_or_else(|| DomainError::node_not_found(key))
    }

    pub fn sort_order_of(&self, key: Uuid) -> Result<i32, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "sort_order_of");
        self.nodes
            .get(&key)
            .map(|node| node.sort_order)
            .ok_or_else(|| DomainError::node_not_found(key))
    }

    pub fn content_type_of(&self, key: Uuid) -> Result<Uuid, DomainError> {
        self.nodes
            .get(&key)
            .map(|node| node.content_type_key)
            .ok_or_else(|| DomainError::node_not_found(key))
    }

    /// Children of `key` ordered by sort order.
    pub fn children_of(&self, key: Uuid) -> Result<Vec<Uuid>, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "children_of");
        self.ordered_children(key)
    }

    pub fn children_of_type(
        &self,
        key: Uuid,
        content_type_key: Uuid,
    ) -> Result<Vec<Uuid>, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "children_of_type");
        let children = self.ordered_children(key)?;
        Ok(self.filter_type(children, content_type_key))
    }

    /// Depth-first descendants of `key`, each level in sort order.
    pub fn descendants_of(&self, key: Uuid) -> Result<Vec<Uuid>, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "descendants_of");
        if !self.nodes.contains_key(&key) {
            return Err(DomainError::node_not_found(key));
        }
        let mut out = Vec::new();
        self.collect_descendants(key, &mut out)?;
        Ok(out)
    }

    pub fn descendants_of_type(
        &self,
        key: Uuid,
        content_type_key: Uuid,
    ) -> Result<Vec<Uuid>, DomainError> {
        let descendants = self.descendants_of(key)?;
        Ok(self.filter_type(descendants, content_type_key))
    }

    /// Ancestors of `key`, nearest first.
    pub fn ancestors_of(&self, key: Uuid) -> Result<Vec<Uuid>, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "ancestors_of");
        let mut current = self
            .nodes
            .get(&key)
            .map(|node| node.parent)
            .ok_or_else(|| DomainError::node_not_found(key))?;

        let mut out = Vec::new();
        while let Some(parent_key) = current {
            if out.len() >= self.nodes.len() {
                return Err(DomainError::inconsistent(format!(
                    "parent chain of `{key}` does not terminate"
                )));
            }
            out.push(parent_key);
            current = self
                .nodes
                .get(&parent_key)
                .map(|node| node.parent)
                .ok_or_else(|| {
                    DomainError::inconsistent(format!("parent `{parent_key}` is not indexed"))
                })?;
        }
        Ok(out)
    }

    /// Other children of `key`'s parent (or other roots), in sort order.
    pub fn siblings_of(&self, key: Uuid) -> Result<Vec<Uuid>, DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "siblings_of");
        let parent = self
            .nodes
            .get(&key)
            .map(|node| node.parent)
            .ok_or_else(|| DomainError::node_not_found(key))?;

        let peers = match parent {
            Some(parent_key) => self.ordered_children(parent_key)?,
            None => self.ordered(self.roots.iter().map(|k| *k).collect()),
        };
        Ok(peers.into_iter().filter(|peer| *peer != key).collect())
    }

    pub fn root_keys(&self) -> Vec<Uuid> {
        let _topology = rw_read(&self.topology, SOURCE, "root_keys");
        self.ordered(self.roots.iter().map(|k| *k).collect())
    }

    pub fn root_keys_of_type(&self, content_type_key: Uuid) -> Vec<Uuid> {
        let roots = self.root_keys();
        self.filter_type(roots, content_type_key)
    }

    /// Depth of `key`; roots are level 1.
    pub fn level_of(&self, key: Uuid) -> Result<usize, DomainError> {
        Ok(self.ancestors_of(key)?.len() + 1)
    }

    /// Check that every parent pointer is mirrored by the parent's child set
    /// and that the root set matches the parentless nodes.
    pub fn check_consistency(&self) -> Result<(), DomainError> {
        let _topology = rw_read(&self.topology, SOURCE, "check_consistency");

        let mut links = Vec::with_capacity(self.nodes.len());
        for entry in self.nodes.iter() {
            let children: Vec<Uuid> = entry.children.iter().map(|k| *k).collect();
            links.push((entry.key, entry.parent, children));
        }

        for (key, parent, children) in &links {
            match parent {
                Some(parent_key) => {
                    let mirrored = self
                        .nodes
                        .get(parent_key)
                        .is_some_and(|parent_node| parent_node.has_child(key));
                    if !mirrored {
                        return Err(DomainError::inconsistent(format!(
                            "`{key}` points at parent `{parent_key}` which does not list it"
                        )));
                    }
                    if self.roots.contains(key) {
                        return Err(DomainError::inconsistent(format!(
                            "`{key}` has a parent but is listed as a root"
                        )));
                    }
                }
                None if !self.roots.contains(key) => {
                    return Err(DomainError::inconsistent(format!(
                        "parentless `{key}` is missing from the root set"
                    )));
                }
                None => {}
            }
            for child in children {
                let points_back = self
                    .nodes
                    .get(child)
                    .is_some_and(|child_node| child_node.parent == Some(*key));
                if !points_back {
                    return Err(DomainError::inconsistent(format!(
                        "`{key}` lists child `{child}` which does not point back"
                    )));
                }
            }
        }
        Ok(())
    }

    fn next_order(&self, parent: Option<Uuid>) -> i32 {
        let count = match parent {
            Some(parent_key) => self
                .nodes
                .get(&parent_key)
                .map(|node| node.children.len())
                .unwrap_or(0),
            None => self.roots.len(),
        };
        i32::try_from(count).unwrap_or(i32::MAX)
    }

    fn link(&self, key: Uuid, parent: Option<Uuid>) {
        match parent {
            Some(parent_key) => {
                if let Some(parent_node) = self.nodes.get(&parent_key) {
                    parent_node.children.insert(key);
                }
            }
            None => {
                self.roots.insert(key);
            }
        }
    }

    fn unlink(&self, key: Uuid, parent: Option<Uuid>) {
        match parent {
            Some(parent_key) => {
                if let Some(parent_node) = self.nodes.get(&parent_key) {
                    parent_node.children.remove(&key);
                }
            }
            None => {
                self.roots.remove(&key);
            }
        }
    }

    fn is_ancestor(&self, candidate: Uuid, of: Uuid) -> bool {
        let mut visited = HashSet::new();
        let mut current = self.nodes.get(&of).and_then(|node| node.parent);
        while let Some(key) = current {
            if key == candidate {
                return true;
            }
            if !visited.insert(key) {
                return false;
            }
            current = self.nodes.get(&key).and_then(|node| node.parent);
        }
        false
    }

    fn ordered_children(&self, key: Uuid) -> Result<Vec<Uuid>, DomainError> {
        let children: Vec<Uuid> = self
            .nodes
            .get(&key)
            .map(|node| node.children.iter().map(|k| *k).collect())
            .ok_or_else(|| DomainError::node_not_found(key))?;
        Ok(self.ordered(children))
    }

    fn ordered(&self, keys: Vec<Uuid>) -> Vec<Uuid> {
        let mut keyed: Vec<(i32, Uuid)> = keys
            .into_iter()
            .filter_map(|key| self.nodes.get(&key).map(|node| (node.sort_order, key)))
            .collect();
        keyed.sort_unstable();
        keyed.into_iter().map(|(_, key)| key).collect()
    }

    /// Appends the descendants of `key` to `out`; a node met twice means the
    /// child links form a cycle.
    fn collect_descendants(&self, key: Uuid, out: &mut Vec<Uuid>) -> Result<(), DomainError> {
        let mut visited = HashSet::from([key]);
        self.walk_descendants(key, &mut visited, out)
    }

    fn walk_descendants(
        &self,
        key: Uuid,
        visited: &mut HashSet<Uuid>,
        out: &mut Vec<Uuid>,
    ) -> Result<(), DomainError> {
        let Ok(children) = self.ordered_children(key) else {
            return Ok(());
        };
        for child in children {
            if !visited.insert(child) {
                return Err(DomainError::inconsistent(format!(
                    "`{child}` is reachable from itself through `{key}`"
                )));
            }
            out.push(child);
            self.walk_descendants(child, visited, out)?;
        }
        Ok(())
    }

    fn filter_type(&self, keys: Vec<Uuid>, content_type_key: Uuid) -> Vec<Uuid> {
        keys.into_iter()
            .filter(|key| {
                self.nodes
                    .get(key)
                    .is_some_and(|node| node.content_type_key == content_type_key)
            })
            .collect()
    }
}
