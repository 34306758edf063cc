use serde::{Deserialize, Serialize};

use super::types::NodeObjectType;

/// Content-type filter for bulk reads and rebuilds.
///
/// `All` is the unfiltered form. `Only` with an empty list matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTypeScope {
    #[default]
    All,
    Only(Vec<i32>),
}

impl ContentTypeScope {
    pub fn none() -> Self {
        Self::Only(Vec::new())
    }

    pub fn only(ids: impl IntoIterator<Item = i32>) -> Self {
        let mut ids: Vec<i32> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self::Only(ids)
    }

    pub fn matches(&self, content_type_id: i32) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(&content_type_id),
        }
    }

    /// True when the scope cannot select any item.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Only(ids) if ids.is_empty())
    }

    pub fn ids(&self) -> Option<&[i32]> {
        match self {
            Self::All => None,
            Self::Only(ids) => Some(ids),
        }
    }
}

/// Per-kind rebuild selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildScopes {
    pub content: ContentTypeScope,
    pub media: ContentTypeScope,
    pub member: ContentTypeScope,
}

impl RebuildScopes {
    pub fn all() -> Self {
        Self {
            content: ContentTypeScope::All,
            media: ContentTypeScope::All,
            member: ContentTypeScope::All,
        }
    }

    pub fn none() -> Self {
        Self {
            content: ContentTypeScope::none(),
            media: ContentTypeScope::none(),
            member: ContentTypeScope::none(),
        }
    }

    pub fn for_kind(&self, kind: NodeObjectType) -> &ContentTypeScope {
        match kind {
            NodeObjectType::Document => &self.content,
            NodeObjectType::Media => &self.media,
            NodeObjectType::Member => &self.member,
        }
    }

    pub fn set_kind(&mut self, kind: NodeObjectType, scope: ContentTypeScope) {
        match kind {
            NodeObjectType::Document => self.content = scope,
            NodeObjectType::Media => self.media = scope,
            NodeObjectType::Member => self.member = scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_and_empty_only_are_different_scopes() {
        assert!(ContentTypeScope::All.matches(42));
        assert!(!ContentTypeScope::none().matches(42));
        assert!(ContentTypeScope::none().is_empty());
        assert!(!ContentTypeScope::All.is_empty());
        assert_ne!(ContentTypeScope::All, ContentTypeScope::none());
    }

    #[test]
    fn only_normalizes_ids() {
        let scope = ContentTypeScope::only([3, 1, 3]);
        assert_eq!(scope.ids(), Some(&[1, 3][..]));
        assert!(scope.matches(1));
        assert!(!scope.matches(2));
    }

    #[test]
    fn rebuild_scopes_select_by_kind() {
        let mut scopes = RebuildScopes::none();
        scopes.set_kind(NodeObjectType::Media, ContentTypeScope::All);

        assert!(scopes.for_kind(NodeObjectType::Document).is_empty());
        assert_eq!(scopes.for_kind(NodeObjectType::Media), &ContentTypeScope::All);
    }
}
