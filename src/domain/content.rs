//! Cacheable snapshots of documents, media and members.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;
use super::types::{NodeObjectType, PublishedState};

/// Identity of one cache row: a node id and its preview (draft) flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheRowKey {
    pub node_id: i32,
    pub preview: bool,
}

impl CacheRowKey {
    pub fn new(node_id: i32, preview: bool) -> Self {
        Self { node_id, preview }
    }
}

/// One value of a property for a culture/segment pair.
///
/// Invariant cultures and segments are stored as empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyData {
    #[serde(default)]
    pub culture: String,
    #[serde(default)]
    pub segment: String,
    pub value: serde_json::Value,
}

impl PropertyData {
    pub fn invariant(value: serde_json::Value) -> Self {
        Self {
            culture: String::new(),
            segment: String::new(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CultureVariation {
    pub name: String,
    pub url_segment: Option<String>,
    pub date: OffsetDateTime,
    pub is_draft: bool,
}

/// Version payload of a node: names, property values and culture variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentData {
    pub name: String,
    pub url_segment: Option<String>,
    pub version_id: i32,
    pub version_date: OffsetDateTime,
    pub writer_id: i32,
    pub template_id: Option<i32>,
    pub published: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, Vec<PropertyData>>,
    #[serde(default)]
    pub culture_infos: BTreeMap<String, CultureVariation>,
}

impl ContentData {
    /// Values of one property in invariant culture and segment.
    pub fn invariant_value(&self, alias: &str) -> Option<&serde_json::Value> {
        self.properties
            .get(alias)?
            .iter()
            .find(|data| data.culture.is_empty() && data.segment.is_empty())
            .map(|data| &data.value)
    }
}

/// Denormalized form stored in a cache row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCacheDataModel {
    pub published_state: PublishedState,
    pub data: ContentData,
}

impl ContentCacheDataModel {
    /// Row payloads derived from a canonical item, keyed by preview flag.
    ///
    /// Documents always get a draft row and, when published, a published
    /// row. Media and members get a single non-preview row.
    pub fn canonical_rows(
        object_type: NodeObjectType,
        edited: ContentData,
        published: Option<ContentData>,
    ) -> Vec<(bool, ContentCacheDataModel)> {
        match object_type {
            NodeObjectType::Document => {
                let draft_state = if published.is_some() {
                    PublishedState::Published
                } else {
                    PublishedState::Unpublished
                };
                let mut rows = vec![(
                    true,
                    ContentCacheDataModel {
                        published_state: draft_state,
                        data: edited,
                    },
                )];
                if let Some(data) = published {
                    rows.push((
                        false,
                        ContentCacheDataModel {
                            published_state: PublishedState::Published,
                            data,
                        },
                    ));
                }
                rows
            }
            NodeObjectType::Media | NodeObjectType::Member => vec![(
                false,
                ContentCacheDataModel {
                    published_state: PublishedState::Published,
                    data: edited,
                },
            )],
        }
    }
}

/// Snapshot of one published or draft version of an item.
///
/// Treated as immutable once shared; refreshes install a new snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentCacheNode {
    pub id: i32,
    pub key: Uuid,
    pub object_type: NodeObjectType,
    pub content_type_id: i32,
    pub content_type_key: Uuid,
    pub parent_key: Option<Uuid>,
    pub sort_order: i32,
    pub creator_id: i32,
    pub created_at: OffsetDateTime,
    pub is_draft: bool,
    pub published_state: PublishedState,
    pub data: ContentData,
}

impl ContentCacheNode {
    pub fn row_key(&self) -> CacheRowKey {
        CacheRowKey::new(self.id, self.is_draft)
    }

    /// Compares identity (node id and preview flag) rather than payload.
    pub fn same_identity(&self, other: &ContentCacheNode) -> bool {
        self.row_key() == other.row_key()
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id <= 0 {
            return Err(DomainError::validation(format!(
                "node id must be positive, got {}",
                self.id
            )));
        }
        if self.key.is_nil() {
            return Err(DomainError::validation(format!(
                "node {} has a nil key",
                self.id
            )));
        }
        if self.parent_key == Some(self.key) {
            return Err(DomainError::validation(format!(
                "node {} is its own parent",
                self.id
            )));
        }
        Ok(())
    }

    pub fn to_data_model(&self) -> ContentCacheDataModel {
        ContentCacheDataModel {
            published_state: self.published_state,
            data: self.data.clone(),
        }
    }
}

/// Structural half of a node as recorded by the canonical store.
///
/// Combined with a cache row payload to produce a [`ContentCacheNode`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeShape {
    pub id: i32,
    pub key: Uuid,
    pub object_type: NodeObjectType,
    pub content_type_id: i32,
    pub content_type_key: Uuid,
    pub parent_key: Option<Uuid>,
    pub sort_order: i32,
    pub creator_id: i32,
    pub created_at: OffsetDateTime,
}

impl NodeShape {
    pub fn into_node(self, preview: bool, model: ContentCacheDataModel) -> ContentCacheNode {
        ContentCacheNode {
            id: self.id,
            key: self.key,
            object_type: self.object_type,
            content_type_id: self.content_type_id,
            content_type_key: self.content_type_key,
            parent_key: self.parent_key,
            sort_order: self.sort_order,
            creator_id: self.creator_id,
            created_at: self.created_at,
            is_draft: preview,
            published_state: model.published_state,
            data: model.data,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::document;
    use super::*;

    #[test]
    fn identity_ignores_payload() {
        let key = Uuid::new_v4();
        let first = document(1, key, None);
        let mut second = document(1, key, None);
        second.data.name = "Renamed".to_string();

        assert!(first.same_identity(&second));
        assert_ne!(first, second);

        second.is_draft = false;
        assert!(!first.same_identity(&second));
    }

    #[test]
    fn validate_rejects_nil_key_and_self_parent() {
        let mut node = document(1, Uuid::nil(), None);
        assert!(node.validate().is_err());

        node.key = Uuid::new_v4();
        node.parent_key = Some(node.key);
        assert!(node.validate().is_err());

        node.parent_key = None;
        assert!(node.validate().is_ok());
    }

    #[test]
    fn invariant_value_skips_culture_variants() {
        let mut data = super::fixtures::content_data("Home");
        data.properties.insert(
            "greeting".to_string(),
            vec![
                PropertyData {
                    culture: "da-DK".to_string(),
                    segment: String::new(),
                    value: serde_json::json!("Hej"),
                },
                PropertyData::invariant(serde_json::json!("Hello")),
            ],
        );

        assert_eq!(
            data.invariant_value("greeting"),
            Some(&serde_json::json!("Hello"))
        );
        assert_eq!(data.invariant_value("missing"), None);
    }
}
