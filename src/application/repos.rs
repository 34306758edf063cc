//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::application::cancel::CancelToken;
use crate::domain::content::ContentCacheNode;
use crate::domain::navigation::NavigationModel;
use crate::domain::scope::{ContentTypeScope, RebuildScopes};
use crate::domain::types::{NodeObjectType, PublishedState};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("cache payload could not be decoded: {message}")]
    Serialization { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }

    /// Connectivity-class failures that a later retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Timeout)
    }
}

/// Reject nodes of the wrong kind or with invalid identity before a write.
pub fn ensure_node_kind(
    node: &ContentCacheNode,
    object_type: NodeObjectType,
) -> Result<(), RepoError> {
    if node.object_type != object_type {
        return Err(RepoError::InvalidInput {
            message: format!(
                "node {} is a {}, expected a {}",
                node.id,
                node.object_type.as_str(),
                object_type.as_str()
            ),
        });
    }
    node.validate().map_err(|err| RepoError::InvalidInput {
        message: err.to_string(),
    })
}

/// Rows written per kind by a completed rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub documents: u64,
    pub media: u64,
    pub members: u64,
}

impl RebuildReport {
    pub fn total(&self) -> u64 {
        self.documents + self.media + self.members
    }

    pub fn add(&mut self, kind: NodeObjectType, rows: u64) {
        match kind {
            NodeObjectType::Document => self.documents += rows,
            NodeObjectType::Media => self.media += rows,
            NodeObjectType::Member => self.members += rows,
        }
    }
}

/// Durable, denormalized cache rows derived from the canonical store.
///
/// At most one row exists per (node id, preview flag). Reads of an unknown,
/// trashed or (outside preview) unpublished node return `Ok(None)`.
#[async_trait]
pub trait DatabaseCacheRepository: Send + Sync {
    async fn get_content_source(
        &self,
        id: i32,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError>;

    async fn get_content_source_by_key(
        &self,
        key: Uuid,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError>;

    async fn get_media_source(&self, id: i32) -> Result<Option<ContentCacheNode>, RepoError>;

    async fn get_media_source_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<ContentCacheNode>, RepoError>;

    async fn get_member_source(&self, id: i32) -> Result<Option<ContentCacheNode>, RepoError>;

    async fn get_member_source_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<ContentCacheNode>, RepoError>;

    /// Documents of the given content types; published documents yield their
    /// published variant, the rest their draft.
    async fn get_content_by_content_type_id(
        &self,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError>;

    async fn get_media_by_content_type_id(
        &self,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError>;

    /// Upsert the row for `node`. Drafts write the preview row; a non-draft
    /// node writes or removes the published row depending on `state`.
    async fn refresh_content(
        &self,
        node: &ContentCacheNode,
        state: PublishedState,
    ) -> Result<(), RepoError>;

    async fn refresh_media(&self, node: &ContentCacheNode) -> Result<(), RepoError>;

    async fn refresh_member(&self, node: &ContentCacheNode) -> Result<(), RepoError>;

    /// Remove every row of the node. Deleting an absent node is not an error.
    async fn delete_content_item(&self, id: i32) -> Result<(), RepoError>;

    /// Regenerate rows from the canonical store. Either every selected row is
    /// replaced or, on failure or cancellation, none are.
    async fn rebuild(
        &self,
        scopes: &RebuildScopes,
        cancel: &CancelToken,
    ) -> Result<RebuildReport, RepoError>;

    async fn verify_content_db_cache(&self) -> Result<bool, RepoError>;

    async fn verify_media_db_cache(&self) -> Result<bool, RepoError>;

    async fn verify_member_db_cache(&self) -> Result<bool, RepoError>;
}

/// Source of flat tree rows for navigation hydration.
#[async_trait]
pub trait NavigationRepo: Send + Sync {
    async fn navigation_models(
        &self,
        object_type: NodeObjectType,
        trashed: bool,
    ) -> Result<Vec<NavigationModel>, RepoError>;
}
