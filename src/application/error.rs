use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::application::repos::RepoError;
use crate::domain::error::DomainError;
use crate::domain::types::NodeObjectType;

/// How a caller addressed a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Id(i32),
    Key(Uuid),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{} `{node}` not found", .object_type.as_str())]
    NotFound {
        object_type: NodeObjectType,
        node: NodeRef,
    },
    #[error("navigation structure inconsistent")]
    StructuralInconsistency(#[source] DomainError),
    #[error("cache repository unavailable")]
    RepositoryUnavailable(#[source] RepoError),
    #[error("cache rebuild failed")]
    RebuildFailed(#[source] RepoError),
    #[error("cache verification failed")]
    VerifyFailed(#[source] RepoError),
    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn not_found(object_type: NodeObjectType, node: NodeRef) -> Self {
        Self::NotFound { object_type, node }
    }

    /// Map a failure from a read-side navigation query. Unknown keys are an
    /// ordinary miss; anything else means the structure is broken.
    pub fn navigation_lookup(object_type: NodeObjectType, err: DomainError) -> Self {
        match err {
            DomainError::NodeNotFound { key } => Self::not_found(object_type, NodeRef::Key(key)),
            other => Self::StructuralInconsistency(other),
        }
    }

    pub fn repository(err: RepoError) -> Self {
        match err {
            RepoError::Cancelled => Self::Cancelled,
            other => Self::RepositoryUnavailable(other),
        }
    }

    pub fn rebuild(err: RepoError) -> Self {
        match err {
            RepoError::Cancelled => Self::Cancelled,
            other => Self::RebuildFailed(other),
        }
    }

    pub fn verify(err: RepoError) -> Self {
        match err {
            RepoError::Cancelled => Self::Cancelled,
            other => Self::VerifyFailed(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the repository could not be reached; the same call may
    /// succeed later. Rejected input is not retryable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable(err) if err.is_transient())
    }
}

impl From<DomainError> for CacheError {
    fn from(err: DomainError) -> Self {
        Self::StructuralInconsistency(err)
    }
}

/// Messages of `error` and each of its sources, outermost first.
pub fn error_chain(error: &dyn StdError) -> Vec<String> {
    let mut messages = vec![error.to_string()];
    let mut current = error.source();
    while let Some(inner) = current {
        messages.push(inner.to_string());
        current = inner.source();
    }
    messages
}
