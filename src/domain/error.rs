use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("navigation node `{key}` not found")]
    NodeNotFound { key: Uuid },
    #[error("navigation node `{key}` already exists")]
    AlreadyExists { key: Uuid },
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("navigation structure inconsistent: {message}")]
    StructuralInconsistency { message: String },
}

impl DomainError {
    pub fn node_not_found(key: Uuid) -> Self {
        Self::NodeNotFound { key }
    }

    pub fn already_exists(key: Uuid) -> Self {
        Self::AlreadyExists { key }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::StructuralInconsistency {
            message: message.into(),
        }
    }
}
