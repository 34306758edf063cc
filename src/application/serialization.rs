//! Encoding of cache row payloads.

use serde::Deserialize;
use serde_json::Value;

use crate::application::repos::RepoError;
use crate::domain::content::ContentCacheDataModel;

/// Converts between row payloads and their stored representation.
pub trait ContentCacheDataSerializer: Send + Sync {
    fn serialize(&self, model: &ContentCacheDataModel) -> Result<Value, RepoError>;

    fn deserialize(&self, node_id: i32, stored: &Value) -> Result<ContentCacheDataModel, RepoError>;
}

/// Stores payloads as JSON documents (`jsonb` in Postgres).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCacheDataSerializer;

impl ContentCacheDataSerializer for JsonCacheDataSerializer {
    fn serialize(&self, model: &ContentCacheDataModel) -> Result<Value, RepoError> {
        serde_json::to_value(model).map_err(RepoError::serialization)
    }

    fn deserialize(&self, node_id: i32, stored: &Value) -> Result<ContentCacheDataModel, RepoError> {
        ContentCacheDataModel::deserialize(stored).map_err(|err| {
            RepoError::serialization(format!("row for node {node_id}: {err}"))
        })
    }
}
