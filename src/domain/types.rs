use serde::{Deserialize, Serialize};

/// Kind of item a cache row or navigation tree belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "node_object_type", rename_all = "snake_case")]
pub enum NodeObjectType {
    Document,
    Media,
    Member,
}

impl NodeObjectType {
    pub const ALL: [NodeObjectType; 3] = [Self::Document, Self::Media, Self::Member];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Media => "media",
            Self::Member => "member",
        }
    }
}

/// Publication transition carried alongside a document refresh.
///
/// `Publishing` and `Unpublishing` describe the write in progress, while
/// `Published` and `Unpublished` describe a steady state. Both halves of
/// each pair have the same effect on the published cache row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishedState {
    Published,
    Unpublished,
    Publishing,
    Unpublishing,
}

impl PublishedState {
    /// Whether a non-draft document in this state owns a published row.
    pub fn keeps_published_row(self) -> bool {
        matches!(self, Self::Published | Self::Publishing)
    }
}
