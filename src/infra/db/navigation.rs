use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    application::repos::{NavigationRepo, RepoError},
    domain::{navigation::NavigationModel, types::NodeObjectType},
};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct NavigationRow {
    id: i32,
    key: Uuid,
    parent_id: Option<i32>,
    sort_order: i32,
    content_type_key: Uuid,
}

impl From<NavigationRow> for NavigationModel {
    fn from(row: NavigationRow) -> Self {
        Self {
            id: row.id,
            key: row.key,
            parent_id: row.parent_id,
            sort_order: row.sort_order,
            content_type_key: row.content_type_key,
        }
    }
}

#[async_trait]
impl NavigationRepo for PostgresRepositories {
    async fn navigation_models(
        &self,
        object_type: NodeObjectType,
        trashed: bool,
    ) -> Result<Vec<NavigationModel>, RepoError> {
        let rows = sqlx::query_as::<_, NavigationRow>(
            "SELECT n.id, n.key, n.parent_id, n.sort_order, ct.key AS content_type_key \
             FROM content_nodes n \
             INNER JOIN content_types ct ON ct.id = n.content_type_id \
             WHERE n.object_type = $1 AND n.trashed = $2 \
             ORDER BY n.level, n.parent_id NULLS FIRST, n.sort_order, n.id",
        )
        .bind(object_type)
        .bind(trashed)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(NavigationModel::from).collect())
    }
}
