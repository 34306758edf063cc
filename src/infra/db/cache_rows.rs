use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    application::{
        cancel::CancelToken,
        repos::{DatabaseCacheRepository, RebuildReport, RepoError, ensure_node_kind},
    },
    domain::{
        content::{ContentCacheDataModel, ContentCacheNode, ContentData, NodeShape},
        scope::{ContentTypeScope, RebuildScopes},
        types::{NodeObjectType, PublishedState},
    },
};

use super::{PostgresRepositories, map_sqlx_error};

// `content_nu.published` is the inverse of the preview flag.
const SOURCE_COLUMNS: &str = "SELECT n.id, n.key, n.object_type, n.content_type_id, \
     ct.key AS content_type_key, p.key AS parent_key, n.sort_order, n.creator_id, \
     n.created_at, nu.published AS row_published, nu.data \
     FROM content_nodes n \
     INNER JOIN content_types ct ON ct.id = n.content_type_id \
     LEFT JOIN content_nodes p ON p.id = n.parent_id ";

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: i32,
    key: Uuid,
    object_type: NodeObjectType,
    content_type_id: i32,
    content_type_key: Uuid,
    parent_key: Option<Uuid>,
    sort_order: i32,
    creator_id: i32,
    created_at: OffsetDateTime,
    row_published: Option<bool>,
    data: Option<Value>,
}

impl SourceRow {
    fn into_parts(self) -> (NodeShape, Option<(bool, Value)>) {
        let payload = self
            .row_published
            .zip(self.data)
            .map(|(published, data)| (!published, data));
        let shape = NodeShape {
            id: self.id,
            key: self.key,
            object_type: self.object_type,
            content_type_id: self.content_type_id,
            content_type_key: self.content_type_key,
            parent_key: self.parent_key,
            sort_order: self.sort_order,
            creator_id: self.creator_id,
            created_at: self.created_at,
        };
        (shape, payload)
    }
}

#[derive(sqlx::FromRow)]
struct CanonicalRow {
    id: i32,
    published: bool,
    edit_data: Value,
    pub_data: Option<Value>,
}

enum SourceKey {
    Id(i32),
    Key(Uuid),
}

impl PostgresRepositories {
    async fn load_source(
        &self,
        object_type: NodeObjectType,
        source: SourceKey,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new(SOURCE_COLUMNS);
        qb.push("LEFT JOIN content_nu nu ON nu.node_id = n.id AND nu.published = ");
        qb.push_bind(!preview);
        qb.push(" WHERE n.trashed = false AND n.object_type = ");
        qb.push_bind(object_type);
        match source {
            SourceKey::Id(id) => {
                qb.push(" AND n.id = ");
                qb.push_bind(id);
            }
            SourceKey::Key(key) => {
                qb.push(" AND n.key = ");
                qb.push_bind(key);
            }
        }

        let row = qb
            .build_query_as::<SourceRow>()
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let (shape, payload) = row.into_parts();
        let Some((row_preview, data)) = payload else {
            if preview || object_type != NodeObjectType::Document {
                warn!(
                    node_id = shape.id,
                    object_type = object_type.as_str(),
                    "Cache row missing for live item; a rebuild is advisable"
                );
            }
            return Ok(None);
        };

        let model = self.serializer.deserialize(shape.id, &data)?;
        Ok(Some(shape.into_node(row_preview, model)))
    }

    async fn load_by_content_type(
        &self,
        object_type: NodeObjectType,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Postgres>::new(SOURCE_COLUMNS);
        qb.push(
            "INNER JOIN content_versions v ON v.node_id = n.id \
             INNER JOIN content_nu nu ON nu.node_id = n.id AND nu.published = \
             (CASE WHEN n.object_type = 'document'::node_object_type THEN v.published ELSE true END) \
             WHERE n.trashed = false AND n.object_type = ",
        );
        qb.push_bind(object_type);
        Self::apply_content_type_scope(&mut qb, scope);
        qb.push(" ORDER BY n.path, n.id");

        let rows = qb
            .build_query_as::<SourceRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in rows {
            let (shape, payload) = row.into_parts();
            if let Some((preview, data)) = payload {
                let model = self.serializer.deserialize(shape.id, &data)?;
                nodes.push(shape.into_node(preview, model));
            }
        }
        Ok(nodes)
    }

    async fn upsert_row(&self, node: &ContentCacheNode, preview: bool) -> Result<(), RepoError> {
        let data = self.serializer.serialize(&node.to_data_model())?;
        sqlx::query(
            "INSERT INTO content_nu (node_id, published, data, rv) VALUES ($1, $2, $3, 0) \
             ON CONFLICT (node_id, published) DO UPDATE \
             SET data = EXCLUDED.data, rv = content_nu.rv + 1",
        )
        .bind(node.id)
        .bind(!preview)
        .bind(data)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn verify_single_row_kind(&self, object_type: NodeObjectType) -> Result<bool, RepoError> {
        let broken: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM content_nodes n \
             LEFT JOIN content_nu r ON r.node_id = n.id AND r.published = true \
             LEFT JOIN content_nu d ON d.node_id = n.id AND d.published = false \
             WHERE n.object_type = $1 AND (r.node_id IS NULL OR d.node_id IS NOT NULL)",
        )
        .bind(object_type)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(broken == 0)
    }
}

fn decode_canonical(id: i32, value: Value) -> Result<ContentData, RepoError> {
    serde_json::from_value(value)
        .map_err(|err| RepoError::serialization(format!("canonical data of node {id}: {err}")))
}

#[async_trait]
impl DatabaseCacheRepository for PostgresRepositories {
    async fn get_content_source(
        &self,
        id: i32,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.load_source(NodeObjectType::Document, SourceKey::Id(id), preview)
            .await
    }

    async fn get_content_source_by_key(
        &self,
        key: Uuid,
        preview: bool,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.load_source(NodeObjectType::Document, SourceKey::Key(key), preview)
            .await
    }

    async fn get_media_source(&self, id: i32) -> Result<Option<ContentCacheNode>, RepoError> {
        self.load_source(NodeObjectType::Media, SourceKey::Id(id), false)
            .await
    }

    async fn get_media_source_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.load_source(NodeObjectType::Media, SourceKey::Key(key), false)
            .await
    }

    async fn get_member_source(&self, id: i32) -> Result<Option<ContentCacheNode>, RepoError> {
        self.load_source(NodeObjectType::Member, SourceKey::Id(id), false)
            .await
    }

    async fn get_member_source_by_key(
        &self,
        key: Uuid,
    ) -> Result<Option<ContentCacheNode>, RepoError> {
        self.load_source(NodeObjectType::Member, SourceKey::Key(key), false)
            .await
    }

    async fn get_content_by_content_type_id(
        &self,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError> {
        self.load_by_content_type(NodeObjectType::Document, scope)
            .await
    }

    async fn get_media_by_content_type_id(
        &self,
        scope: &ContentTypeScope,
    ) -> Result<Vec<ContentCacheNode>, RepoError> {
        self.load_by_content_type(NodeObjectType::Media, scope)
            .await
    }

    async fn refresh_content(
        &self,
        node: &ContentCacheNode,
        state: PublishedState,
    ) -> Result<(), RepoError> {
        ensure_node_kind(node, NodeObjectType::Document)?;

        if node.is_draft {
            return self.upsert_row(node, true).await;
        }
        if state.keeps_published_row() {
            return self.upsert_row(node, false).await;
        }

        sqlx::query("DELETE FROM content_nu WHERE node_id = $1 AND published = true")
            .bind(node.id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn refresh_media(&self, node: &ContentCacheNode) -> Result<(), RepoError> {
        ensure_node_kind(node, NodeObjectType::Media)?;
        self.upsert_row(node, false).await
    }

    async fn refresh_member(&self, node: &ContentCacheNode) -> Result<(), RepoError> {
        ensure_node_kind(node, NodeObjectType::Member)?;
        self.upsert_row(node, false).await
    }

    async fn delete_content_item(&self, id: i32) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM content_nu WHERE node_id = $1")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn rebuild(
        &self,
        scopes: &RebuildScopes,
        cancel: &CancelToken,
    ) -> Result<RebuildReport, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut report = RebuildReport::default();
        let mut waiter = cancel.clone();

        for object_type in NodeObjectType::ALL {
            let scope = scopes.for_kind(object_type);
            if scope.is_empty() {
                continue;
            }

            let mut delete = QueryBuilder::<Postgres>::new(
                "DELETE FROM content_nu nu USING content_nodes n \
                 WHERE n.id = nu.node_id AND n.object_type = ",
            );
            delete.push_bind(object_type);
            Self::apply_content_type_scope(&mut delete, scope);
            delete
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            let mut offset: i64 = 0;
            loop {
                if cancel.is_cancelled() {
                    tx.rollback().await.map_err(map_sqlx_error)?;
                    debug!(
                        object_type = object_type.as_str(),
                        offset, "Rebuild cancelled; transaction rolled back"
                    );
                    return Err(RepoError::Cancelled);
                }

                let mut page = QueryBuilder::<Postgres>::new(
                    "SELECT n.id, v.published, v.edit_data, v.pub_data FROM content_nodes n \
                     INNER JOIN content_versions v ON v.node_id = n.id \
                     WHERE n.object_type = ",
                );
                page.push_bind(object_type);
                Self::apply_content_type_scope(&mut page, scope);
                page.push(" ORDER BY n.path, n.id LIMIT ");
                page.push_bind(self.page_size);
                page.push(" OFFSET ");
                page.push_bind(offset);

                let fetched_page = tokio::select! {
                    rows = page.build_query_as::<CanonicalRow>().fetch_all(&mut *tx) => Some(rows),
                    () = waiter.cancelled() => None,
                };
                let Some(canonical) = fetched_page else {
                    tx.rollback().await.map_err(map_sqlx_error)?;
                    debug!(
                        object_type = object_type.as_str(),
                        offset, "Rebuild cancelled mid-page; transaction rolled back"
                    );
                    return Err(RepoError::Cancelled);
                };
                let canonical = canonical.map_err(map_sqlx_error)?;
                if canonical.is_empty() {
                    break;
                }
                let fetched = canonical.len() as i64;

                let mut rows: Vec<(i32, bool, Value)> = Vec::with_capacity(canonical.len() * 2);
                for item in canonical {
                    let edited = decode_canonical(item.id, item.edit_data)?;
                    let published = match (item.published, item.pub_data) {
                        (true, Some(data)) => Some(decode_canonical(item.id, data)?),
                        _ => None,
                    };
                    for (preview, model) in
                        ContentCacheDataModel::canonical_rows(object_type, edited, published)
                    {
                        rows.push((item.id, !preview, self.serializer.serialize(&model)?));
                    }
                }
                report.add(object_type, rows.len() as u64);

                let mut insert =
                    QueryBuilder::<Postgres>::new("INSERT INTO content_nu (node_id, published, data, rv) ");
                insert.push_values(rows, |mut b, (node_id, published, data)| {
                    b.push_bind(node_id)
                        .push_bind(published)
                        .push_bind(data)
                        .push_bind(0_i64);
                });
                insert
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;

                if fetched < self.page_size {
                    break;
                }
                offset += fetched;
            }
        }

        if cancel.is_cancelled() {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Err(RepoError::Cancelled);
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(report)
    }

    async fn verify_content_db_cache(&self) -> Result<bool, RepoError> {
        let broken: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM content_nodes n \
             INNER JOIN content_versions v ON v.node_id = n.id \
             LEFT JOIN content_nu e ON e.node_id = n.id AND e.published = false \
             LEFT JOIN content_nu p ON p.node_id = n.id AND p.published = true \
             WHERE n.object_type = 'document'::node_object_type \
             AND (e.node_id IS NULL \
                  OR (v.published AND p.node_id IS NULL) \
                  OR (NOT v.published AND p.node_id IS NOT NULL))",
        )
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(broken == 0)
    }

    async fn verify_media_db_cache(&self) -> Result<bool, RepoError> {
        self.verify_single_row_kind(NodeObjectType::Media).await
    }

    async fn verify_member_db_cache(&self) -> Result<bool, RepoError> {
        self.verify_single_row_kind(NodeObjectType::Member).await
    }
}
