//! Postgres-backed repository implementations.

mod cache_rows;
mod navigation;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;
use std::time::Duration;

use sqlx::{
    Postgres, QueryBuilder, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::serialization::{ContentCacheDataSerializer, JsonCacheDataSerializer};
use crate::domain::scope::ContentTypeScope;

const DEFAULT_PAGE_SIZE: i64 = 500;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
    serializer: Arc<dyn ContentCacheDataSerializer>,
    page_size: i64,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            serializer: Arc::new(JsonCacheDataSerializer),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Number of canonical items read per rebuild page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = i64::try_from(page_size.max(1)).unwrap_or(DEFAULT_PAGE_SIZE);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    fn apply_content_type_scope<'q>(
        qb: &mut QueryBuilder<'q, Postgres>,
        scope: &ContentTypeScope,
    ) {
        if let Some(ids) = scope.ids() {
            qb.push(" AND n.content_type_id = ANY(");
            qb.push_bind(ids.to_vec());
            qb.push(")");
        }
    }
}
