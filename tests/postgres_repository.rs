use std::collections::BTreeMap;
use std::sync::Arc;

use nucache::application::cancel::{CancelSource, CancelToken};
use nucache::application::repos::{DatabaseCacheRepository, NavigationRepo, RepoError};
use nucache::cache::CacheConfig;
use nucache::domain::content::{ContentCacheNode, ContentData};
use nucache::domain::scope::{ContentTypeScope, RebuildScopes};
use nucache::domain::types::{NodeObjectType, PublishedState};
use nucache::infra::bootstrap::start_with;
use nucache::infra::db::PostgresRepositories;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

const PAGE_TYPE: i32 = 10;
const IMAGE_TYPE: i32 = 20;
const MEMBER_TYPE: i32 = 30;

fn key(id: i32) -> Uuid {
    Uuid::from_u128(0xC000 + id as u128)
}

fn content(name: &str, published: bool) -> ContentData {
    ContentData {
        name: name.to_string(),
        url_segment: Some(name.to_lowercase().replace(' ', "-")),
        version_id: 1,
        version_date: OffsetDateTime::UNIX_EPOCH,
        writer_id: -1,
        template_id: None,
        published,
        properties: BTreeMap::new(),
        culture_infos: BTreeMap::new(),
    }
}

struct Seed {
    id: i32,
    object_type: NodeObjectType,
    parent_id: Option<i32>,
    path: &'static str,
    sort_order: i32,
    content_type_id: i32,
    published: bool,
}

async fn insert_content_type(pool: &PgPool, id: i32, alias: &str, object_type: NodeObjectType) {
    sqlx::query("INSERT INTO content_types (id, key, alias, object_type) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(Uuid::from_u128(id as u128))
        .bind(alias)
        .bind(object_type)
        .execute(pool)
        .await
        .expect("content type should insert");
}

async fn insert_node(pool: &PgPool, seed: Seed) {
    let level = seed.path.matches(',').count() as i32;
    sqlx::query(
        "INSERT INTO content_nodes \
         (id, key, object_type, parent_id, level, path, sort_order, content_type_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(seed.id)
    .bind(key(seed.id))
    .bind(seed.object_type)
    .bind(seed.parent_id)
    .bind(level)
    .bind(seed.path)
    .bind(seed.sort_order)
    .bind(seed.content_type_id)
    .execute(pool)
    .await
    .expect("node should insert");

    let name = format!("Node {}", seed.id);
    let edit = serde_json::to_value(content(&name, false)).expect("edit data");
    let published = seed
        .published
        .then(|| serde_json::to_value(content(&name, true)).expect("published data"));
    sqlx::query(
        "INSERT INTO content_versions (node_id, published, edit_data, pub_data) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(seed.id)
    .bind(seed.published)
    .bind(edit)
    .bind(published)
    .execute(pool)
    .await
    .expect("version should insert");
}

/// Home (1) with a published child (2) and a draft child (3); one image
/// and one member.
async fn seed(pool: &PgPool) {
    insert_content_type(pool, PAGE_TYPE, "page", NodeObjectType::Document).await;
    insert_content_type(pool, IMAGE_TYPE, "image", NodeObjectType::Media).await;
    insert_content_type(pool, MEMBER_TYPE, "member", NodeObjectType::Member).await;

    for node in [
        Seed {
            id: 1,
            object_type: NodeObjectType::Document,
            parent_id: None,
            path: "-1,1",
            sort_order: 0,
            content_type_id: PAGE_TYPE,
            published: true,
        },
        Seed {
            id: 2,
            object_type: NodeObjectType::Document,
            parent_id: Some(1),
            path: "-1,1,2",
            sort_order: 1,
            content_type_id: PAGE_TYPE,
            published: true,
        },
        Seed {
            id: 3,
            object_type: NodeObjectType::Document,
            parent_id: Some(1),
            path: "-1,1,3",
            sort_order: 0,
            content_type_id: PAGE_TYPE,
            published: false,
        },
        Seed {
            id: 10,
            object_type: NodeObjectType::Media,
            parent_id: None,
            path: "-1,10",
            sort_order: 0,
            content_type_id: IMAGE_TYPE,
            published: false,
        },
        Seed {
            id: 20,
            object_type: NodeObjectType::Member,
            parent_id: None,
            path: "-1,20",
            sort_order: 0,
            content_type_id: MEMBER_TYPE,
            published: false,
        },
    ] {
        insert_node(pool, node).await;
    }
}

async fn rebuilt(pool: PgPool) -> PostgresRepositories {
    seed(&pool).await;
    let repo = PostgresRepositories::new(pool).with_page_size(1);
    repo.rebuild(&RebuildScopes::all(), &CancelToken::never())
        .await
        .expect("rebuild should succeed");
    repo
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn rebuild_writes_rows_per_variant_and_verifies(pool: PgPool) {
    seed(&pool).await;
    let repo = PostgresRepositories::new(pool).with_page_size(1);
    assert!(!repo.verify_content_db_cache().await.unwrap());
    assert!(!repo.verify_media_db_cache().await.unwrap());

    let report = repo
        .rebuild(&RebuildScopes::all(), &CancelToken::never())
        .await
        .unwrap();

    // Two published documents own two rows each; the draft owns one.
    assert_eq!(report.documents, 5);
    assert_eq!(report.media, 1);
    assert_eq!(report.members, 1);
    assert!(repo.verify_content_db_cache().await.unwrap());
    assert!(repo.verify_media_db_cache().await.unwrap());
    assert!(repo.verify_member_db_cache().await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn cancelled_rebuild_leaves_rows_untouched(pool: PgPool) {
    seed(&pool).await;
    let repo = PostgresRepositories::new(pool);
    let source = CancelSource::new();
    source.cancel();

    let err = repo
        .rebuild(&RebuildScopes::all(), &source.token())
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::Cancelled));
    assert!(!repo.verify_member_db_cache().await.unwrap());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn sources_resolve_by_id_key_and_preview(pool: PgPool) {
    let repo = rebuilt(pool).await;

    let published = repo.get_content_source(2, false).await.unwrap().unwrap();
    assert!(!published.is_draft);
    assert_eq!(published.parent_key, Some(key(1)));
    assert_eq!(published.content_type_key, Uuid::from_u128(PAGE_TYPE as u128));
    assert!(published.data.published);

    assert_eq!(repo.get_content_source(3, false).await.unwrap(), None);
    let draft = repo
        .get_content_source_by_key(key(3), true)
        .await
        .unwrap()
        .unwrap();
    assert!(draft.is_draft);
    assert_eq!(draft.data.name, "Node 3");

    assert_eq!(repo.get_media_source_by_key(key(10)).await.unwrap().unwrap().id, 10);
    assert_eq!(repo.get_member_source(20).await.unwrap().unwrap().key, key(20));
    assert_eq!(repo.get_member_source_by_key(key(20)).await.unwrap().unwrap().id, 20);
    assert_eq!(repo.get_media_source(20).await.unwrap(), None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn refresh_overwrites_and_unpublish_removes(pool: PgPool) {
    let repo = rebuilt(pool).await;
    let mut node: ContentCacheNode = repo.get_content_source(2, false).await.unwrap().unwrap();
    node.data.name = "Renamed".to_string();

    repo.refresh_content(&node, PublishedState::Published)
        .await
        .unwrap();
    assert_eq!(
        repo.get_content_source(2, false)
            .await
            .unwrap()
            .unwrap()
            .data
            .name,
        "Renamed"
    );

    repo.refresh_content(&node, PublishedState::Unpublishing)
        .await
        .unwrap();
    assert_eq!(repo.get_content_source(2, false).await.unwrap(), None);
    assert!(repo.get_content_source(2, true).await.unwrap().is_some());

    repo.delete_content_item(2).await.unwrap();
    assert_eq!(repo.get_content_source(2, true).await.unwrap(), None);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn content_type_scope_selects_current_variant(pool: PgPool) {
    let repo = rebuilt(pool).await;

    let nodes = repo
        .get_content_by_content_type_id(&ContentTypeScope::only([PAGE_TYPE]))
        .await
        .unwrap();
    let variants: Vec<(i32, bool)> = nodes.iter().map(|n| (n.id, n.is_draft)).collect();
    assert_eq!(variants, vec![(1, false), (2, false), (3, true)]);

    assert!(
        repo.get_media_by_content_type_id(&ContentTypeScope::none())
            .await
            .unwrap()
            .is_empty()
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn navigation_models_split_main_tree_and_bin(pool: PgPool) {
    seed(&pool).await;
    sqlx::query("UPDATE content_nodes SET trashed = true WHERE id = 3")
        .execute(&pool)
        .await
        .unwrap();
    let repo = PostgresRepositories::new(pool);

    let main: Vec<i32> = repo
        .navigation_models(NodeObjectType::Document, false)
        .await
        .unwrap()
        .into_iter()
        .map(|model| model.id)
        .collect();
    assert_eq!(main, vec![1, 2]);

    let bin = repo
        .navigation_models(NodeObjectType::Document, true)
        .await
        .unwrap();
    assert_eq!(bin.len(), 1);
    assert_eq!(bin[0].parent_id, Some(1));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn hybrid_cache_runs_over_postgres(pool: PgPool) {
    seed(&pool).await;
    let repo = Arc::new(PostgresRepositories::new(pool));
    let runtime = start_with(
        CacheConfig {
            auto_consume_interval_ms: 0,
            ..Default::default()
        },
        Arc::clone(&repo) as Arc<dyn DatabaseCacheRepository>,
        repo as Arc<dyn NavigationRepo>,
    )
    .await
    .expect("startup repairs the empty table");

    let home = runtime.cache.get_content(1, false).await.unwrap();
    assert_eq!(home.data.name, "Node 1");
    assert_eq!(
        runtime.cache.documents().children(key(1)).await.unwrap(),
        vec![key(3), key(2)]
    );

    let mut moved = (*runtime.cache.get_content(2, true).await.unwrap()).clone();
    moved.sort_order = -5;
    runtime
        .trigger
        .content_refreshed(moved, PublishedState::Unpublished)
        .await
        .unwrap();
    assert_eq!(
        runtime.cache.documents().children(key(1)).await.unwrap(),
        vec![key(2), key(3)]
    );
}
