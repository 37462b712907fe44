use parquedb_shard::engine::{ShardConfig, ShardEngine, WriteOptions};
use parquedb_shard::shard_connection::ShardConnection;
use parquedb_shard::sql_migration::execute_migration;
use parquedb_types::blob_storage::BlobStorage;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

async fn test_engine() -> ShardEngine {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("opening in-memory db");
    execute_migration(pool.clone()).await.expect("migration");
    let connection = ShardConnection::new(pool, Arc::new(BlobStorage::in_memory()));
    ShardEngine::new(connection, ShardConfig::default())
}

fn bodies(count: usize) -> Vec<serde_json::Value> {
    (0..count)
        .map(|i| serde_json::json!({"$type": "Post", "index": i}))
        .collect()
}

#[tokio::test]
async fn test_only_one_transaction_at_a_time() {
    let engine = test_engine().await;
    let txn = engine.begin_transaction().await.unwrap();
    assert!(!txn.is_empty());
    let err = engine.begin_transaction().await.unwrap_err();
    assert_eq!(err.status_code(), 409);
    engine.rollback_transaction().await.unwrap();
    // closed: a new transaction can open
    engine.begin_transaction().await.unwrap();
}

#[tokio::test]
async fn test_commit_makes_staged_bulk_visible() {
    let engine = test_engine().await;
    engine.begin_transaction().await.unwrap();
    let entities = engine
        .create_many("posts", &bodies(5), &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(entities.len(), 5);

    // metadata stays invisible until commit, but reads inside the
    // transaction already see the staged rows
    assert!(engine.get_pending_row_groups("posts").await.unwrap().is_empty());
    let inside = engine.get("posts", "1", false).await.unwrap();
    assert!(inside.is_some());

    engine.commit_transaction().await.unwrap();
    let groups = engine.get_pending_row_groups("posts").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].row_count, 5);
}

#[tokio::test]
async fn test_rollback_discards_buffer_and_pending() {
    let engine = test_engine().await;
    engine.begin_transaction().await.unwrap();
    engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &WriteOptions::default())
        .await
        .unwrap();
    engine
        .create_many("posts", &bodies(5), &WriteOptions::default())
        .await
        .unwrap();
    engine.rollback_transaction().await.unwrap();

    // buffered growth and staged metadata are gone
    assert!(engine.get("posts", "1", false).await.unwrap().is_none());
    assert!(engine.get_pending_row_groups("posts").await.unwrap().is_empty());
    // the uploaded pending objects were deleted too
    assert!(
        engine
            .connection()
            .blob_storage
            .list("data/posts/pending/")
            .await
            .unwrap()
            .is_empty()
    );

    // counters rewound: the next create reuses the first sequence value
    let entity = engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(entity.id.to_string(), "posts/1");
}

#[tokio::test]
async fn test_flush_refused_inside_transaction() {
    let engine = test_engine().await;
    engine.begin_transaction().await.unwrap();
    engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &WriteOptions::default())
        .await
        .unwrap();
    let err = engine.flush_ns_event_batch("posts").await.unwrap_err();
    assert_eq!(err.status_code(), 409);
    engine.commit_transaction().await.unwrap();
    engine.flush_ns_event_batch("posts").await.unwrap();
    assert_eq!(engine.get_wal_batches("posts").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_commit_without_transaction_is_conflict() {
    let engine = test_engine().await;
    assert_eq!(engine.commit_transaction().await.unwrap_err().status_code(), 409);
    assert_eq!(engine.rollback_transaction().await.unwrap_err().status_code(), 409);
}
