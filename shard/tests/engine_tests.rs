use parquedb_shard::engine::{ShardConfig, ShardEngine, WriteOptions};
use parquedb_shard::relationships::Direction;
use parquedb_shard::shard_connection::{ShardConnection, open_shard_db};
use parquedb_shard::sql_migration::execute_migration;
use parquedb_types::blob_storage::BlobStorage;
use parquedb_types::error::CoreError;
use parquedb_types::mutation::Mutation;
use parquedb_types::short_id::decode_short_id;
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

fn opts() -> WriteOptions {
    WriteOptions {
        actor: Some("tester".into()),
        ..WriteOptions::default()
    }
}

fn mutation(json: serde_json::Value) -> Mutation {
    Mutation::from_json(&json).expect("parsing mutation")
}

#[tokio::test]
async fn test_create_then_get() {
    let engine = test_engine().await;
    let entity = engine
        .create(
            "posts",
            &serde_json::json!({"$type": "Post", "name": "First", "views": 0}),
            &opts(),
        )
        .await
        .unwrap();
    assert_eq!(entity.id.to_string(), "posts/1");
    assert!(entity.id.short_id.len() <= 10);
    assert_eq!(entity.version, 1);
    assert_eq!(entity.created_by.as_deref(), Some("tester"));

    let fetched = engine.get("posts", "1", false).await.unwrap().unwrap();
    assert_eq!(fetched.version, 1);
    assert_eq!(fetched.name.as_deref(), Some("First"));
    assert_eq!(fetched.attributes.get::<i64>("views").unwrap(), 0);
    assert_eq!(fetched.entity_type, "Post");
}

#[tokio::test]
async fn test_missing_type_is_validation() {
    let engine = test_engine().await;
    let err = engine
        .create("posts", &serde_json::json!({"title": "x"}), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_event_sourced_update_delete() {
    let engine = test_engine().await;
    engine
        .create("posts", &serde_json::json!({"$type": "Post", "views": 0}), &opts())
        .await
        .unwrap();
    for delta in [1i64, 2, 3] {
        engine
            .update(
                "posts",
                "1",
                &mutation(serde_json::json!({"$inc": {"views": delta}})),
                &opts(),
            )
            .await
            .unwrap();
    }
    engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$set": {"title": "X"}})),
            &opts(),
        )
        .await
        .unwrap();
    assert!(engine.delete("posts", "1", &opts()).await.unwrap());

    // standard reads no longer see the entity
    assert!(engine.get("posts", "1", false).await.unwrap().is_none());

    // includeDeleted recovers the last state plus the tombstone
    let entity = engine.get("posts", "1", true).await.unwrap().unwrap();
    assert_eq!(entity.version, 6);
    assert_eq!(entity.attributes.get::<i64>("views").unwrap(), 6);
    assert_eq!(entity.attributes.get::<std::sync::Arc<String>>("title").unwrap().as_str(), "X");
    assert!(entity.deleted_at.is_some());
    assert_eq!(entity.deleted_by.as_deref(), Some("tester"));
}

#[tokio::test]
async fn test_optimistic_concurrency() {
    let engine = test_engine().await;
    let created = engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &opts())
        .await
        .unwrap();
    assert_eq!(created.version, 1);

    let updated = engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$set": {"title": "a"}})),
            &WriteOptions {
                expected_version: Some(1),
                ..opts()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 2);

    let err = engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$set": {"title": "b"}})),
            &WriteOptions {
                expected_version: Some(1),
                ..opts()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::VersionMismatch { expected: 1, current: 2 }));

    // no event was appended by the refused write
    let entity = engine.get("posts", "1", false).await.unwrap().unwrap();
    assert_eq!(entity.version, 2);
    assert_eq!(
        entity
            .attributes
            .get::<std::sync::Arc<String>>("title")
            .unwrap()
            .as_str(),
        "a"
    );
}

#[tokio::test]
async fn test_update_missing_entity_is_not_found() {
    let engine = test_engine().await;
    let err = engine
        .update("posts", "zz", &mutation(serde_json::json!({})), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_empty_mutation_bumps_version() {
    let engine = test_engine().await;
    engine
        .create("posts", &serde_json::json!({"$type": "Post", "views": 1}), &opts())
        .await
        .unwrap();
    let updated = engine
        .update("posts", "1", &mutation(serde_json::json!({})), &opts())
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.attributes.get::<i64>("views").unwrap(), 1);
}

#[tokio::test]
async fn test_delete_missing_returns_false() {
    let engine = test_engine().await;
    assert!(!engine.delete("posts", "7", &opts()).await.unwrap());
}

#[tokio::test]
async fn test_wal_flush_is_one_row_per_batch() {
    let engine = test_engine().await;
    for i in 0..3 {
        engine
            .create("posts", &serde_json::json!({"$type": "Post", "index": i}), &opts())
            .await
            .unwrap();
    }
    engine.flush_ns_event_batch("posts").await.unwrap();

    let batches = engine.get_wal_batches("posts").await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].event_count, 3);
    assert_eq!(batches[0].last_seq - batches[0].first_seq + 1, 3);

    // flushed events still serve reads
    let entity = engine.get("posts", "2", false).await.unwrap().unwrap();
    assert_eq!(entity.attributes.get::<i64>("index").unwrap(), 1);

    // a batch wholly covered by up_to_seq is deleted
    let deleted = engine.delete_wal_batches("posts", 3).await.unwrap();
    assert_eq!(deleted, 1);
    assert!(engine.get_wal_batches("posts").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_bypass_then_read() {
    let engine = test_engine().await;
    let bodies: Vec<serde_json::Value> = (0..100)
        .map(|i| serde_json::json!({"$type": "Post", "index": i}))
        .collect();
    let entities = engine.create_many("posts", &bodies, &opts()).await.unwrap();
    assert_eq!(entities.len(), 100);

    // exactly one pending row group and one object at the recorded path
    let groups = engine.get_pending_row_groups("posts").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].row_count, 100);
    assert_eq!(groups[0].last_seq - groups[0].first_seq + 1, 100);
    let head = engine
        .connection()
        .blob_storage
        .head(&groups[0].path)
        .await
        .unwrap();
    assert!(head.is_some());

    // no WAL batches were buffered for the bulk write
    engine.flush_ns_event_batch("posts").await.unwrap();
    assert!(engine.get_wal_batches("posts").await.unwrap().is_empty());

    // each entity reads back with the input row's attributes
    for (i, entity) in entities.iter().enumerate() {
        let fetched = engine
            .get("posts", &entity.id.short_id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.attributes.get::<i64>("index").unwrap(), i as i64);
        assert_eq!(fetched.version, 1);
    }

    // bulk entities accept follow-up updates like any other
    let updated = engine
        .update(
            "posts",
            &entities[40].id.short_id,
            &mutation(serde_json::json!({"$inc": {"index": 1000}})),
            &opts(),
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.attributes.get::<i64>("index").unwrap(), 1040);
}

#[tokio::test]
async fn test_create_many_boundaries() {
    let engine = test_engine().await;

    // empty input: no events, no pending row groups
    let none = engine.create_many("posts", &[], &opts()).await.unwrap();
    assert!(none.is_empty());
    assert!(engine.get_pending_row_groups("posts").await.unwrap().is_empty());

    // below the threshold: WAL path, no pending row group
    let bodies: Vec<serde_json::Value> = (0..4)
        .map(|i| serde_json::json!({"$type": "Post", "index": i}))
        .collect();
    engine.create_many("posts", &bodies, &opts()).await.unwrap();
    assert!(engine.get_pending_row_groups("posts").await.unwrap().is_empty());

    // exactly the threshold: bulk bypass
    let bodies: Vec<serde_json::Value> = (0..5)
        .map(|i| serde_json::json!({"$type": "Post", "index": i}))
        .collect();
    engine.create_many("posts", &bodies, &opts()).await.unwrap();
    let groups = engine.get_pending_row_groups("posts").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].row_count, 5);
}

#[tokio::test]
async fn test_create_many_validates_all_before_writing() {
    let engine = test_engine().await;
    let bodies = vec![
        serde_json::json!({"$type": "Post", "index": 0}),
        serde_json::json!({"index": 1}),
    ];
    let err = engine.create_many("posts", &bodies, &opts()).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    // nothing was committed
    assert!(engine.get("posts", "1", false).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pending_promotion_and_deletion() {
    let engine = test_engine().await;
    let bodies: Vec<serde_json::Value> = (0..6)
        .map(|i| serde_json::json!({"$type": "Post", "index": i}))
        .collect();
    engine.create_many("posts", &bodies, &opts()).await.unwrap();

    let promoted = engine.flush_pending_to_committed("posts").await.unwrap();
    assert_eq!(promoted, 1);
    let groups = engine.get_pending_row_groups("posts").await.unwrap();
    assert!(groups[0].committed_at.is_some());
    // promoting again is a no-op
    assert_eq!(engine.flush_pending_to_committed("posts").await.unwrap(), 0);

    let path = groups[0].path.clone();
    let deleted = engine.delete_pending_row_groups("posts", groups[0].last_seq).await.unwrap();
    assert_eq!(deleted, 1);
    assert!(engine.get_pending_row_groups("posts").await.unwrap().is_empty());
    assert!(
        engine
            .connection()
            .blob_storage
            .head(&path)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_seq_uniqueness_across_paths() {
    let engine = test_engine().await;
    engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &opts())
        .await
        .unwrap();
    let bodies: Vec<serde_json::Value> = (0..7)
        .map(|i| serde_json::json!({"$type": "Post", "index": i}))
        .collect();
    engine.create_many("posts", &bodies, &opts()).await.unwrap();
    engine
        .update("posts", "1", &mutation(serde_json::json!({"$set": {"t": 1}})), &opts())
        .await
        .unwrap();

    let events = engine.get_events("posts", 0, 1000).await.unwrap();
    assert_eq!(events.len(), 9);
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted, "seq values are strictly increasing and unique");

    let after = engine.get_events("posts", 8, 1000).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].seq, 9);

    let limited = engine.get_events("posts", 0, 3).await.unwrap();
    assert_eq!(limited.len(), 3);
}

#[tokio::test]
async fn test_sequence_continuity_across_restart() {
    let db_path = std::env::temp_dir().join(format!(
        "parquedb-restart-test-{}.db",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&db_path);
    let db_uri = format!("sqlite://{}", db_path.display());

    let mut ids = vec![];
    {
        let pool = open_shard_db(&db_uri).await.unwrap();
        execute_migration(pool.clone()).await.unwrap();
        let engine = ShardEngine::new(
            ShardConnection::new(pool, Arc::new(BlobStorage::in_memory())),
            ShardConfig::default(),
        );
        for i in 0..5 {
            let entity = engine
                .create("posts", &serde_json::json!({"$type": "Post", "index": i}), &opts())
                .await
                .unwrap();
            ids.push(entity.id.short_id.clone());
        }
        engine.flush_all_ns_event_batches().await.unwrap();
        engine.connection().db_pool.close().await;
    }

    // recreate the shard by name: counters survive
    let pool = open_shard_db(&db_uri).await.unwrap();
    execute_migration(pool.clone()).await.unwrap();
    let engine = ShardEngine::new(
        ShardConnection::new(pool, Arc::new(BlobStorage::in_memory())),
        ShardConfig::default(),
    );
    for i in 5..10 {
        let entity = engine
            .create("posts", &serde_json::json!({"$type": "Post", "index": i}), &opts())
            .await
            .unwrap();
        ids.push(entity.id.short_id.clone());
    }

    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 10);
    assert_eq!(
        decode_short_id(&ids[5]).unwrap(),
        decode_short_id(&ids[4]).unwrap() + 1,
        "the sixth id is the successor of the fifth"
    );

    engine.connection().db_pool.close().await;
    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn test_relationships() {
    let engine = test_engine().await;
    engine
        .create("users", &serde_json::json!({"$type": "User", "name": "Alice"}), &opts())
        .await
        .unwrap();
    engine
        .create("posts", &serde_json::json!({"$type": "Post", "name": "Hello"}), &opts())
        .await
        .unwrap();

    engine.link("posts/1", "author", "users/1", &opts()).await.unwrap();

    let outbound = engine
        .get_relationships("posts", "1", Some("author"), Direction::Outbound)
        .await
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].to.to_string(), "users/1");
    assert_eq!(outbound[0].to_type.as_deref(), Some("User"));
    assert_eq!(outbound[0].to_name.as_deref(), Some("Alice"));
    assert_eq!(outbound[0].from_type.as_deref(), Some("Post"));

    let inbound = engine
        .get_relationships("users", "1", None, Direction::Inbound)
        .await
        .unwrap();
    assert_eq!(inbound.len(), 1);

    engine.unlink("posts/1", "author", "users/1", &opts()).await.unwrap();
    let outbound = engine
        .get_relationships("posts", "1", Some("author"), Direction::Outbound)
        .await
        .unwrap();
    assert!(outbound.is_empty());

    // re-linking revives the soft-deleted edge
    engine.link("posts/1", "author", "users/1", &opts()).await.unwrap();
    let outbound = engine
        .get_relationships("posts", "1", None, Direction::Any)
        .await
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert!(outbound[0].version > 1);
}

#[tokio::test]
async fn test_link_missing_endpoint_is_not_found() {
    let engine = test_engine().await;
    engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &opts())
        .await
        .unwrap();
    let err = engine
        .link("posts/1", "author", "users/9", &opts())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_inline_relationships_in_body() {
    let engine = test_engine().await;
    engine
        .create("users", &serde_json::json!({"$type": "User", "name": "Alice"}), &opts())
        .await
        .unwrap();
    let post = engine
        .create(
            "posts",
            &serde_json::json!({
                "$type": "Post",
                "title": "Hello",
                "author": {"alice": "users/1"}
            }),
            &opts(),
        )
        .await
        .unwrap();
    // the mapping-shaped field became an edge, not an attribute
    assert!(post.attributes.get_ref("author").is_none());
    let edges = engine
        .get_relationships("posts", &post.id.short_id, Some("author"), Direction::Outbound)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].to.to_string(), "users/1");
}

#[tokio::test]
async fn test_link_operators_in_update() {
    let engine = test_engine().await;
    engine
        .create("users", &serde_json::json!({"$type": "User", "name": "Alice"}), &opts())
        .await
        .unwrap();
    engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &opts())
        .await
        .unwrap();

    let updated = engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$link": {"author": "users/1"}})),
            &opts(),
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    let edges = engine
        .get_relationships("posts", "1", Some("author"), Direction::Outbound)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);

    engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$unlink": {"author": "users/1"}})),
            &opts(),
        )
        .await
        .unwrap();
    let edges = engine
        .get_relationships("posts", "1", Some("author"), Direction::Outbound)
        .await
        .unwrap();
    assert!(edges.is_empty());
}

#[tokio::test]
async fn test_push_operator() {
    let engine = test_engine().await;
    engine
        .create("posts", &serde_json::json!({"$type": "Post"}), &opts())
        .await
        .unwrap();
    engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$push": {"tags": "a"}})),
            &opts(),
        )
        .await
        .unwrap();
    let entity = engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$push": {"tags": ["b", "c"]}})),
            &opts(),
        )
        .await
        .unwrap();
    let parquedb_variant::Value::Array(tags) = entity.attributes.get_ref("tags").unwrap() else {
        panic!("tags is not a list");
    };
    assert_eq!(tags.len(), 3);
}

#[tokio::test]
async fn test_inc_non_numeric_is_validation() {
    let engine = test_engine().await;
    engine
        .create("posts", &serde_json::json!({"$type": "Post", "title": "x"}), &opts())
        .await
        .unwrap();
    let err = engine
        .update(
            "posts",
            "1",
            &mutation(serde_json::json!({"$inc": {"title": 1}})),
            &opts(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    // failed fast: no event appended
    let entity = engine.get("posts", "1", false).await.unwrap().unwrap();
    assert_eq!(entity.version, 1);
}
