use chrono::{DateTime, Utc};
use parquedb_lakehouse::compaction::{
    CompactionConfig, CompactionCoordinator, FileArrival, PROCESSING_TIMEOUT_MS,
};
use parquedb_lakehouse::paths::TargetFormat;
use parquedb_lakehouse::sql_coordinator_schema::execute_migration;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("opening in-memory db");
    execute_migration(pool.clone()).await.expect("migration");
    pool
}

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
}

fn arrival(writer: &str, file: &str, ts_ms: i64, size: i64) -> FileArrival {
    FileArrival {
        writer_id: writer.into(),
        file: file.into(),
        timestamp: at(ts_ms),
        size,
    }
}

fn config() -> CompactionConfig {
    CompactionConfig {
        window_size_ms: 1000,
        max_wait_time_ms: 500,
        min_files_to_compact: 1,
        target_format: TargetFormat::Native,
    }
}

#[tokio::test]
async fn test_two_writer_readiness() {
    let pool = test_pool().await;
    let coordinator = CompactionCoordinator::new(pool, "posts");
    let config = config();

    // writer-a fills the first window
    let first: Vec<FileArrival> = (0..10)
        .map(|i| {
            arrival(
                "writer-a",
                &format!("data/posts/pending/{i}-writer-a-{i}.parquet"),
                i,
                100,
            )
        })
        .collect();
    let ready = coordinator.update(&first, &config, at(10)).await.unwrap();
    assert!(ready.is_empty());

    // writer-b is active (recent arrival in the next window) but has not
    // contributed to the first one
    let ready = coordinator
        .update(
            &[arrival(
                "writer-b",
                "data/posts/pending/1200-writer-b-0.parquet",
                1200,
                100,
            )],
            &config,
            at(1250),
        )
        .await
        .unwrap();
    assert!(ready.is_empty());

    // past windowEnd + maxWait, but writer-b is active with no contribution
    // and the namespace is not quiescent: the window is withheld
    let ready = coordinator.update(&[], &config, at(1500)).await.unwrap();
    assert!(ready.is_empty());

    // writer-b's late files land in the first window; every active writer
    // has now contributed
    let second: Vec<FileArrival> = (0..5)
        .map(|i| {
            arrival(
                "writer-b",
                &format!("data/posts/pending/90{i}-writer-b-{i}.parquet"),
                900 + i,
                100,
            )
        })
        .collect();
    let ready = coordinator.update(&second, &config, at(1600)).await.unwrap();
    assert_eq!(ready.len(), 1);
    let window = &ready[0];
    assert_eq!(window.window_key, "posts:0");
    assert_eq!(window.files.len(), 15);
    assert_eq!(window.total_size, 1500);
    assert_eq!(window.writers, vec!["writer-a", "writer-b"]);
    let mut sorted = window.files.clone();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));
    assert_eq!(
        window.files.iter().map(|f| &f.path).collect::<Vec<_>>(),
        sorted.iter().map(|f| &f.path).collect::<Vec<_>>()
    );

    // once returned, repeated calls do not return it again
    let ready = coordinator.update(&[], &config, at(1700)).await.unwrap();
    assert!(ready.is_empty());

    coordinator
        .confirm_dispatch("posts:0", "wf-1", at(1800))
        .await
        .unwrap();
    let result = coordinator
        .workflow_complete("posts:0", "wf-1", true)
        .await
        .unwrap();
    assert!(!result.already_deleted);

    let status = coordinator.status().await.unwrap();
    assert!(status.windows.iter().all(|w| w.window_key != "posts:0"));
}

#[tokio::test]
async fn test_min_files_bound() {
    let pool = test_pool().await;
    let coordinator = CompactionCoordinator::new(pool, "posts");
    let config = CompactionConfig {
        min_files_to_compact: 3,
        ..config()
    };
    coordinator
        .update(
            &[
                arrival("w", "data/posts/pending/1-w-0.parquet", 1, 10),
                arrival("w", "data/posts/pending/2-w-1.parquet", 2, 10),
            ],
            &config,
            at(5),
        )
        .await
        .unwrap();
    // two files stay below the bound no matter how long we wait
    let ready = coordinator.update(&[], &config, at(10_000)).await.unwrap();
    assert!(ready.is_empty());
}

#[tokio::test]
async fn test_dispatch_protocol_conflicts() {
    let pool = test_pool().await;
    let coordinator = CompactionCoordinator::new(pool, "posts");
    let config = config();
    coordinator
        .update(
            &[arrival("w", "data/posts/pending/1-w-0.parquet", 1, 10)],
            &config,
            at(5),
        )
        .await
        .unwrap();
    let ready = coordinator.update(&[], &config, at(10_000)).await.unwrap();
    assert_eq!(ready.len(), 1);
    let key = ready[0].window_key.clone();

    // confirm on a pending window is a conflict
    let err = coordinator
        .confirm_dispatch("posts:999000", "wf", at(10_001))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);

    coordinator
        .confirm_dispatch(&key, "wf-1", at(10_002))
        .await
        .unwrap();
    // double confirm is a conflict
    assert!(coordinator.confirm_dispatch(&key, "wf-2", at(10_003)).await.is_err());

    // workflow id mismatch leaves the state unchanged
    let err = coordinator
        .workflow_complete(&key, "wf-other", true)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);

    // failure resets the window for retry
    coordinator
        .workflow_complete(&key, "wf-1", false)
        .await
        .unwrap();
    let ready = coordinator.update(&[], &config, at(10_010)).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].window_key, key);
}

#[tokio::test]
async fn test_rollback_processing() {
    let pool = test_pool().await;
    let coordinator = CompactionCoordinator::new(pool, "posts");
    let config = config();
    coordinator
        .update(
            &[arrival("w", "data/posts/pending/1-w-0.parquet", 1, 10)],
            &config,
            at(5),
        )
        .await
        .unwrap();
    let ready = coordinator.update(&[], &config, at(10_000)).await.unwrap();
    let key = ready[0].window_key.clone();

    coordinator.rollback_processing(&key).await.unwrap();
    // back in pending: returned again
    let ready = coordinator.update(&[], &config, at(10_100)).await.unwrap();
    assert_eq!(ready.len(), 1);
}

#[tokio::test]
async fn test_stuck_processing_window_recovery() {
    let pool = test_pool().await;
    let coordinator = CompactionCoordinator::new(pool, "posts");
    let config = config();
    coordinator
        .update(
            &[arrival("w", "data/posts/pending/1-w-0.parquet", 1, 10)],
            &config,
            at(5),
        )
        .await
        .unwrap();
    let ready = coordinator.update(&[], &config, at(10_000)).await.unwrap();
    assert_eq!(ready.len(), 1);

    // never confirmed; after the processing timeout the next update resets
    // and re-returns it
    let later = 10_000 + PROCESSING_TIMEOUT_MS + 1;
    let ready = coordinator.update(&[], &config, at(later)).await.unwrap();
    assert_eq!(ready.len(), 1);
}

#[tokio::test]
async fn test_unknown_window_completion_is_already_deleted() {
    let pool = test_pool().await;
    let coordinator = CompactionCoordinator::new(pool, "posts");
    let result = coordinator
        .workflow_complete("posts:424242", "wf", true)
        .await
        .unwrap();
    assert!(result.already_deleted);
}
