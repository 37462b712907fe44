use anyhow::{Context, Result};
use sqlx::{Executor, Row};
use tracing::info;

/// The latest schema version for the coordinator database.
pub const LATEST_COORDINATOR_SCHEMA_VERSION: i32 = 1;

async fn create_compaction_tables(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    // timestamps are unix milliseconds so window arithmetic stays exact
    let sql = "
         CREATE TABLE compaction_windows(
                  ns TEXT NOT NULL,
                  window_start BIGINT NOT NULL,
                  window_end BIGINT NOT NULL,
                  last_activity_at BIGINT NOT NULL,
                  total_size BIGINT NOT NULL,
                  status TEXT NOT NULL,
                  started_at BIGINT,
                  workflow_id TEXT,
                  dispatched_at BIGINT,
                  PRIMARY KEY(ns, window_start));
         CREATE TABLE compaction_files(
                  ns TEXT NOT NULL,
                  window_start BIGINT NOT NULL,
                  writer_id TEXT NOT NULL,
                  file_path TEXT NOT NULL,
                  file_size BIGINT NOT NULL,
                  observed_at BIGINT NOT NULL,
                  PRIMARY KEY(ns, window_start, file_path));
         CREATE TABLE writer_activity(
                  ns TEXT NOT NULL,
                  writer_id TEXT NOT NULL,
                  last_seen BIGINT NOT NULL,
                  PRIMARY KEY(ns, writer_id));";
    tr.execute(sql)
        .await
        .with_context(|| String::from("Creating compaction tables"))?;
    Ok(())
}

async fn create_mv_refresh_tables(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    let sql = "
         CREATE TABLE mv_registry(
                  name TEXT PRIMARY KEY,
                  source TEXT NOT NULL,
                  refresh_mode TEXT NOT NULL);
         CREATE TABLE mv_refresh_state(
                  name TEXT NOT NULL,
                  status TEXT NOT NULL,
                  changed_files TEXT NOT NULL,
                  first_change_at BIGINT NOT NULL,
                  last_change_at BIGINT NOT NULL,
                  started_at BIGINT,
                  workflow_id TEXT,
                  dispatched_at BIGINT,
                  PRIMARY KEY(name, status));";
    tr.execute(sql)
        .await
        .with_context(|| String::from("Creating mv refresh tables"))?;
    Ok(())
}

async fn create_migration_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query("CREATE TABLE migration(version INTEGER);")
        .execute(&mut **tr)
        .await
        .with_context(|| String::from("Creating table migration"))?;
    sqlx::query("INSERT INTO migration VALUES(1);")
        .execute(&mut **tr)
        .await
        .with_context(|| String::from("Recording the initial schema version"))?;
    Ok(())
}

pub async fn create_tables(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    create_compaction_tables(tr).await?;
    create_mv_refresh_tables(tr).await?;
    create_migration_table(tr).await?;
    Ok(())
}

/// Reads the current schema version from the database.
pub async fn read_coordinator_schema_version(
    tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> i32 {
    match sqlx::query(
        "SELECT version
         FROM migration;",
    )
    .fetch_one(&mut **tr)
    .await
    {
        Ok(row) => row.get("version"),
        Err(e) => {
            info!("Error reading coordinator schema version, assuming version 0: {e}");
            0
        }
    }
}

/// Executes the database migration.
pub async fn execute_migration(pool: sqlx::SqlitePool) -> Result<()> {
    let mut current_version = read_coordinator_schema_version(&mut pool.begin().await?).await;
    if 0 == current_version {
        info!("creating v1 coordinator schema");
        let mut tr = pool.begin().await?;
        create_tables(&mut tr).await?;
        current_version = read_coordinator_schema_version(&mut tr).await;
        tr.commit().await.with_context(|| "commit")?;
    }
    assert_eq!(current_version, LATEST_COORDINATOR_SCHEMA_VERSION);
    Ok(())
}
