use anyhow::{Context, Result};
use sqlx::Executor;

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

async fn create_seq_counters_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    let sql = "
         CREATE TABLE seq_counters(
                  ns TEXT PRIMARY KEY,
                  value BIGINT NOT NULL);";
    tr.execute(sql)
        .await
        .with_context(|| String::from("Creating table seq_counters"))?;
    Ok(())
}

async fn create_events_wal_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    // one row per flushed batch, never one row per event
    let sql = "
         CREATE TABLE events_wal(
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  ns TEXT NOT NULL,
                  first_seq BIGINT NOT NULL,
                  last_seq BIGINT NOT NULL,
                  event_count INTEGER NOT NULL,
                  size_bytes BIGINT NOT NULL,
                  payload BLOB NOT NULL,
                  flushed_at TEXT NOT NULL);
         CREATE INDEX events_wal_ns_last_seq on events_wal(ns, last_seq);";
    tr.execute(sql)
        .await
        .with_context(|| String::from("Creating table events_wal and its indices"))?;
    Ok(())
}

async fn create_pending_row_groups_table(
    tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> Result<()> {
    let sql = "
         CREATE TABLE pending_row_groups(
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  ns TEXT NOT NULL,
                  path TEXT NOT NULL,
                  row_count INTEGER NOT NULL,
                  first_seq BIGINT NOT NULL,
                  last_seq BIGINT NOT NULL,
                  created_at TEXT NOT NULL,
                  committed_at TEXT);
         CREATE INDEX pending_row_groups_ns_last_seq on pending_row_groups(ns, last_seq);";
    tr.execute(sql)
        .await
        .with_context(|| String::from("Creating table pending_row_groups and its indices"))?;
    Ok(())
}

async fn create_relationships_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    let sql = "
         CREATE TABLE relationships(
                  from_ns TEXT NOT NULL,
                  from_id TEXT NOT NULL,
                  predicate TEXT NOT NULL,
                  to_ns TEXT NOT NULL,
                  to_id TEXT NOT NULL,
                  from_type TEXT,
                  from_name TEXT,
                  to_type TEXT,
                  to_name TEXT,
                  match_mode TEXT,
                  similarity REAL,
                  data BLOB,
                  created_at TEXT NOT NULL,
                  version BIGINT NOT NULL,
                  deleted_at TEXT,
                  PRIMARY KEY(from_ns, from_id, predicate, to_ns, to_id));
         CREATE INDEX relationships_to on relationships(to_ns, to_id);";
    tr.execute(sql)
        .await
        .with_context(|| String::from("Creating table relationships and its indices"))?;
    Ok(())
}

pub async fn create_tables(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    create_seq_counters_table(tr).await?;
    create_events_wal_table(tr).await?;
    create_pending_row_groups_table(tr).await?;
    create_relationships_table(tr).await?;
    create_migration_table(tr).await?;
    Ok(())
}
