use crate::sql_shard_schema::create_tables;
use anyhow::{Context, Result};
use sqlx::Row;
use tracing::info;

/// The latest schema version for the shard database.
pub const LATEST_SHARD_SCHEMA_VERSION: i32 = 1;

/// Reads the current schema version from the database.
pub async fn read_shard_schema_version(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> i32 {
    match sqlx::query(
        "SELECT version
         FROM migration;",
    )
    .fetch_one(&mut **tr)
    .await
    {
        Ok(row) => row.get("version"),
        Err(e) => {
            info!("Error reading shard schema version, assuming version 0: {e}");
            0
        }
    }
}

/// Executes the database migration.
pub async fn execute_migration(pool: sqlx::SqlitePool) -> Result<()> {
    let mut current_version = read_shard_schema_version(&mut pool.begin().await?).await;
    if 0 == current_version {
        info!("creating v1 shard schema");
        let mut tr = pool.begin().await?;
        create_tables(&mut tr).await?;
        current_version = read_shard_schema_version(&mut tr).await;
        tr.commit().await.with_context(|| "commit")?;
    }
    assert_eq!(current_version, LATEST_SHARD_SCHEMA_VERSION);
    Ok(())
}
