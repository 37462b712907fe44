use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

/// Atomically advances the counter for `(shard, ns)` by `count` and returns
/// the allocated `(first_seq, last_seq)` range.
///
/// Counters are created on first use and persist forever: the first
/// allocation after a shard restart continues from the last persisted value.
pub async fn allocate_seq_range(pool: &SqlitePool, ns: &str, count: i64) -> Result<(i64, i64)> {
    let row = sqlx::query(
        "INSERT INTO seq_counters(ns, value) VALUES($1, $2)
         ON CONFLICT(ns) DO UPDATE SET value = value + $2
         RETURNING value;",
    )
    .bind(ns)
    .bind(count)
    .fetch_one(pool)
    .await
    .with_context(|| format!("advancing sequence counter for {ns}"))?;
    let last_seq: i64 = row.try_get("value")?;
    Ok((last_seq - count + 1, last_seq))
}

/// The last allocated value for `ns`, 0 when the counter does not exist yet.
pub async fn current_seq(pool: &SqlitePool, ns: &str) -> Result<i64> {
    let row = sqlx::query(
        "SELECT value
         FROM seq_counters
         WHERE ns = $1;",
    )
    .bind(ns)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("reading sequence counter for {ns}"))?;
    match row {
        Some(row) => Ok(row.try_get("value")?),
        None => Ok(0),
    }
}

/// Rewinds the counter to a snapshot value. Only used by transaction
/// rollback, while the shard lock is held.
pub async fn restore_seq(pool: &SqlitePool, ns: &str, value: i64) -> Result<()> {
    sqlx::query(
        "UPDATE seq_counters
         SET value = $2
         WHERE ns = $1;",
    )
    .bind(ns)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("restoring sequence counter for {ns}"))?;
    Ok(())
}
