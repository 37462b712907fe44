use crate::event_buffer::NsBuffer;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parquedb_types::compression::{compress_payload, decompress_payload};
use parquedb_types::event::{Event, decode_event_batch, encode_event_batch};
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Metadata of one flushed WAL batch. The payload itself is the LZ4
/// compressed, count-prefixed event run.
#[derive(Debug, Clone)]
pub struct WalBatch {
    pub id: i64,
    pub ns: String,
    pub first_seq: i64,
    pub last_seq: i64,
    pub event_count: i64,
    pub size_bytes: i64,
    pub flushed_at: DateTime<Utc>,
}

/// Persists a namespace buffer as exactly one `events_wal` row.
pub async fn insert_wal_batch(pool: &SqlitePool, ns: &str, buffer: &NsBuffer) -> Result<()> {
    let payload = compress_payload(&encode_event_batch(&buffer.events))
        .with_context(|| "compressing wal payload")?;
    debug!(
        "flushing ns={ns} events={} first_seq={} last_seq={}",
        buffer.events.len(),
        buffer.first_seq,
        buffer.last_seq
    );
    sqlx::query(
        "INSERT INTO events_wal(ns, first_seq, last_seq, event_count, size_bytes, payload, flushed_at)
         VALUES($1, $2, $3, $4, $5, $6, $7);",
    )
    .bind(ns)
    .bind(buffer.first_seq)
    .bind(buffer.last_seq)
    .bind(buffer.event_count())
    .bind(buffer.size_bytes)
    .bind(&payload)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| "inserting into events_wal")?;
    Ok(())
}

fn batch_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WalBatch> {
    Ok(WalBatch {
        id: row.try_get("id")?,
        ns: row.try_get("ns")?,
        first_seq: row.try_get("first_seq")?,
        last_seq: row.try_get("last_seq")?,
        event_count: row.try_get("event_count")?,
        size_bytes: row.try_get("size_bytes")?,
        flushed_at: row.try_get("flushed_at")?,
    })
}

/// Lists flushed batches for `ns` in seq order, metadata only.
pub async fn list_wal_batches(pool: &SqlitePool, ns: &str) -> Result<Vec<WalBatch>> {
    let rows = sqlx::query(
        "SELECT id, ns, first_seq, last_seq, event_count, size_bytes, flushed_at
         FROM events_wal
         WHERE ns = $1
         ORDER BY first_seq;",
    )
    .bind(ns)
    .fetch_all(pool)
    .await
    .with_context(|| "listing wal batches")?;
    rows.iter().map(batch_from_row).collect()
}

/// Decodes all flushed events for `ns` in seq order.
pub async fn read_wal_events(pool: &SqlitePool, ns: &str) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "SELECT payload
         FROM events_wal
         WHERE ns = $1
         ORDER BY first_seq;",
    )
    .bind(ns)
    .fetch_all(pool)
    .await
    .with_context(|| "reading wal payloads")?;
    let mut events = vec![];
    for row in rows {
        let payload: Vec<u8> = row.try_get("payload")?;
        let decompressed = decompress_payload(&payload)?;
        events.extend(decode_event_batch(&decompressed).with_context(|| "decoding wal batch")?);
    }
    Ok(events)
}

/// Deletes batches wholly covered by `up_to_seq`. Returns the number of
/// deleted rows; a batch straddling the bound survives.
pub async fn delete_wal_batches(pool: &SqlitePool, ns: &str, up_to_seq: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM events_wal
         WHERE ns = $1
         AND last_seq <= $2;",
    )
    .bind(ns)
    .bind(up_to_seq)
    .execute(pool)
    .await
    .with_context(|| "deleting wal batches")?;
    Ok(result.rows_affected())
}
